//! Documents, batches and replica replies.

use serde::{Deserialize, Serialize};

/// A single unit of data identified by `id`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Document {
    /// Identity used when reducing.
    pub id: String,
    /// Free-form attributes set by executors.
    #[serde(default)]
    pub tags: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    /// Creates an untagged document.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tags: serde_json::Map::new(),
        }
    }

    /// Sets a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.tags.insert(key.into(), value);
        self
    }

    /// Returns a tag value.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&serde_json::Value> {
        self.tags.get(key)
    }
}

/// Documents produced by one pod for one logical request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultBatch {
    /// Originating pod (or `gateway`).
    pub pod: String,
    /// Originating shard; `None` once shards have been combined.
    pub shard: Option<usize>,
    /// The documents.
    pub docs: Vec<Document>,
}

impl ResultBatch {
    /// Creates a batch produced by one shard.
    #[must_use]
    pub fn from_shard(pod: impl Into<String>, shard: usize, docs: Vec<Document>) -> Self {
        Self {
            pod: pod.into(),
            shard: Some(shard),
            docs,
        }
    }

    /// Creates a batch that is not tied to a single shard.
    #[must_use]
    pub fn combined(pod: impl Into<String>, docs: Vec<Document>) -> Self {
        Self {
            pod: pod.into(),
            shard: None,
            docs,
        }
    }

    /// Returns the number of documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Returns true if the batch has no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Returns the document ids in order.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.docs.iter().map(|d| d.id.as_str()).collect()
    }
}

/// One replica's answer to a request, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Shard index of the answering replica.
    pub shard: usize,
    /// Replica index within the shard.
    pub replica: usize,
    /// What it produced.
    pub batch: ResultBatch,
}

impl Reply {
    /// Creates a reply.
    #[must_use]
    pub fn new(shard: usize, replica: usize, batch: ResultBatch) -> Self {
        Self {
            shard,
            replica,
            batch,
        }
    }
}
