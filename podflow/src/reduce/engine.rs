//! The reduction engine.
//!
//! Combination rules, applied per logical request:
//!
//! 1. Shard outputs of a pod are always reduced into one batch. `ALL` polling
//!    requires an answer from every shard; `ANY` takes whatever shards
//!    answered first. Extra replies from the same shard are discarded. A
//!    single-shard pod passes its first reply through untouched.
//! 2. A pod with several needs receives one batch per need, in `needs`
//!    order, and its outputs are concatenated. Nothing is merged across needs.
//! 3. A join node reduces over all of its needs as if they were shards of one
//!    virtual pod and sees exactly one batch.
//! 4. External pods reduce their own shards; the flow merges whatever the
//!    owner hands back without checking it against a shard layout it cannot
//!    see.

use super::{Document, Reply, ResultBatch};
use crate::errors::ReductionError;
use crate::topology::{PodKind, PodSpec, PollingPolicy, Topology, GATEWAY};
use std::collections::{BTreeMap, HashMap};

/// Merges documents with equal ids, keeping first-seen order.
///
/// Tags of later duplicates fill in keys the first occurrence lacks; on
/// conflicting keys the first occurrence wins.
#[must_use]
pub fn merge_documents<'a, I>(batches: I) -> Vec<Document>
where
    I: IntoIterator<Item = &'a ResultBatch>,
{
    let mut merged: Vec<Document> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();

    for doc in batches.into_iter().flat_map(|b| b.docs.iter()) {
        match position.get(&doc.id) {
            Some(&i) => {
                let target = &mut merged[i].tags;
                for (key, value) in &doc.tags {
                    target.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            None => {
                position.insert(doc.id.clone(), merged.len());
                merged.push(doc.clone());
            }
        }
    }

    merged
}

/// Applies the combination rules for one topology.
#[derive(Debug, Clone, Copy)]
pub struct ReductionEngine<'t> {
    topology: &'t Topology,
}

impl<'t> ReductionEngine<'t> {
    /// Creates an engine over a topology.
    #[must_use]
    pub fn new(topology: &'t Topology) -> Self {
        Self { topology }
    }

    fn pod(&self, name: &str) -> Result<&'t PodSpec, ReductionError> {
        self.topology
            .pod(name)
            .ok_or_else(|| ReductionError::UnknownPod(name.to_string()))
    }

    /// Reduces the replies of `pod` to one request into a single batch.
    ///
    /// # Errors
    ///
    /// Fails when nothing answered, when a shard is silent under `ALL`
    /// polling, or when a reply names a shard or replica the pod lacks.
    pub fn reduce_pod(&self, pod: &str, replies: &[Reply]) -> Result<ResultBatch, ReductionError> {
        let spec = self.pod(pod)?;
        if replies.is_empty() {
            return Err(ReductionError::NoReplies(pod.to_string()));
        }

        if let PodKind::External { .. } = spec.kind {
            let docs = merge_documents(replies.iter().map(|r| &r.batch));
            return Ok(ResultBatch::combined(pod, docs));
        }

        if let Some(stray) = replies
            .iter()
            .find(|r| r.shard >= spec.shards || r.replica >= spec.replicas)
        {
            return Err(ReductionError::UnknownUnit {
                pod: pod.to_string(),
                shard: stray.shard,
                replica: stray.replica,
            });
        }

        // First reply per shard wins; later replicas of that shard are laggards.
        let mut per_shard: BTreeMap<usize, &Reply> = BTreeMap::new();
        for reply in replies {
            per_shard.entry(reply.shard).or_insert(reply);
        }

        if spec.polling == PollingPolicy::All {
            if let Some(shard) = (0..spec.shards).find(|s| !per_shard.contains_key(s)) {
                return Err(ReductionError::MissingShard {
                    pod: pod.to_string(),
                    shard,
                });
            }
        }

        if spec.shards == 1 {
            let first = &replies[0].batch;
            return Ok(ResultBatch::combined(pod, first.docs.clone()));
        }

        let docs = merge_documents(per_shard.values().map(|r| &r.batch));
        Ok(ResultBatch::combined(pod, docs))
    }

    /// Returns the batches handed to `pod` for one request.
    ///
    /// Join nodes get one reduced batch; every other pod gets one batch per
    /// need in `needs` order.
    ///
    /// # Errors
    ///
    /// Fails if an upstream output is missing or the pod is unknown.
    pub fn inputs_for(
        &self,
        pod: &str,
        gateway: &ResultBatch,
        outputs: &HashMap<String, ResultBatch>,
    ) -> Result<Vec<ResultBatch>, ReductionError> {
        let spec = self.pod(pod)?;
        let mut upstream = Vec::with_capacity(spec.needs.len());
        for need in &spec.needs {
            let batch = if need == GATEWAY {
                gateway
            } else {
                outputs.get(need).ok_or_else(|| ReductionError::MissingUpstream {
                    pod: pod.to_string(),
                    upstream: need.clone(),
                })?
            };
            upstream.push(batch);
        }

        if spec.reduces_needs() {
            let docs = merge_documents(upstream);
            return Ok(vec![ResultBatch::combined(pod, docs)]);
        }

        Ok(upstream.into_iter().cloned().collect())
    }

    /// Concatenates batches in order into one batch attributed to `pod`.
    #[must_use]
    pub fn concatenate(pod: &str, batches: Vec<ResultBatch>) -> ResultBatch {
        let docs = batches.into_iter().flat_map(|b| b.docs).collect();
        ResultBatch::combined(pod, docs)
    }

    /// Builds the flow's response from the outputs of its sink pods.
    ///
    /// # Errors
    ///
    /// Fails if a sink has not produced an output.
    pub fn flow_output(&self, outputs: &HashMap<String, ResultBatch>) -> Result<ResultBatch, ReductionError> {
        let mut batches = Vec::new();
        for sink in self.topology.sinks() {
            let batch = outputs.get(&sink.name).ok_or_else(|| ReductionError::MissingUpstream {
                pod: GATEWAY.to_string(),
                upstream: sink.name.clone(),
            })?;
            batches.push(batch.clone());
        }
        Ok(Self::concatenate(GATEWAY, batches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{PodDeclaration, TopologyBuilder};
    use pretty_assertions::assert_eq;

    fn docs(prefix: &str, n: usize) -> Vec<Document> {
        (0..n).map(|i| Document::new(format!("{prefix}{i}"))).collect()
    }

    fn sharded(shards: usize, replicas: usize, polling: PollingPolicy) -> Topology {
        TopologyBuilder::new()
            .add(
                PodDeclaration::new("indexer")
                    .shards(shards)
                    .replicas(replicas)
                    .polling(polling),
            )
            .build()
            .unwrap()
    }

    fn reply(shard: usize, replica: usize, docs: Vec<Document>) -> Reply {
        Reply::new(shard, replica, ResultBatch::from_shard("indexer", shard, docs))
    }

    #[test]
    fn test_merge_documents_keeps_first_seen_order() {
        let a = ResultBatch::combined("a", vec![
            Document::new("1").with_tag("x", serde_json::json!(1)),
            Document::new("2"),
        ]);
        let b = ResultBatch::combined("b", vec![
            Document::new("3"),
            Document::new("1").with_tag("x", serde_json::json!(9)).with_tag("y", serde_json::json!(2)),
        ]);

        let merged = merge_documents([&a, &b]);

        let ids: Vec<_> = merged.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(merged[0].tag("x"), Some(&serde_json::json!(1)));
        assert_eq!(merged[0].tag("y"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn test_shard_reduction_yields_one_batch_for_all_polling() {
        for shards in 2..=4 {
            let topology = sharded(shards, 2, PollingPolicy::All);
            let engine = ReductionEngine::new(&topology);
            let replies: Vec<_> = (0..shards).map(|s| reply(s, 0, docs("d", 50))).collect();

            let out = engine.reduce_pod("indexer", &replies).unwrap();

            assert_eq!(out.len(), 50);
            assert!(out.shard.is_none());
        }
    }

    #[test]
    fn test_shard_reduction_unions_disjoint_partitions() {
        let topology = sharded(2, 1, PollingPolicy::All);
        let engine = ReductionEngine::new(&topology);
        let replies = vec![reply(1, 0, docs("b", 25)), reply(0, 0, docs("a", 25))];

        let out = engine.reduce_pod("indexer", &replies).unwrap();

        assert_eq!(out.len(), 50);
        assert_eq!(out.docs[0].id, "a0");
    }

    #[test]
    fn test_all_polling_requires_every_shard() {
        let topology = sharded(3, 1, PollingPolicy::All);
        let engine = ReductionEngine::new(&topology);
        let replies = vec![reply(0, 0, docs("d", 5)), reply(2, 0, docs("d", 5))];

        let err = engine.reduce_pod("indexer", &replies).unwrap_err();
        assert_eq!(err, ReductionError::MissingShard { pod: "indexer".into(), shard: 1 });
    }

    #[test]
    fn test_any_polling_tolerates_silent_shards_and_drops_laggards() {
        let topology = sharded(2, 2, PollingPolicy::Any);
        let engine = ReductionEngine::new(&topology);
        let replies = vec![
            reply(0, 1, docs("fast", 3)),
            reply(0, 0, docs("slow", 3)),
        ];

        let out = engine.reduce_pod("indexer", &replies).unwrap();
        assert_eq!(out.ids(), vec!["fast0", "fast1", "fast2"]);
    }

    #[test]
    fn test_single_shard_is_identity() {
        let topology = sharded(1, 2, PollingPolicy::All);
        let engine = ReductionEngine::new(&topology);
        let duplicated = vec![Document::new("x"), Document::new("x")];
        let replies = vec![reply(0, 1, duplicated.clone()), reply(0, 0, docs("y", 1))];

        let out = engine.reduce_pod("indexer", &replies).unwrap();
        assert_eq!(out.docs, duplicated);
    }

    #[test]
    fn test_rejects_unknown_units_and_empty_replies() {
        let topology = sharded(2, 1, PollingPolicy::Any);
        let engine = ReductionEngine::new(&topology);

        assert!(matches!(
            engine.reduce_pod("indexer", &[reply(2, 0, Vec::new())]),
            Err(ReductionError::UnknownUnit { shard: 2, .. })
        ));
        assert_eq!(
            engine.reduce_pod("indexer", &[]),
            Err(ReductionError::NoReplies("indexer".into()))
        );
        assert_eq!(
            engine.reduce_pod("ghost", &[]),
            Err(ReductionError::UnknownPod("ghost".into()))
        );
    }

    #[test]
    fn test_external_pod_is_reduced_without_layout_checks() {
        let topology = TopologyBuilder::new()
            .add(
                PodDeclaration::new("ext")
                    .external()
                    .address("10.0.0.1", 4000)
                    .shards(2)
                    .polling(PollingPolicy::All),
            )
            .build()
            .unwrap();
        let engine = ReductionEngine::new(&topology);
        let replies = vec![
            Reply::new(5, 3, ResultBatch::from_shard("ext", 5, docs("d", 50))),
        ];

        let out = engine.reduce_pod("ext", &replies).unwrap();
        assert_eq!(out.len(), 50);
    }

    #[test]
    fn test_needs_are_concatenated_in_declaration_order() {
        let topology = TopologyBuilder::new()
            .add(PodDeclaration::new("a"))
            .add(PodDeclaration::new("b").needs([GATEWAY]))
            .add(PodDeclaration::new("sink").needs(["b", "a"]))
            .build()
            .unwrap();
        let engine = ReductionEngine::new(&topology);
        let gateway = ResultBatch::combined(GATEWAY, Vec::new());
        let outputs: HashMap<String, ResultBatch> = [
            ("a".to_string(), ResultBatch::combined("a", docs("d", 50))),
            ("b".to_string(), ResultBatch::combined("b", docs("d", 50))),
        ]
        .into_iter()
        .collect();

        let inputs = engine.inputs_for("sink", &gateway, &outputs).unwrap();

        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].pod, "b");
        assert_eq!(inputs[1].pod, "a");
        assert_eq!(ReductionEngine::concatenate("sink", inputs).len(), 100);
    }

    #[test]
    fn test_join_reduces_needs() {
        let topology = TopologyBuilder::new()
            .add(PodDeclaration::new("a"))
            .add(PodDeclaration::new("b").needs([GATEWAY]))
            .add(PodDeclaration::join(["a", "b"]).address("0.0.0.0", 6000))
            .build()
            .unwrap();
        let engine = ReductionEngine::new(&topology);
        let gateway = ResultBatch::combined(GATEWAY, Vec::new());
        let outputs: HashMap<String, ResultBatch> = [
            ("a".to_string(), ResultBatch::combined("a", docs("d", 50))),
            ("b".to_string(), ResultBatch::combined("b", docs("d", 50))),
        ]
        .into_iter()
        .collect();

        let inputs = engine.inputs_for("joiner", &gateway, &outputs).unwrap();

        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].len(), 50);
    }

    #[test]
    fn test_missing_upstream() {
        let topology = TopologyBuilder::new()
            .add(PodDeclaration::new("a"))
            .add(PodDeclaration::new("b"))
            .build()
            .unwrap();
        let engine = ReductionEngine::new(&topology);
        let gateway = ResultBatch::combined(GATEWAY, Vec::new());

        let err = engine.inputs_for("b", &gateway, &HashMap::new()).unwrap_err();
        assert_eq!(err, ReductionError::MissingUpstream { pod: "b".into(), upstream: "a".into() });
        assert!(engine.flow_output(&HashMap::new()).is_err());
    }
}
