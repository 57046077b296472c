//! Flow identifiers.

use crate::errors::FlowError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of one flow. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(String);

impl FlowId {
    /// Generates a fresh, time-ordered id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Accepts a caller-chosen id.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::InvalidRequest`] for empty ids or ids containing
    /// whitespace or `/`.
    pub fn parse(id: impl Into<String>) -> Result<Self, FlowError> {
        let id = id.into();
        if id.is_empty() {
            return Err(FlowError::InvalidRequest("flow id must not be empty".into()));
        }
        if id.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(FlowError::InvalidRequest(format!(
                "flow id '{id}' must not contain whitespace or '/'"
            )));
        }
        Ok(Self(id))
    }

    /// Returns the id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FlowId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
