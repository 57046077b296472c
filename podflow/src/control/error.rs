//! Caller-facing errors.

use crate::errors::{ErrorCategory, FlowError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// An error as reported to a caller: a status code, a category and a
/// human-readable detail. Internal error types never cross this boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{status} ({category}): {detail}")]
pub struct ControlError {
    /// HTTP-equivalent status code.
    pub status: u16,
    /// Error category.
    pub category: ErrorCategory,
    /// What went wrong.
    pub detail: String,
    /// Whether resubmitting may succeed.
    pub retryable: bool,
}

impl ControlError {
    /// Reports an error with the status code of its category.
    #[must_use]
    pub fn classified(error: &FlowError) -> Self {
        Self::with_status(error.category().status_code(), error)
    }

    /// Reports a failed create, update or scale. These are all bad
    /// requests, except conflicts and an unavailable registry.
    #[must_use]
    pub fn rejected(error: &FlowError) -> Self {
        let status = match error.category() {
            category @ (ErrorCategory::Conflict | ErrorCategory::Unavailable) => category.status_code(),
            ErrorCategory::NotFound | ErrorCategory::BadRequest | ErrorCategory::Forbidden => {
                ErrorCategory::BadRequest.status_code()
            }
        };
        Self::with_status(status, error)
    }

    fn with_status(status: u16, error: &FlowError) -> Self {
        let detail = error.summary();
        if detail != error.to_string() {
            warn!(status, error = %error, "Request failed");
        }
        Self {
            status,
            category: error.category(),
            detail,
            retryable: error.is_retryable(),
        }
    }
}
