//! Structured error types for the queue.
//!
//! `anyhow` is the transport on the store and worker boundaries; the types
//! here are the errors callers are expected to match on. A store `insert`
//! surfaces [`ValidationError`] (recoverable by the submitter), everything
//! else from the database propagates as-is.

use thiserror::Error;

/// A single field/rule violation inside a [`ValidationError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

/// Insert-time validation failure, carrying every violated rule.
#[derive(Debug, Clone, Default, Error)]
#[error("invalid job: {}", render(.violations))]
pub struct ValidationError {
    pub violations: Vec<FieldError>,
}

fn render(violations: &[FieldError]) -> String {
    violations
        .iter()
        .map(|v| format!("{} {}", v.field, v.message))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ValidationError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.violations.push(FieldError {
            field,
            message: message.into(),
        });
    }

    /// Whether a rule on `field` was violated.
    pub fn violates(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }

    /// `Ok(())` when no rule was violated, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

/// A status value outside the persisted range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("job status out of range: {0}")]
pub struct InvalidStatus(pub i16);

/// Why a graceful dispatcher stop did not complete cleanly.
#[derive(Debug, Error)]
pub enum StopError {
    /// The deadline expired with executions still running. Their leases have
    /// been surrendered so another process can pick the jobs up.
    #[error("stop deadline exceeded with executions still running")]
    DeadlineExceeded,
    /// Surrendering the leases itself failed; the rows stay pinned until the
    /// next process start reclaims them.
    #[error(transparent)]
    Release(#[from] anyhow::Error),
}
