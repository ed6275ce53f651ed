//! ---
//! cpilot_section: "01-lifecycle-foundation"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Shared configuration, error, logging and manifest primitives."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Failure taxonomy shared by every lifecycle stage.
///
/// `Transport` covers anything that might succeed on retry (sockets, DNS,
/// half-started control planes); `Provider` is a terminal status reported by
/// the cloud itself and is never retried.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("validation failed: {reason}")]
    Validation { reason: String },
    #[error("transport failure: {reason}")]
    Transport { reason: String },
    #[error("provider reported terminal status {status}: {reason}")]
    Provider { status: String, reason: String },
    #[error("{operation} did not finish within {waited_secs}s")]
    Timeout { operation: String, waited_secs: u64 },
    #[error("job {job} ended in failure: {reason}")]
    Job { job: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LifecycleError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn provider(status: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Provider {
            status: status.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            waited_secs: waited.as_secs(),
        }
    }

    pub fn job(job: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Job {
            job: job.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure is worth retrying at a polling cadence.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}
