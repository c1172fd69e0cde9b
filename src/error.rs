// src/error.rs
//
// Error taxonomy shared by every stage. Frame and extraction errors are
// absorbed inside the pipeline; only config and session lookups ever reach
// the serving layer as `Err`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrashGuardError {
    /// Camera or sensor lost. The session degrades, it does not terminate.
    #[error("frame source unavailable: {0}")]
    SourceUnavailable(String),

    /// Single-frame data quality problem. The frame is left out of the window.
    #[error("extraction degraded on frame {sequence}: {reason}")]
    ExtractionDegraded { sequence: u64, reason: String },

    /// A single dispatch attempt failed. Retried per policy.
    #[error("dispatch to {endpoint} failed: {reason}")]
    DispatchFailed { endpoint: String, reason: String },

    /// Malformed configuration at startup. The session does not start.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CrashGuardError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigInvalid(reason.into())
    }

    pub fn dispatch(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DispatchFailed {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CrashGuardError>;
