use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::orchestrator::RunState;

#[derive(Debug, Error)]
pub enum ScanError {
    /// Transport-level failure talking to the engine (connect, timeout, reset).
    #[error("scan engine unreachable during {operation}: {reason}")]
    EngineUnreachable { operation: String, reason: String },

    /// The engine answered, but rejected the call or returned something unusable.
    #[error("scan engine rejected {operation}: {reason}")]
    EngineError { operation: String, reason: String },

    #[error("{phase} did not complete within {waited:?}")]
    PhaseTimeout { phase: String, waited: Duration },

    #[error("failed to write report to {}: {source}", path.display())]
    ReportPersist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("run cancelled during {phase}")]
    Cancelled { phase: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ScanError {
    pub fn unreachable(operation: impl Into<String>, reason: impl ToString) -> Self {
        ScanError::EngineUnreachable {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn engine(operation: impl Into<String>, reason: impl ToString) -> Self {
        ScanError::EngineError {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Engine-side failures are the only ones a probe may recover from locally.
    pub fn is_engine_failure(&self) -> bool {
        matches!(
            self,
            ScanError::EngineUnreachable { .. } | ScanError::EngineError { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ScanError::EngineUnreachable { .. })
    }
}

/// Terminal error of a run: which state the run was in and why it stopped.
#[derive(Debug, Error)]
#[error("run failed while {phase}: {error}")]
pub struct RunFailure {
    pub phase: RunState,
    #[source]
    pub error: ScanError,
}

impl RunFailure {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, ScanError::Cancelled { .. })
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unreachable_is_retryable() {
        assert!(ScanError::unreachable("spider", "connection refused").is_retryable());
        assert!(!ScanError::engine("spider", "bad_scan_id").is_retryable());
        assert!(!ScanError::InvalidConfig("x".into()).is_retryable());
    }

    #[test]
    fn test_run_failure_names_phase() {
        let failure = RunFailure {
            phase: RunState::ActiveScanning,
            error: ScanError::PhaseTimeout {
                phase: "active scan".into(),
                waited: Duration::from_secs(30),
            },
        };
        let msg = failure.to_string();
        assert!(msg.contains("active scanning"));
        assert!(msg.contains("30s"));
    }
}
