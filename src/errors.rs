//! Error taxonomy for the load-generation/redline core.
//!
//! `CoreError` covers the handful of failures the core itself can raise
//! (configuration, worker crashes, runner/timeout failures, CPU-threshold
//! breaches, metrics-store errors). `RequestErrorType` is the coarser label
//! attached to a single failed sample for reporting and redline feedback.

use thiserror::Error;

/// Top-level error taxonomy for the load-generation core.
///
/// Configuration errors are fatal at start; the rest are reported per-request
/// or per-worker and handled according to `on.error` / redline mode.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("worker {0} has exited prematurely")]
    WorkerCrashed(usize),

    #[error("runner failure: {0}")]
    RunnerFailure(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("cpu usage on node {node} exceeded {limit_pct}% (observed {observed_pct}%)")]
    CpuThresholdExceeded {
        node: String,
        limit_pct: f64,
        observed_pct: f64,
    },

    #[error("metrics store error: {0}")]
    MetricsStore(String),
}

/// Classification of a single request failure, attached to
/// `request_meta_data["error-type"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestErrorType {
    Timeout,
    Transport,
    Runner,
    Unknown,
}

impl RequestErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestErrorType::Timeout => "timeout",
            RequestErrorType::Transport => "transport",
            RequestErrorType::Runner => "runner",
            RequestErrorType::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_error_type_labels() {
        assert_eq!(RequestErrorType::Timeout.as_str(), "timeout");
        assert_eq!(RequestErrorType::Transport.as_str(), "transport");
        assert_eq!(RequestErrorType::Runner.as_str(), "runner");
        assert_eq!(RequestErrorType::Unknown.as_str(), "unknown");
    }

    #[test]
    fn core_error_messages() {
        let err = CoreError::CpuThresholdExceeded {
            node: "node-1".into(),
            limit_pct: 90.0,
            observed_pct: 95.5,
        };
        assert!(err.to_string().contains("node-1"));
    }
}
