//! Error types for minis-validation
//!
//! Campaign-level errors abort before anything is submitted. Task-level
//! failures are carried inside [`TaskRecord`](crate::campaign::TaskRecord)s as
//! [`TaskFailure`] values and never leave the orchestrator as `Err`.

use std::time::Duration;

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// minis-validation error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing job config / frequency file, invalid settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Simulator sub-process failure
    #[error("Task {task_id} failed: {reason}")]
    TaskExecution {
        /// Failed task
        task_id: String,
        /// Last error reported by the runner
        reason: String,
    },

    /// Simulator exceeded its wall-clock budget
    #[error("Task {task_id} timed out after {}s", .after.as_secs())]
    TaskTimeout {
        /// Timed out task
        task_id: String,
        /// Configured per-task timeout
        after: Duration,
    },

    /// Trace analysis error (reported per task)
    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    /// Cluster scheduler command failed
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Illegal task state transition (a bug in the caller)
    #[error("Invalid transition for task {task_id}: {from:?} -> {to}")]
    InvalidTransition {
        /// Task whose record rejected the transition
        task_id: String,
        /// Status before the attempted transition
        from: crate::campaign::TaskStatus,
        /// Requested transition
        to: &'static str,
    },

    /// Unknown campaign handle
    #[error("Unknown campaign handle: {0}")]
    UnknownCampaign(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Per-task analysis failures. These never abort a campaign.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    /// Nothing left after the mandatory settling-period discard
    #[error("trace of {duration_ms:.1} ms is shorter than the {discard_ms:.0} ms discard window")]
    TraceTooShort {
        /// Total recorded duration
        duration_ms: f64,
        /// Discarded settling period
        discard_ms: f64,
    },

    /// More peaks than recorded mini events (voltage-clamp artifacts)
    #[error("{peaks} peaks detected but only {events} mini events were recorded")]
    ImplausiblePeaks {
        /// Accepted peaks
        peaks: usize,
        /// Recorded mini events in the analyzed window
        events: usize,
    },

    /// Trace artifact unreadable or inconsistent
    #[error("malformed trace: {0}")]
    MalformedTrace(String),
}

/// Why one attempt of a task did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TaskFailure {
    /// Non-zero exit, spawn failure, missing or malformed output
    Execution(String),
    /// Wall-clock exceeded the per-task timeout
    Timeout {
        /// Timeout that was exceeded, in seconds
        after_s: u64,
    },
    /// Stopped by campaign cancellation
    Cancelled,
}

impl TaskFailure {
    /// Timeout failure for `limit`, rounded up to whole seconds.
    #[must_use]
    pub fn timeout(limit: Duration) -> Self {
        Self::Timeout {
            after_s: limit.as_secs() + u64::from(limit.subsec_nanos() > 0),
        }
    }

    /// Convert into the campaign error taxonomy.
    #[must_use]
    pub fn into_error(self, task_id: &str) -> Error {
        match self {
            Self::Timeout { after_s } => Error::TaskTimeout {
                task_id: task_id.to_string(),
                after: Duration::from_secs(after_s),
            },
            other => Error::TaskExecution {
                task_id: task_id.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execution(reason) => write!(f, "{reason}"),
            Self::Timeout { after_s } => write!(f, "timed out after {after_s}s"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
