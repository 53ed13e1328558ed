//! Tests for error types

use std::time::Duration;

use minis_validation::campaign::TaskStatus;
use minis_validation::{AnalysisError, Error, TaskFailure};

#[test]
fn test_config_error() {
    let error = Error::Config("missing results.frequency".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Configuration error"));
    assert!(error_str.contains("missing results.frequency"));
}

#[test]
fn test_task_execution_error() {
    let error = Error::TaskExecution {
        task_id: "PC_Exc-f0.100-r000".to_string(),
        reason: "simulator exited with exit status: 1".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("PC_Exc-f0.100-r000"));
    assert!(error_str.contains("exit status: 1"));
}

#[test]
fn test_task_timeout_error() {
    let error = Error::TaskTimeout {
        task_id: "PC_Exc-f0.100-r000".to_string(),
        after: Duration::from_secs(90),
    };
    assert_eq!(format!("{error}"), "Task PC_Exc-f0.100-r000 timed out after 90s");
}

#[test]
fn test_invalid_transition_error() {
    let error = Error::InvalidTransition {
        task_id: "t".to_string(),
        from: TaskStatus::Succeeded,
        to: "Submitted",
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Succeeded -> Submitted"));
}

#[test]
fn test_analysis_errors() {
    let error = AnalysisError::TraceTooShort {
        duration_ms: 500.0,
        discard_ms: 1000.0,
    };
    assert_eq!(
        format!("{error}"),
        "trace of 500.0 ms is shorter than the 1000 ms discard window"
    );

    let error = Error::from(AnalysisError::ImplausiblePeaks { peaks: 12, events: 3 });
    let error_str = format!("{error}");
    assert!(error_str.starts_with("Analysis error"));
    assert!(error_str.contains("12 peaks"));
}

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "trace.parquet");
    let error: Error = io.into();
    assert!(matches!(error, Error::Io(_)));
    assert!(format!("{error}").contains("trace.parquet"));
}

#[test]
fn test_task_failure_into_error() {
    let error = TaskFailure::Timeout { after_s: 5 }.into_error("t1");
    assert!(matches!(error, Error::TaskTimeout { after, .. } if after == Duration::from_secs(5)));

    let error = TaskFailure::Cancelled.into_error("t1");
    assert!(matches!(error, Error::TaskExecution { ref reason, .. } if reason == "cancelled"));

    let error = TaskFailure::Execution("boom".to_string()).into_error("t1");
    assert_eq!(format!("{error}"), "Task t1 failed: boom");
}

#[test]
fn test_timeout_rounds_up_to_whole_seconds() {
    assert_eq!(
        TaskFailure::timeout(Duration::from_millis(200)),
        TaskFailure::Timeout { after_s: 1 }
    );
    assert_eq!(
        TaskFailure::timeout(Duration::from_secs(600)),
        TaskFailure::Timeout { after_s: 600 }
    );
    assert_eq!(
        TaskFailure::timeout(Duration::from_millis(1500)).to_string(),
        "timed out after 2s"
    );
}
