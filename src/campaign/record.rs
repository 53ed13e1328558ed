//! Task Record - execution state of one simulation task
//!
//! ## State machine
//!
//! ```text
//! Pending ──> Submitted ──> Running ──> Succeeded
//!                 ^   \          |
//!                 |    \         v
//!             Retrying <── Failed / TimedOut ──(attempts exhausted)──> Failed (final)
//! ```
//!
//! Both execution backends drive records through the same transitions, so the
//! retry budget and backoff behave identically locally and on a cluster.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;
use crate::error::TaskFailure;
use crate::{Error, Result};

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Created, never submitted.
    Pending,
    /// Handed to the backend, waiting for a worker.
    Submitted,
    /// Simulator is executing.
    Running,
    /// Artifact written.
    Succeeded,
    /// Attempt failed; final once the attempt budget is spent.
    Failed,
    /// Attempt exceeded the per-task timeout.
    TimedOut,
    /// Waiting for the backoff delay before resubmission.
    Retrying,
}

/// Delay between a failed attempt and its resubmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed(Duration),
    /// `base * 2^(failures - 1)`, capped at `max`.
    Exponential {
        /// Delay after the first failure
        base: Duration,
        /// Upper bound
        max: Duration,
    },
}

impl Backoff {
    /// Delay after the given number of failed attempts (1-based).
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { base, max } => {
                let shift = failures.saturating_sub(1).min(31);
                base.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

/// Retry and timeout policy shared by all backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts per task, first attempt included.
    pub max_retries: u32,
    /// Delay before resubmitting a failed attempt.
    pub backoff: Backoff,
    /// Per-task wall-clock budget.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Create a validated policy.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `max_retries` or `timeout` is zero.
    pub fn new(max_retries: u32, backoff: Backoff, timeout: Duration) -> Result<Self> {
        if max_retries == 0 {
            return Err(Error::Config("max retries must allow at least one attempt".to_string()));
        }
        if timeout.is_zero() {
            return Err(Error::Config("per-task timeout must be positive".to_string()));
        }
        Ok(Self {
            max_retries,
            backoff,
            timeout,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            timeout: Duration::from_secs(3600),
        }
    }
}

/// What happens to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Resubmit after the delay.
    Retry(Duration),
    /// Attempt budget spent; the task is permanently failed.
    Exhausted,
}

/// Execution state of one task. Owned and mutated by an execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    task_id: TaskId,
    index: usize,
    status: TaskStatus,
    attempts: u32,
    max_attempts: u32,
    settled: bool,
    artifact: Option<PathBuf>,
    last_error: Option<TaskFailure>,
    submitted_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    resumed: bool,
}

impl TaskRecord {
    /// Create a record in Pending status.
    #[must_use]
    pub fn new(task_id: TaskId, index: usize, max_attempts: u32) -> Self {
        Self {
            task_id,
            index,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            settled: false,
            artifact: None,
            last_error: None,
            submitted_at: None,
            started_at: None,
            ended_at: None,
            resumed: false,
        }
    }

    /// Record for a task whose artifact already exists from an earlier run.
    #[must_use]
    pub fn resumed(task_id: TaskId, index: usize, artifact: PathBuf) -> Self {
        Self {
            status: TaskStatus::Succeeded,
            artifact: Some(artifact),
            ended_at: Some(Utc::now()),
            resumed: true,
            ..Self::new(task_id, index, 0)
        }
    }

    /// Task identifier.
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Matrix index of the task.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        self.status
    }

    /// Attempts started so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempt budget.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Trace artifact, once Succeeded.
    #[must_use]
    pub fn artifact(&self) -> Option<&Path> {
        self.artifact.as_deref()
    }

    /// Reason of the last failed attempt.
    #[must_use]
    pub const fn last_error(&self) -> Option<&TaskFailure> {
        self.last_error.as_ref()
    }

    /// Whether the artifact came from an earlier run.
    #[must_use]
    pub const fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Time of the latest submission.
    #[must_use]
    pub const fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    /// Time the latest attempt started running.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Time the record reached its terminal state.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Succeeded, or Failed with nothing left to try.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Succeeded) || self.settled
    }

    /// Terminal and successful.
    #[must_use]
    pub const fn is_succeeded(&self) -> bool {
        matches!(self.status, TaskStatus::Succeeded)
    }

    /// Terminal and failed.
    #[must_use]
    pub const fn is_permanently_failed(&self) -> bool {
        self.settled
    }

    fn reject(&self, to: &'static str) -> Error {
        Error::InvalidTransition {
            task_id: self.task_id.to_string(),
            from: self.status,
            to,
        }
    }

    /// Pending/Retrying → Submitted, starting a new attempt.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTransition` from any other status or when the
    /// attempt budget is spent.
    pub fn submit(&mut self) -> Result<()> {
        let eligible = matches!(self.status, TaskStatus::Pending | TaskStatus::Retrying);
        if !eligible || self.attempts >= self.max_attempts {
            return Err(self.reject("Submitted"));
        }
        self.attempts += 1;
        self.status = TaskStatus::Submitted;
        self.submitted_at = Some(Utc::now());
        self.started_at = None;
        Ok(())
    }

    /// Submitted → Running.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTransition` from any other status.
    pub fn start(&mut self) -> Result<()> {
        if self.status != TaskStatus::Submitted {
            return Err(self.reject("Running"));
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Submitted/Running → Succeeded.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTransition` from any other status.
    pub fn succeed(&mut self, artifact: PathBuf) -> Result<()> {
        if !matches!(self.status, TaskStatus::Submitted | TaskStatus::Running) {
            return Err(self.reject("Succeeded"));
        }
        self.status = TaskStatus::Succeeded;
        self.artifact = Some(artifact);
        self.last_error = None;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Submitted/Running → Failed or TimedOut. Call [`settle`](Self::settle)
    /// afterwards to decide between retry and permanent failure.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTransition` from any other status.
    pub fn fail(&mut self, failure: TaskFailure) -> Result<()> {
        if !matches!(self.status, TaskStatus::Submitted | TaskStatus::Running) {
            return Err(self.reject("Failed"));
        }
        self.status = match failure {
            TaskFailure::Timeout { .. } => TaskStatus::TimedOut,
            _ => TaskStatus::Failed,
        };
        self.last_error = Some(failure);
        Ok(())
    }

    /// Failed/TimedOut → Retrying, or → Failed (final) once the budget is spent.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTransition` unless the last attempt failed.
    pub fn settle(&mut self, backoff: &Backoff) -> Result<Settlement> {
        if self.settled || !matches!(self.status, TaskStatus::Failed | TaskStatus::TimedOut) {
            return Err(self.reject("Retrying"));
        }
        if self.attempts < self.max_attempts {
            self.status = TaskStatus::Retrying;
            return Ok(Settlement::Retry(backoff.delay(self.attempts)));
        }
        self.status = TaskStatus::Failed;
        self.settled = true;
        self.ended_at = Some(Utc::now());
        Ok(Settlement::Exhausted)
    }

    /// Permanently fail a task that has not reached a terminal state.
    ///
    /// Returns `false` for records that are already terminal, which are
    /// left untouched.
    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.last_error = Some(TaskFailure::Cancelled);
        self.settled = true;
        self.ended_at = Some(Utc::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(max_attempts: u32) -> TaskRecord {
        TaskRecord::new(TaskId::from("PC_Exc-f0.100-r000"), 0, max_attempts)
    }

    #[test]
    fn test_record_default() {
        let record = record(3);
        assert_eq!(record.status(), TaskStatus::Pending);
        assert_eq!(record.attempts(), 0);
        assert!(!record.is_terminal());
    }

    #[test]
    fn test_success_lifecycle() {
        let mut record = record(3);
        record.submit().unwrap();
        record.start().unwrap();
        record.succeed(PathBuf::from("out.parquet")).unwrap();

        assert_eq!(record.status(), TaskStatus::Succeeded);
        assert!(record.is_terminal());
        assert_eq!(record.attempts(), 1);
        assert!(record.ended_at().is_some());
    }

    #[test]
    fn test_retry_until_exhausted() {
        let mut record = record(2);
        let backoff = Backoff::Fixed(Duration::from_millis(5));

        record.submit().unwrap();
        record.fail(TaskFailure::Execution("exit 1".into())).unwrap();
        assert_eq!(record.settle(&backoff).unwrap(), Settlement::Retry(Duration::from_millis(5)));
        assert_eq!(record.status(), TaskStatus::Retrying);
        assert!(!record.is_terminal());

        record.submit().unwrap();
        record.start().unwrap();
        record.fail(TaskFailure::Timeout { after_s: 10 }).unwrap();
        assert_eq!(record.status(), TaskStatus::TimedOut);
        assert_eq!(record.settle(&backoff).unwrap(), Settlement::Exhausted);

        assert_eq!(record.status(), TaskStatus::Failed);
        assert!(record.is_permanently_failed());
        assert_eq!(record.attempts(), 2);
        assert_eq!(record.last_error(), Some(&TaskFailure::Timeout { after_s: 10 }));
        assert!(record.submit().is_err(), "no attempt beyond the budget");
    }

    #[test]
    fn test_success_on_last_attempt() {
        let mut record = record(2);
        record.submit().unwrap();
        record.fail(TaskFailure::Execution("exit 1".into())).unwrap();
        record.settle(&Backoff::Fixed(Duration::ZERO)).unwrap();
        record.submit().unwrap();
        record.succeed(PathBuf::from("out.parquet")).unwrap();

        assert!(record.is_succeeded());
        assert!(!record.is_permanently_failed());
        assert_eq!(record.last_error(), None);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut record = record(1);
        record.submit().unwrap();
        record.succeed(PathBuf::from("out.parquet")).unwrap();

        assert!(record.start().is_err());
        assert!(record.fail(TaskFailure::Cancelled).is_err());
        assert!(!record.cancel());
        assert_eq!(record.status(), TaskStatus::Succeeded);
    }

    #[test]
    fn test_cancel_pending() {
        let mut record = record(3);
        assert!(record.cancel());
        assert!(record.is_permanently_failed());
        assert_eq!(record.last_error(), Some(&TaskFailure::Cancelled));
        assert!(record.submit().is_err());
    }

    #[test]
    fn test_resumed_record() {
        let record = TaskRecord::resumed(TaskId::from("t"), 4, PathBuf::from("t.trace.parquet"));
        assert!(record.is_succeeded());
        assert!(record.is_resumed());
        assert_eq!(record.attempts(), 0);
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(4), Duration::from_secs(5));
        assert_eq!(backoff.delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::new(0, Backoff::default(), Duration::from_secs(1)).is_err());
        assert!(RetryPolicy::new(1, Backoff::default(), Duration::ZERO).is_err());
        assert!(RetryPolicy::new(1, Backoff::default(), Duration::from_secs(1)).is_ok());
    }
}
