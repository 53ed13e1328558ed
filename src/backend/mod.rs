//! Execution backends
//!
//! ```text
//!                    ┌─ LocalBackend   tokio tasks, semaphore of N workers
//! ExecutionBackend ──┤
//!                    └─ ClusterBackend array job, `%P` throttle, sacct polling
//! ```
//!
//! Both variants drive [`TaskRecord`]s through the same state machine, so
//! retry and timeout behave identically. Backend choice happens once at
//! startup ([`BackendKind`]); nothing downstream knows which one runs.

pub mod cluster;
pub mod local;
pub mod slurm;

pub use cluster::{
    ArrayScheduler, ArraySpec, ArrayTaskState, ClusterBackend, ClusterBackendConfig, TaskManifest,
    DEFAULT_UNREPORTED_POLLS,
};
pub use local::{LocalBackend, LocalBackendConfig};
pub use slurm::{format_array_spec, parse_sacct, parse_slurm_args, SlurmScheduler};

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::campaign::{SimulationTask, TaskId, TaskRecord};
use crate::Result;

/// Reference to a submitted campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignHandle {
    id: String,
    task_ids: Vec<TaskId>,
}

impl CampaignHandle {
    /// Create a handle for the given tasks.
    #[must_use]
    pub const fn new(id: String, task_ids: Vec<TaskId>) -> Self {
        Self { id, task_ids }
    }

    /// Backend-assigned campaign id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Submitted tasks.
    #[must_use]
    pub fn task_ids(&self) -> &[TaskId] {
        &self.task_ids
    }

    /// Number of submitted tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    /// Check if nothing was submitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }
}

/// Uniform capability set of the local pool and the cluster scheduler.
pub trait ExecutionBackend: Send + Sync {
    /// Start scheduling `tasks`. Returns as soon as they are queued.
    fn submit(
        &self,
        tasks: Vec<SimulationTask>,
    ) -> impl Future<Output = Result<CampaignHandle>> + Send;

    /// Records that became terminal since the previous poll.
    ///
    /// The cluster variant also advances retries and timeouts here.
    fn poll(&self, handle: &CampaignHandle) -> impl Future<Output = Result<Vec<TaskRecord>>> + Send;

    /// Stop queued and running tasks. Non-terminal records become permanently
    /// Failed as cancelled; returns how many.
    fn cancel(&self, handle: &CampaignHandle) -> impl Future<Output = Result<usize>> + Send;

    /// Terminal records as they arrive, until every task finished or
    /// `deadline` passed.
    fn wait<'a>(
        &'a self,
        handle: &'a CampaignHandle,
        poll_interval: Duration,
        deadline: Option<Instant>,
    ) -> Completions<'a, Self>
    where
        Self: Sized,
    {
        Completions {
            backend: self,
            handle,
            poll_interval,
            deadline,
            ready: VecDeque::new(),
            delivered: 0,
            timed_out: false,
        }
    }
}

/// Async iterator over terminal task records. See [`ExecutionBackend::wait`].
pub struct Completions<'a, B> {
    backend: &'a B,
    handle: &'a CampaignHandle,
    poll_interval: Duration,
    deadline: Option<Instant>,
    ready: VecDeque<TaskRecord>,
    delivered: usize,
    timed_out: bool,
}

impl<B: ExecutionBackend> Completions<'_, B> {
    /// Next terminal record, or `None` once all are delivered or the deadline
    /// passed.
    ///
    /// # Errors
    ///
    /// Returns error if polling the backend fails.
    pub async fn next(&mut self) -> Result<Option<TaskRecord>> {
        loop {
            if let Some(record) = self.ready.pop_front() {
                self.delivered += 1;
                return Ok(Some(record));
            }
            if self.delivered >= self.handle.len() {
                return Ok(None);
            }
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                self.timed_out = true;
                return Ok(None);
            }

            let records = self.backend.poll(self.handle).await?;
            if records.is_empty() {
                let nap = self.deadline.map_or(self.poll_interval, |d| {
                    self.poll_interval.min(d.saturating_duration_since(Instant::now()))
                });
                tokio::time::sleep(nap).await;
            }
            self.ready.extend(records);
        }
    }

    /// Records delivered so far.
    #[must_use]
    pub const fn delivered(&self) -> usize {
        self.delivered
    }

    /// Whether iteration stopped at the deadline.
    #[must_use]
    pub const fn timed_out(&self) -> bool {
        self.timed_out
    }
}

/// Backend selection, made once from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// Worker pool on this machine
    Local,
    /// SLURM array jobs with extra `sbatch` arguments
    Cluster {
        /// `(key, value)` pairs passed as `--key=value`
        slurm_args: Vec<(String, String)>,
    },
}

impl BackendKind {
    /// Cluster when scheduler arguments are present, local otherwise.
    #[must_use]
    pub fn from_slurm_args(slurm_args: Vec<(String, String)>) -> Self {
        if slurm_args.is_empty() {
            Self::Local
        } else {
            Self::Cluster { slurm_args }
        }
    }
}
