//! Local worker pool
//!
//! One tokio task per simulation task; a semaphore of `workers` permits caps
//! how many simulators run at once. A permit is held only while the simulator
//! runs, never during backoff.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::{CampaignHandle, ExecutionBackend};
use crate::campaign::{RetryPolicy, Settlement, SimulationTask, TaskRecord, TaskTable};
use crate::error::TaskFailure;
use crate::runner::TaskExecutor;
use crate::{Error, Result};

/// Local pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalBackendConfig {
    /// Maximum concurrently running simulators
    pub workers: usize,
    /// Retry and timeout policy
    pub policy: RetryPolicy,
}

impl LocalBackendConfig {
    /// Create a validated config.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `workers` is zero.
    pub fn new(workers: usize, policy: RetryPolicy) -> Result<Self> {
        if workers == 0 {
            return Err(Error::Config("at least one worker is required".to_string()));
        }
        Ok(Self { workers, policy })
    }
}

struct LocalCampaign {
    table: Arc<TaskTable>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Runs tasks as child processes of this process.
pub struct LocalBackend<E> {
    executor: Arc<E>,
    config: LocalBackendConfig,
    permits: Arc<Semaphore>,
    campaigns: DashMap<String, Arc<LocalCampaign>>,
    next_id: AtomicUsize,
}

impl<E: TaskExecutor + 'static> LocalBackend<E> {
    /// Create a pool around `executor`.
    #[must_use]
    pub fn new(executor: E, config: LocalBackendConfig) -> Self {
        Self {
            executor: Arc::new(executor),
            permits: Arc::new(Semaphore::new(config.workers)),
            config,
            campaigns: DashMap::new(),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Pool settings.
    #[must_use]
    pub const fn config(&self) -> &LocalBackendConfig {
        &self.config
    }

    /// All records of a campaign, terminal or not, in matrix order.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownCampaign` for a foreign handle.
    pub fn records(&self, handle: &CampaignHandle) -> Result<Vec<TaskRecord>> {
        Ok(self.campaign(handle)?.table.snapshot())
    }

    fn campaign(&self, handle: &CampaignHandle) -> Result<Arc<LocalCampaign>> {
        self.campaigns
            .get(handle.id())
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| Error::UnknownCampaign(handle.id().to_string()))
    }
}

impl<E: TaskExecutor + 'static> ExecutionBackend for LocalBackend<E> {
    async fn submit(&self, tasks: Vec<SimulationTask>) -> Result<CampaignHandle> {
        let id = format!("local-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let table = Arc::new(TaskTable::new(&tasks, self.config.policy.max_retries));
        let handle = CampaignHandle::new(id.clone(), tasks.iter().map(|t| t.id().clone()).collect());

        tracing::info!(
            campaign = %id,
            tasks = tasks.len(),
            workers = self.config.workers,
            "submitting to local pool"
        );
        let workers = tasks
            .into_iter()
            .map(|task| {
                tokio::spawn(drive(
                    Arc::clone(&self.executor),
                    Arc::clone(&table),
                    Arc::clone(&self.permits),
                    self.config.policy,
                    task,
                ))
            })
            .collect();

        self.campaigns.insert(
            id,
            Arc::new(LocalCampaign {
                table,
                workers: Mutex::new(workers),
            }),
        );
        Ok(handle)
    }

    async fn poll(&self, handle: &CampaignHandle) -> Result<Vec<TaskRecord>> {
        Ok(self.campaign(handle)?.table.drain_terminal())
    }

    async fn cancel(&self, handle: &CampaignHandle) -> Result<usize> {
        let campaign = self.campaign(handle)?;
        {
            let workers = campaign.workers.lock().unwrap_or_else(PoisonError::into_inner);
            for worker in workers.iter() {
                worker.abort();
            }
        }
        let cancelled = campaign.table.cancel_all();
        tracing::warn!(campaign = %handle.id(), cancelled, "local campaign cancelled");
        Ok(cancelled)
    }
}

/// Supervise one task until it is terminal.
///
/// Transitions that fail mean the record was cancelled under us; the worker
/// then stops quietly.
async fn drive<E: TaskExecutor>(
    executor: Arc<E>,
    table: Arc<TaskTable>,
    permits: Arc<Semaphore>,
    policy: RetryPolicy,
    task: SimulationTask,
) {
    let id = task.id();
    loop {
        if table.update(id, TaskRecord::submit).is_err() {
            return;
        }
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            return;
        };
        if table.update(id, TaskRecord::start).is_err() {
            return;
        }

        let outcome = match tokio::time::timeout(policy.timeout, executor.execute(&task)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TaskFailure::timeout(policy.timeout)),
        };
        drop(permit);

        match outcome {
            Ok(artifact) => {
                if table.update(id, |r| r.succeed(artifact)).is_ok() {
                    tracing::debug!(task = %id, "task succeeded");
                }
                return;
            }
            Err(failure) => {
                tracing::warn!(task = %id, error = %failure, "task attempt failed");
                let settlement = table.update(id, |r| {
                    r.fail(failure)?;
                    r.settle(&policy.backoff)
                });
                match settlement {
                    Ok(Settlement::Retry(delay)) => {
                        tracing::debug!(task = %id, ?delay, "retrying after backoff");
                        tokio::time::sleep(delay).await;
                    }
                    Ok(Settlement::Exhausted) => {
                        tracing::warn!(task = %id, "attempts exhausted, task failed");
                        return;
                    }
                    Err(_) => return,
                }
            }
        }
    }
}
