//! Cluster backend: one array job per (re)submission round
//!
//! ## Flow
//!
//! ```text
//! submit ─> manifest.json + job.sh ─> submit_array(indices, %P) ─> job id
//!
//! poll ──> query(job) per live job ─> TaskRecord transitions
//!      ├─> element missing from too many queries ─> cancel element
//!      ├─> watchdog: Running longer than timeout + grace ─> cancel element
//!      └─> due retries ─> one new array job with the failed indices,
//!                         throttled to the capacity the live jobs leave
//! ```
//!
//! `%P` throttles each array job on its own. A live job may still run
//! `min(%P, unfinished elements)` at once, and a retry job only gets what is
//! left of `array_parallelism` after that; with nothing left, due retries
//! wait for a later poll.
//!
//! Array index = matrix index. Each element runs
//! `<this executable> run-task <manifest> $SLURM_ARRAY_TASK_ID`, which loads
//! the task from the manifest and runs it with the same [`SimulatorRunner`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{CampaignHandle, ExecutionBackend};
use crate::artifact::ArtifactPaths;
use crate::campaign::{RetryPolicy, Settlement, SimulationTask, TaskRecord, TaskStatus, TaskTable};
use crate::error::TaskFailure;
use crate::runner::SimulatorRunner;
use crate::{Error, Result};

/// Slack on top of the per-task timeout before the watchdog steps in.
const WATCHDOG_GRACE: Duration = Duration::from_secs(60);

/// Default for [`ClusterBackendConfig::unreported_polls`].
pub const DEFAULT_UNREPORTED_POLLS: u32 = 300;

/// State of one array element as reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayTaskState {
    /// Queued
    Pending,
    /// Executing
    Running,
    /// Exited 0
    Completed,
    /// Exited non-zero or was killed; carries the scheduler state name
    Failed(String),
    /// Killed at the wall-time limit
    TimedOut,
    /// Cancelled
    Cancelled,
}

/// Parameters of one array submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArraySpec {
    /// Array indices (matrix indices of the tasks)
    pub indices: Vec<usize>,
    /// Maximum elements running at once
    pub parallelism: usize,
    /// Wall-time limit per element
    pub time_limit: Duration,
    /// Directory for per-element stdout/stderr
    pub log_dir: PathBuf,
}

/// Batch scheduler with array job support.
pub trait ArrayScheduler: Send + Sync {
    /// Submit `script` as an array job. Returns the job id.
    fn submit_array(
        &self,
        script: &Path,
        spec: &ArraySpec,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Current state of the elements of `job_id`. Elements the scheduler does
    /// not report yet are simply absent.
    fn query(&self, job_id: &str)
        -> impl Future<Output = Result<Vec<(usize, ArrayTaskState)>>> + Send;

    /// Cancel a whole job (`<id>`) or one element (`<id>_<index>`).
    fn cancel(&self, job_id: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Everything an array element needs to run its task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskManifest {
    /// Runner shared by all elements
    pub runner: SimulatorRunner,
    /// Submitted tasks
    pub tasks: Vec<SimulationTask>,
}

impl TaskManifest {
    /// Load a manifest.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the manifest.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }

    /// Task with matrix index `index`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the manifest has no such task.
    pub fn task(&self, index: usize) -> Result<&SimulationTask> {
        self.tasks
            .iter()
            .find(|t| t.index() == index)
            .ok_or_else(|| Error::Config(format!("manifest has no task with index {index}")))
    }

    /// Run the task with matrix index `index`.
    ///
    /// # Errors
    ///
    /// Returns error if the index is unknown or the task fails.
    pub async fn run(&self, index: usize) -> Result<PathBuf> {
        self.runner.run(self.task(index)?).await
    }
}

/// Cluster backend settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterBackendConfig {
    /// Where manifests and job scripts are written
    pub work_dir: PathBuf,
    /// Where the scheduler writes element logs
    pub log_dir: PathBuf,
    /// Elements running at once, across all array jobs of a campaign
    pub array_parallelism: usize,
    /// Consecutive successful queries that may omit a submitted element
    /// before its attempt fails
    pub unreported_polls: u32,
    /// Retry and timeout policy
    pub policy: RetryPolicy,
    /// Executable providing the `run-task` entry point
    pub executable: PathBuf,
}

#[derive(Default)]
struct ArrayState {
    jobs: Vec<String>,
    throttle: FxHashMap<String, usize>,
    owner: FxHashMap<usize, String>,
    running_since: FxHashMap<usize, Instant>,
    unreported: FxHashMap<usize, u32>,
    retry_at: Vec<(usize, Instant)>,
}

impl ArrayState {
    /// Upper bound on the elements the live jobs can still run at once.
    fn committed(&self) -> usize {
        let mut unfinished: FxHashMap<&str, usize> = FxHashMap::default();
        for job in self.owner.values() {
            *unfinished.entry(job.as_str()).or_default() += 1;
        }
        unfinished
            .into_iter()
            .map(|(job, n)| self.throttle.get(job).map_or(n, |p| n.min(*p)))
            .sum()
    }

    fn release(&mut self, index: usize) {
        self.owner.remove(&index);
        self.running_since.remove(&index);
        self.unreported.remove(&index);
    }
}

struct ClusterCampaign {
    table: TaskTable,
    tasks: FxHashMap<usize, SimulationTask>,
    script: PathBuf,
    state: Mutex<ArrayState>,
}

/// Runs tasks as elements of scheduler array jobs.
pub struct ClusterBackend<S> {
    scheduler: S,
    runner: SimulatorRunner,
    config: ClusterBackendConfig,
    campaigns: DashMap<String, Arc<ClusterCampaign>>,
    next_id: AtomicUsize,
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

impl<S: ArrayScheduler> ClusterBackend<S> {
    /// Create a backend submitting through `scheduler`.
    #[must_use]
    pub fn new(scheduler: S, runner: SimulatorRunner, config: ClusterBackendConfig) -> Self {
        Self {
            scheduler,
            runner,
            config,
            campaigns: DashMap::new(),
            next_id: AtomicUsize::new(0),
        }
    }

    /// All records of a campaign, in matrix order.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownCampaign` for a foreign handle.
    pub fn records(&self, handle: &CampaignHandle) -> Result<Vec<TaskRecord>> {
        Ok(self.campaign(handle)?.table.snapshot())
    }

    fn campaign(&self, handle: &CampaignHandle) -> Result<Arc<ClusterCampaign>> {
        self.campaigns
            .get(handle.id())
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| Error::UnknownCampaign(handle.id().to_string()))
    }

    fn write_script(&self, dir: &Path, manifest: &Path) -> Result<PathBuf> {
        let script = dir.join("job.sh");
        let body = format!(
            "#!/bin/bash\nset -euo pipefail\nexec {} run-task {} \"$SLURM_ARRAY_TASK_ID\"\n",
            shell_quote(&self.config.executable),
            shell_quote(manifest),
        );
        std::fs::write(&script, body)?;
        Ok(script)
    }

    const fn capacity(&self) -> usize {
        if self.config.array_parallelism == 0 {
            1
        } else {
            self.config.array_parallelism
        }
    }

    async fn submit_round(
        &self,
        campaign: &ClusterCampaign,
        state: &mut ArrayState,
        indices: Vec<usize>,
        parallelism: usize,
    ) -> Result<()> {
        for index in &indices {
            if let Some(task) = campaign.tasks.get(index) {
                campaign.table.update(task.id(), TaskRecord::submit)?;
            }
        }
        let spec = ArraySpec {
            indices,
            parallelism,
            time_limit: self.config.policy.timeout,
            log_dir: self.config.log_dir.clone(),
        };
        let job = self.scheduler.submit_array(&campaign.script, &spec).await?;
        tracing::info!(job = %job, elements = spec.indices.len(), parallelism, "array job submitted");
        for index in spec.indices {
            state.owner.insert(index, job.clone());
        }
        state.throttle.insert(job.clone(), parallelism);
        state.jobs.push(job);
        Ok(())
    }

    /// Record a failed attempt of element `index` and schedule its retry.
    fn attempt_failed(&self, campaign: &ClusterCampaign, state: &mut ArrayState, index: usize, failure: TaskFailure) {
        let Some(task) = campaign.tasks.get(&index) else {
            return;
        };
        state.release(index);
        tracing::warn!(task = %task.id(), error = %failure, "array element failed");
        let settlement = campaign.table.update(task.id(), |r| {
            r.fail(failure)?;
            r.settle(&self.config.policy.backoff)
        });
        match settlement {
            Ok(Settlement::Retry(delay)) => state.retry_at.push((index, Instant::now() + delay)),
            Ok(Settlement::Exhausted) => tracing::warn!(task = %task.id(), "attempts exhausted, task failed"),
            Err(e) => tracing::debug!(task = %task.id(), error = %e, "failure not recorded"),
        }
    }

    fn observe(&self, campaign: &ClusterCampaign, state: &mut ArrayState, index: usize, observed: ArrayTaskState) -> Result<()> {
        let Some(task) = campaign.tasks.get(&index) else {
            return Ok(());
        };
        let Some(record) = campaign.table.get(task.id()) else {
            return Ok(());
        };
        if !matches!(record.status(), TaskStatus::Submitted | TaskStatus::Running) {
            return Ok(());
        }

        match observed {
            ArrayTaskState::Pending => {}
            ArrayTaskState::Running => {
                if record.status() == TaskStatus::Submitted {
                    campaign.table.update(task.id(), TaskRecord::start)?;
                    state.running_since.insert(index, Instant::now());
                }
            }
            ArrayTaskState::Completed => {
                let paths = ArtifactPaths::new(self.runner.output_dir(), task.job_title(), task.id());
                if paths.is_complete() {
                    state.release(index);
                    campaign.table.update(task.id(), |r| r.succeed(paths.trace))?;
                } else {
                    let failure = TaskFailure::Execution("array element completed without an artifact".to_string());
                    self.attempt_failed(campaign, state, index, failure);
                }
            }
            ArrayTaskState::Failed(reason) => {
                let failure = TaskFailure::Execution(format!("scheduler reported {reason}"));
                self.attempt_failed(campaign, state, index, failure);
            }
            ArrayTaskState::TimedOut => {
                let failure = TaskFailure::timeout(self.config.policy.timeout);
                self.attempt_failed(campaign, state, index, failure);
            }
            ArrayTaskState::Cancelled => {
                let failure = TaskFailure::Execution("cancelled by the scheduler".to_string());
                self.attempt_failed(campaign, state, index, failure);
            }
        }
        Ok(())
    }

    async fn watchdog(&self, campaign: &ClusterCampaign, state: &mut ArrayState) {
        let limit = self.config.policy.timeout + WATCHDOG_GRACE;
        let overdue: Vec<usize> = state
            .running_since
            .iter()
            .filter(|(_, since)| since.elapsed() > limit)
            .map(|(index, _)| *index)
            .collect();
        for index in overdue {
            let failure = TaskFailure::timeout(self.config.policy.timeout);
            self.abandon(campaign, state, index, failure).await;
        }
    }

    /// Cancel the element at the scheduler, then fail its attempt.
    async fn abandon(&self, campaign: &ClusterCampaign, state: &mut ArrayState, index: usize, failure: TaskFailure) {
        if let Some(job) = state.owner.get(&index).cloned() {
            if let Err(e) = self.scheduler.cancel(&format!("{job}_{index}")).await {
                tracing::warn!(job = %job, index, error = %e, "cannot cancel array element");
            }
        }
        self.attempt_failed(campaign, state, index, failure);
    }

    /// Count one more query of `job` that omitted its elements outside
    /// `seen`, and give up on those omitted too often.
    async fn track_unreported(&self, campaign: &ClusterCampaign, state: &mut ArrayState, job: &str, seen: &FxHashSet<usize>) {
        let limit = self.config.unreported_polls.max(1);
        let missing: Vec<usize> = state
            .owner
            .iter()
            .filter(|(index, owner)| owner.as_str() == job && !seen.contains(*index))
            .map(|(index, _)| *index)
            .collect();
        for index in missing {
            let polls = {
                let polls = state.unreported.entry(index).or_insert(0);
                *polls += 1;
                *polls
            };
            if polls >= limit {
                let failure = TaskFailure::Execution(format!(
                    "array element {job}_{index} not reported by the scheduler in {limit} polls"
                ));
                self.abandon(campaign, state, index, failure).await;
            }
        }
    }

    async fn resubmit_due(&self, campaign: &ClusterCampaign, state: &mut ArrayState) {
        let budget = self.capacity().saturating_sub(state.committed());
        if budget == 0 {
            return;
        }
        let now = Instant::now();
        let (due, later): (Vec<_>, Vec<_>) = state.retry_at.drain(..).partition(|(_, at)| *at <= now);
        state.retry_at = later;
        if due.is_empty() {
            return;
        }

        let indices: Vec<usize> = due.into_iter().map(|(index, _)| index).collect();
        let parallelism = budget.min(indices.len());
        if let Err(e) = self.submit_round(campaign, state, indices.clone(), parallelism).await {
            tracing::warn!(error = %e, "resubmission failed");
            for index in indices {
                self.attempt_failed(campaign, state, index, TaskFailure::Execution(e.to_string()));
            }
        }
    }
}

impl<S: ArrayScheduler> ExecutionBackend for ClusterBackend<S> {
    async fn submit(&self, tasks: Vec<SimulationTask>) -> Result<CampaignHandle> {
        let id = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%dT%H%M%S"),
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let dir = self.config.work_dir.join(&id);
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(&self.config.log_dir)?;

        let manifest_path = dir.join("manifest.json");
        TaskManifest {
            runner: self.runner.clone(),
            tasks: tasks.clone(),
        }
        .save(&manifest_path)?;
        let script = self.write_script(&dir, &manifest_path)?;

        let handle = CampaignHandle::new(id.clone(), tasks.iter().map(|t| t.id().clone()).collect());
        let indices: Vec<usize> = tasks.iter().map(SimulationTask::index).collect();
        let campaign = Arc::new(ClusterCampaign {
            table: TaskTable::new(&tasks, self.config.policy.max_retries),
            tasks: tasks.into_iter().map(|t| (t.index(), t)).collect(),
            script,
            state: Mutex::new(ArrayState::default()),
        });

        if !indices.is_empty() {
            let mut state = campaign.state.lock().await;
            self.submit_round(&campaign, &mut state, indices, self.capacity()).await?;
        }
        self.campaigns.insert(id, Arc::clone(&campaign));
        Ok(handle)
    }

    async fn poll(&self, handle: &CampaignHandle) -> Result<Vec<TaskRecord>> {
        let campaign = self.campaign(handle)?;
        let mut state = campaign.state.lock().await;

        let mut live: Vec<String> = state.owner.values().cloned().collect();
        live.sort_unstable();
        live.dedup();
        for job in live {
            let observed = match self.scheduler.query(&job).await {
                Ok(observed) => observed,
                Err(e) => {
                    tracing::warn!(job = %job, error = %e, "scheduler query failed, retrying next poll");
                    continue;
                }
            };
            let mut seen = FxHashSet::default();
            for (index, element) in observed {
                if state.owner.get(&index) == Some(&job) {
                    seen.insert(index);
                    state.unreported.remove(&index);
                    self.observe(&campaign, &mut state, index, element)?;
                }
            }
            self.track_unreported(&campaign, &mut state, &job, &seen).await;
        }

        self.watchdog(&campaign, &mut state).await;
        self.resubmit_due(&campaign, &mut state).await;
        Ok(campaign.table.drain_terminal())
    }

    async fn cancel(&self, handle: &CampaignHandle) -> Result<usize> {
        let campaign = self.campaign(handle)?;
        let mut state = campaign.state.lock().await;
        for job in &state.jobs {
            if let Err(e) = self.scheduler.cancel(job).await {
                tracing::warn!(job = %job, error = %e, "cannot cancel array job");
            }
        }
        state.owner.clear();
        state.running_since.clear();
        state.unreported.clear();
        state.retry_at.clear();
        let cancelled = campaign.table.cancel_all();
        tracing::warn!(campaign = %handle.id(), cancelled, "cluster campaign cancelled");
        Ok(cancelled)
    }
}
