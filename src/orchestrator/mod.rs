//! Campaign orchestration
//!
//! ## Flow of `simulate`
//!
//! ```text
//! CampaignContext::open ─> build_matrix ─> resume check ─> backend.submit
//!        │                                                      │
//!        │            ┌──── Completions (terminal records) <────┘
//!        │            │  Succeeded ─> spawn_blocking(analyze)  (overlaps simulation)
//!        │            │  Failed    ─> aggregator
//!        │            └─ deadline  ─> backend.cancel
//!        v
//! CampaignContext::close ─> per-job reports, job_results.csv, campaign.json
//! ```
//!
//! Task failures are data in the report; only configuration and backend
//! errors leave [`Orchestrator::run`] as `Err`.

mod report;

pub use report::{write_frequencies_tsv, write_job_outputs, write_job_results, CampaignReport};

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tokio::task::JoinSet;

use crate::analysis::{analyze_trace, AnalysisResult};
use crate::artifact::{list_artifacts, load_artifact, ArtifactPaths, ArtifactRecord};
use crate::backend::ExecutionBackend;
use crate::campaign::{build_matrix, SimulationTask, TaskId, TaskRecord};
use crate::config::{parse_job_config_filename, FrequencySet, JobConfig, SynapseClass};
use crate::error::{AnalysisError, TaskFailure};
use crate::stats::{Aggregator, CampaignSummary, FailedTask};
use crate::{Error, Result};

/// Campaign-level settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignSettings {
    /// Repetitions per (job config, frequency)
    pub repetitions: u32,
    /// Seed of repetition 0
    pub base_seed: u64,
    /// Interval between backend polls
    pub poll_interval: Duration,
    /// Wall-clock budget of the whole campaign
    pub campaign_timeout: Option<Duration>,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            repetitions: 1,
            base_seed: 0,
            poll_interval: Duration::from_secs(1),
            campaign_timeout: None,
        }
    }
}

/// Explicit state of one campaign, opened at start and closed at the end.
#[derive(Debug)]
pub struct CampaignContext {
    id: String,
    output_dir: PathBuf,
    started_at: DateTime<Utc>,
    configs: Vec<JobConfig>,
    frequencies: FrequencySet,
}

impl CampaignContext {
    /// Create the output tree and stamp the campaign.
    ///
    /// # Errors
    ///
    /// Returns error if a directory cannot be created.
    pub fn open(
        output_dir: impl Into<PathBuf>,
        configs: Vec<JobConfig>,
        frequencies: FrequencySet,
    ) -> Result<Self> {
        let output_dir = output_dir.into();
        for config in &configs {
            std::fs::create_dir_all(output_dir.join(config.title()))?;
        }
        let started_at = Utc::now();
        let id = started_at.format("%Y%m%dT%H%M%S").to_string();
        tracing::info!(
            campaign = %id,
            output = %output_dir.display(),
            configs = configs.len(),
            frequencies = frequencies.len(),
            "campaign opened"
        );
        Ok(Self {
            id,
            output_dir,
            started_at,
            configs,
            frequencies,
        })
    }

    /// Campaign id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Output directory.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Loaded job configs.
    #[must_use]
    pub fn configs(&self) -> &[JobConfig] {
        &self.configs
    }

    /// Write every report and consume the context.
    ///
    /// # Errors
    ///
    /// Returns error if a report cannot be written.
    pub fn close(self, report: &CampaignReport) -> Result<()> {
        for (config, summary) in self.configs.iter().zip(&report.summaries) {
            write_job_outputs(&self.output_dir.join(config.title()), config, summary)?;
        }
        write_job_results(&self.output_dir.join("job_results.csv"), &report.summaries)?;
        std::fs::write(
            self.output_dir.join("campaign.json"),
            serde_json::to_vec_pretty(report)?,
        )?;
        tracing::info!(campaign = %self.id, "campaign closed");
        Ok(())
    }
}

type Analyzed = (AnalysisJob, std::result::Result<AnalysisResult, AnalysisError>);

/// What the analysis of one task needs, detached from borrowed config.
#[derive(Clone)]
struct AnalysisJob {
    task_id: TaskId,
    job_title: String,
    frequency: f64,
    paths: ArtifactPaths,
    synapse: SynapseClass,
    peak_min_height: f64,
}

impl AnalysisJob {
    fn new(output_dir: &Path, task: &SimulationTask, config: &JobConfig) -> Self {
        Self {
            task_id: task.id().clone(),
            job_title: task.job_title().to_string(),
            frequency: task.frequency(),
            paths: ArtifactPaths::new(output_dir, task.job_title(), task.id()),
            synapse: task.synapse(),
            peak_min_height: config.analysis().peak_min_height,
        }
    }

    fn run(self) -> Analyzed {
        let outcome = ArtifactRecord::load(&self.paths.sidecar)
            .and_then(|record| load_artifact(&self.paths.job_dir, &record))
            .map_err(into_analysis_error)
            .and_then(|trace| {
                analyze_trace(self.task_id.clone(), &trace, self.synapse, self.peak_min_height)
            });
        (self, outcome)
    }
}

fn into_analysis_error(e: Error) -> AnalysisError {
    match e {
        Error::Analysis(e) => e,
        other => AnalysisError::MalformedTrace(other.to_string()),
    }
}

fn failed_task(record: &TaskRecord) -> FailedTask {
    FailedTask {
        task_id: record.task_id().clone(),
        attempts: record.attempts(),
        error: record
            .last_error()
            .map_or_else(|| "unknown".to_string(), TaskFailure::to_string),
    }
}

/// Drives one campaign through an execution backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct Orchestrator {
    settings: CampaignSettings,
}

impl Orchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub const fn new(settings: CampaignSettings) -> Self {
        Self { settings }
    }

    /// Run the campaign to completion (or its deadline) and write the reports.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid matrix, backend errors, and
    /// report I/O errors. Task failures are reported, not returned.
    pub async fn run<B: ExecutionBackend>(
        &self,
        backend: &B,
        context: CampaignContext,
    ) -> Result<CampaignReport> {
        let tasks = build_matrix(
            &context.configs,
            &context.frequencies,
            self.settings.repetitions,
            self.settings.base_seed,
        )?;
        let total_tasks = tasks.len();

        let configs: FxHashMap<String, &JobConfig> =
            context.configs.iter().map(|c| (c.title(), c)).collect();
        let mut jobs: FxHashMap<TaskId, AnalysisJob> = FxHashMap::default();
        let mut aggregator = Aggregator::new();
        for task in &tasks {
            aggregator.expect(task.job_title(), task.frequency());
            if let Some(config) = configs.get(task.job_title()) {
                jobs.insert(task.id().clone(), AnalysisJob::new(&context.output_dir, task, config));
            }
        }

        let mut analyses: JoinSet<Analyzed> = JoinSet::new();
        let (done, pending): (Vec<SimulationTask>, Vec<SimulationTask>) = tasks
            .into_iter()
            .partition(|t| jobs.get(t.id()).is_some_and(|j| j.paths.is_complete()));
        let resumed = done.len();
        for task in &done {
            if let Some(job) = jobs.get(task.id()) {
                analyses.spawn_blocking({
                    let job = job.clone();
                    move || job.run()
                });
            }
        }
        tracing::info!(total = total_tasks, resumed, submitting = pending.len(), "matrix built");

        let handle = backend.submit(pending).await?;
        let deadline = self
            .settings
            .campaign_timeout
            .map(|t| tokio::time::Instant::now() + t);

        let mut succeeded = resumed;
        let mut failed_tasks = Vec::new();
        let mut settle = |record: TaskRecord,
                          analyses: &mut JoinSet<Analyzed>,
                          aggregator: &mut Aggregator| {
            let Some(job) = jobs.get(record.task_id()) else {
                return;
            };
            if record.is_succeeded() {
                succeeded += 1;
                let job = job.clone();
                analyses.spawn_blocking(move || job.run());
            } else {
                let failed = failed_task(&record);
                aggregator.add_failure(&job.job_title, job.frequency, failed.clone());
                failed_tasks.push(failed);
            }
        };

        let mut completions = backend.wait(&handle, self.settings.poll_interval, deadline);
        while let Some(record) = completions.next().await? {
            tracing::debug!(task = %record.task_id(), status = ?record.status(), "task terminal");
            settle(record, &mut analyses, &mut aggregator);
        }

        let timed_out = completions.timed_out();
        let mut cancelled = 0;
        if timed_out {
            tracing::warn!(campaign = %context.id, "campaign deadline reached, cancelling");
            cancelled = backend.cancel(&handle).await?;
            for record in backend.poll(&handle).await? {
                settle(record, &mut analyses, &mut aggregator);
            }
        }

        while let Some(joined) = analyses.join_next().await {
            let (job, outcome) =
                joined.map_err(|e| Error::Other(format!("analysis task panicked: {e}")))?;
            if let Err(e) = &outcome {
                tracing::warn!(task = %job.task_id, error = %e, "trace rejected");
            }
            aggregator.add_analysis(&job.job_title, job.frequency, &job.task_id, outcome);
        }

        failed_tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        let summaries = context.configs.iter().map(|c| aggregator.summarize(c)).collect();
        let report = CampaignReport {
            campaign_id: context.id.clone(),
            started_at: context.started_at,
            finished_at: Utc::now(),
            total_tasks,
            succeeded,
            resumed,
            cancelled,
            timed_out,
            failed_tasks,
            summaries,
        };
        context.close(&report)?;
        Ok(report)
    }
}

/// Analyze every trace artifact of one job directory and write its reports.
///
/// Traces are analyzed in parallel; rejected traces are listed in the summary.
///
/// # Errors
///
/// Returns error if the job directory cannot be read, the config names an
/// unrecognized synapse class, or a report cannot be written.
pub fn analyze_job(config: &JobConfig, job_dir: &Path) -> Result<CampaignSummary> {
    let synapse = config.synapse_class()?;
    let peak_min_height = config.analysis().peak_min_height;
    let artifacts = list_artifacts(job_dir)?;
    tracing::info!(job = %config.title(), traces = artifacts.len(), "analyzing job");

    let outcomes: Vec<_> = artifacts
        .par_iter()
        .map(|record| {
            let outcome = load_artifact(job_dir, record)
                .map_err(into_analysis_error)
                .and_then(|trace| {
                    analyze_trace(record.task_id().clone(), &trace, synapse, peak_min_height)
                });
            (record, outcome)
        })
        .collect();

    let mut aggregator = Aggregator::new();
    for (record, outcome) in outcomes {
        aggregator.expect(config.title().as_str(), record.frequency());
        if let Err(e) = &outcome {
            tracing::warn!(task = %record.task_id(), error = %e, "trace rejected");
        }
        aggregator.add_analysis(&config.title(), record.frequency(), record.task_id(), outcome);
    }

    let summary = aggregator.summarize(config);
    write_job_outputs(job_dir, config, &summary)?;
    Ok(summary)
}

/// Analyze every job of a `simulate` output directory.
///
/// Job configs with a malformed name or without an output directory are
/// skipped with a warning. Writes `job_results.csv` into `output_dir`.
///
/// # Errors
///
/// Returns error if a directory cannot be read or a report cannot be written.
pub fn analyze_jobs(configs_dir: &Path, output_dir: &Path) -> Result<Vec<CampaignSummary>> {
    let entries = std::fs::read_dir(configs_dir).map_err(|e| {
        Error::Config(format!("cannot read job configs dir {}: {e}", configs_dir.display()))
    })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "yaml"))
        .collect();
    paths.sort();

    let mut summaries = Vec::new();
    for path in paths {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let recognized = parse_job_config_filename(name)
            .is_some_and(|(_, syn)| syn.parse::<SynapseClass>().is_ok());
        if !recognized {
            tracing::warn!(
                file = name,
                "skipped: config files must be named \"config_<CELL_TYPE>_<Exc|Inh>.yaml\""
            );
            continue;
        }
        let config = JobConfig::load(&path)?;
        let job_dir = output_dir.join(config.title());
        if !job_dir.is_dir() {
            tracing::warn!(job = %config.title(), "skipped: no output directory");
            continue;
        }
        summaries.push(analyze_job(&config, &job_dir)?);
    }

    write_job_results(&output_dir.join("job_results.csv"), &summaries)?;
    Ok(summaries)
}
