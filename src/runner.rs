//! Task runner: one simulator invocation per task
//!
//! ```text
//! stimulus.json ──> <program> <args..> <stimulus.json> <trace.csv>
//!                        │ env MINIS_STIMULUS, MINIS_TRACE_OUTPUT, MINIS_EVENTS_OUTPUT
//!                        v
//!               trace.csv (+ events.csv) ──> <task_id>.trace.parquet
//!                                            <task_id>.events.parquet
//!                                            <task_id>.json  (last)
//! ```
//!
//! The runner never enforces a timeout; backends do.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::artifact::{
    import_events_csv, import_trace_csv, write_events, write_trace, ArtifactPaths, ArtifactRecord,
};
use crate::campaign::{SimulationTask, Stimulus, TaskId};
use crate::config::SynapseClass;
use crate::error::TaskFailure;
use crate::{Error, Result};

/// Default simulator program.
pub const DEFAULT_SIMULATOR: &str = "minis-simulator";

/// Lines of simulator stderr quoted in a failure reason.
const STDERR_TAIL_LINES: usize = 5;

/// Executes one task to completion, returning the trace artifact path.
///
/// Implemented by [`SimulatorRunner`]; tests substitute their own.
pub trait TaskExecutor: Send + Sync {
    /// Run `task` once. Dropping the future must stop any work it started.
    fn execute(
        &self,
        task: &SimulationTask,
    ) -> impl Future<Output = std::result::Result<PathBuf, TaskFailure>> + Send;
}

#[derive(Serialize)]
struct StimulusFile<'a> {
    task_id: &'a TaskId,
    sim_config: &'a Path,
    synapse: SynapseClass,
    frequency: f64,
    repetition: u32,
    seed: u64,
    #[serde(flatten)]
    stimulus: &'a Stimulus,
    trace_output: &'a Path,
    events_output: &'a Path,
}

/// Launches the external simulator and converts its output into artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatorRunner {
    program: PathBuf,
    args: Vec<String>,
    sim_config: PathBuf,
    output_dir: PathBuf,
}

impl SimulatorRunner {
    /// Create a runner writing below `output_dir`.
    #[must_use]
    pub fn new(
        program: impl Into<PathBuf>,
        args: Vec<String>,
        sim_config: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            sim_config: sim_config.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Simulator program.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Simulation descriptor handed through to the simulator.
    #[must_use]
    pub fn sim_config(&self) -> &Path {
        &self.sim_config
    }

    /// Campaign output directory.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Task-scoped paths of `task`.
    #[must_use]
    pub fn paths(&self, task: &SimulationTask) -> ArtifactPaths {
        ArtifactPaths::new(&self.output_dir, task.job_title(), task.id())
    }

    /// Run `task`, or skip it if its artifact already exists.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskExecution` if the simulator cannot be launched,
    /// exits non-zero or leaves no trace; conversion errors otherwise.
    pub async fn run(&self, task: &SimulationTask) -> Result<PathBuf> {
        let paths = self.paths(task);
        if paths.is_complete() {
            tracing::debug!(task = %task.id(), "artifact exists, skipping");
            return Ok(paths.trace);
        }

        tokio::fs::create_dir_all(&paths.work_dir).await?;
        for stale in [&paths.raw_trace, &paths.raw_events] {
            if tokio::fs::try_exists(stale).await? {
                tokio::fs::remove_file(stale).await?;
            }
        }

        let stimulus = StimulusFile {
            task_id: task.id(),
            sim_config: &self.sim_config,
            synapse: task.synapse(),
            frequency: task.frequency(),
            repetition: task.repetition(),
            seed: task.seed(),
            stimulus: task.stimulus(),
            trace_output: &paths.raw_trace,
            events_output: &paths.raw_events,
        };
        tokio::fs::write(&paths.stimulus, serde_json::to_vec_pretty(&stimulus)?).await?;

        self.simulate(task.id(), &paths).await?;

        let task = task.clone();
        tokio::task::spawn_blocking(move || convert(&task, &paths))
            .await
            .map_err(|e| Error::Other(format!("conversion task panicked: {e}")))?
    }

    async fn simulate(&self, task_id: &TaskId, paths: &ArtifactPaths) -> Result<()> {
        let stderr_log = paths.work_dir.join("simulator.err");
        let stdout = std::fs::File::create(paths.work_dir.join("simulator.out"))?;
        let stderr = std::fs::File::create(&stderr_log)?;

        tracing::debug!(task = %task_id, program = %self.program.display(), "launching simulator");
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(&paths.stimulus)
            .arg(&paths.raw_trace)
            .env("MINIS_STIMULUS", &paths.stimulus)
            .env("MINIS_TRACE_OUTPUT", &paths.raw_trace)
            .env("MINIS_EVENTS_OUTPUT", &paths.raw_events)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| Error::TaskExecution {
                task_id: task_id.to_string(),
                reason: format!("cannot launch {}: {e}", self.program.display()),
            })?;

        if !status.success() {
            let tail = stderr_tail(&stderr_log).await;
            return Err(Error::TaskExecution {
                task_id: task_id.to_string(),
                reason: format!("simulator exited with {status}{tail}"),
            });
        }
        if !tokio::fs::try_exists(&paths.raw_trace).await? {
            return Err(Error::TaskExecution {
                task_id: task_id.to_string(),
                reason: format!("simulator wrote no trace at {}", paths.raw_trace.display()),
            });
        }
        Ok(())
    }
}

impl TaskExecutor for SimulatorRunner {
    async fn execute(&self, task: &SimulationTask) -> std::result::Result<PathBuf, TaskFailure> {
        self.run(task).await.map_err(|e| match e {
            Error::TaskExecution { reason, .. } => TaskFailure::Execution(reason),
            other => TaskFailure::Execution(other.to_string()),
        })
    }
}

async fn stderr_tail(path: &Path) -> String {
    let Ok(text) = tokio::fs::read_to_string(path).await else {
        return String::new();
    };
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return String::new();
    }
    let tail = &lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..];
    format!(": {}", tail.join(" | "))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn convert(task: &SimulationTask, paths: &ArtifactPaths) -> Result<PathBuf> {
    let trace = import_trace_csv(&paths.raw_trace)?;

    let events_file = if paths.raw_events.is_file() {
        let events = import_events_csv(&paths.raw_events)?;
        write_events(&paths.events, &events)?;
        Some(file_name(&paths.events))
    } else {
        None
    };
    let size = write_trace(&paths.trace, &trace)?;

    ArtifactRecord::new(task, file_name(&paths.trace), events_file, trace.len(), size)
        .save(&paths.sidecar)?;

    std::fs::remove_file(&paths.raw_trace)?;
    if paths.raw_events.is_file() {
        std::fs::remove_file(&paths.raw_events)?;
    }
    tracing::debug!(task = %task.id(), samples = trace.len(), bytes = size, "trace artifact written");
    Ok(paths.trace.clone())
}
