//! Artifact Record - sidecar describing a finished task's trace

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::campaign::{SimulationTask, TaskId};
use crate::Result;

/// Sidecar written next to a task's trace once the trace is complete.
///
/// Its presence marks the task as done, so a re-run of the same campaign
/// skips it. File names are relative to the job directory, which keeps an
/// output tree relocatable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRecord {
    task_id: TaskId,
    job_title: String,
    frequency: f64,
    repetition: u32,
    seed: u64,
    trace_file: String,
    events_file: Option<String>,
    samples: usize,
    size_bytes: u64,
    created_at: DateTime<Utc>,
}

impl ArtifactRecord {
    /// Describe the trace written for `task`.
    #[must_use]
    pub fn new(
        task: &SimulationTask,
        trace_file: impl Into<String>,
        events_file: Option<String>,
        samples: usize,
        size_bytes: u64,
    ) -> Self {
        Self {
            task_id: task.id().clone(),
            job_title: task.job_title().to_string(),
            frequency: task.frequency(),
            repetition: task.repetition(),
            seed: task.seed(),
            trace_file: trace_file.into(),
            events_file,
            samples,
            size_bytes,
            created_at: Utc::now(),
        }
    }

    /// Load a sidecar.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not a sidecar.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the sidecar through a temporary file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Task identifier.
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// `<CELL>_<SYN>` of the task.
    #[must_use]
    pub fn job_title(&self) -> &str {
        &self.job_title
    }

    /// Input frequency (Hz).
    #[must_use]
    pub const fn frequency(&self) -> f64 {
        self.frequency
    }

    /// Repetition index.
    #[must_use]
    pub const fn repetition(&self) -> u32 {
        self.repetition
    }

    /// Simulator seed.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Trace file name.
    #[must_use]
    pub fn trace_file(&self) -> &str {
        &self.trace_file
    }

    /// Events file name, when events were recorded.
    #[must_use]
    pub fn events_file(&self) -> Option<&str> {
        self.events_file.as_deref()
    }

    /// Number of trace samples.
    #[must_use]
    pub const fn samples(&self) -> usize {
        self.samples
    }

    /// Trace size in bytes.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
