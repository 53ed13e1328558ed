//! Campaign matrix - job configs × frequencies × repetitions

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{FrequencySet, JobConfig, Protocol, SynapseClass};
use crate::{Error, Result};

/// Unique, deterministic task identifier.
///
/// Format: `<CELL_TYPE>_<SYN>-f<frequency, 3 decimals>-r<repetition, 3 digits>`,
/// e.g. `L5_TPC_Exc-f0.010-r002`. Artifacts are named after it, so an
/// identical campaign re-run maps onto the same files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Compose an identifier.
    #[must_use]
    pub fn new(job_title: &str, frequency: f64, repetition: u32) -> Self {
        Self(format!("{job_title}-f{frequency:.3}-r{repetition:03}"))
    }

    /// Split an identifier back into (job title, frequency, repetition).
    #[must_use]
    pub fn parse(id: &str) -> Option<(String, f64, u32)> {
        let (rest, repetition) = id.rsplit_once("-r")?;
        let (title, frequency) = rest.rsplit_once("-f")?;
        if title.is_empty() {
            return None;
        }
        Some((title.to_string(), frequency.parse().ok()?, repetition.parse().ok()?))
    }

    /// Identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stimulus injected into the simulator for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stimulus {
    /// Spontaneous release rate of excitatory synapses (Hz)
    pub exc_minis_frequency: f64,
    /// Spontaneous release rate of inhibitory synapses (Hz)
    pub inh_minis_frequency: f64,
    /// Recording protocol
    pub protocol: Protocol,
    /// Cell selection from the job config
    pub cells: serde_json::Value,
}

impl Stimulus {
    fn derive(config: &JobConfig, synapse: SynapseClass, frequency: f64) -> Result<Self> {
        let (exc, inh) = match synapse {
            SynapseClass::Exc => (frequency, 0.0),
            SynapseClass::Inh => (0.0, frequency),
        };
        Ok(Self {
            exc_minis_frequency: exc,
            inh_minis_frequency: inh,
            protocol: config.protocol().clone(),
            cells: serde_json::to_value(config.cells())?,
        })
    }
}

/// Atomic unit of work. Immutable; execution state lives in `TaskRecord`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationTask {
    id: TaskId,
    index: usize,
    job_title: String,
    synapse: SynapseClass,
    frequency: f64,
    repetition: u32,
    seed: u64,
    stimulus: Stimulus,
}

impl SimulationTask {
    /// Task identifier.
    #[must_use]
    pub const fn id(&self) -> &TaskId {
        &self.id
    }

    /// Position in the matrix; also the cluster array index.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// `<CELL_TYPE>_<SYN>` of the owning job config.
    #[must_use]
    pub fn job_title(&self) -> &str {
        &self.job_title
    }

    /// Synapse class under test.
    #[must_use]
    pub const fn synapse(&self) -> SynapseClass {
        self.synapse
    }

    /// Input frequency (Hz).
    #[must_use]
    pub const fn frequency(&self) -> f64 {
        self.frequency
    }

    /// Repetition index, starting at 0.
    #[must_use]
    pub const fn repetition(&self) -> u32 {
        self.repetition
    }

    /// Simulator seed.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Stimulus handed to the simulator.
    #[must_use]
    pub const fn stimulus(&self) -> &Stimulus {
        &self.stimulus
    }
}

/// Expand the campaign matrix.
///
/// Ordering is job configs outer, frequencies middle, repetitions inner; the
/// cluster backend indexes array elements by this order. Repetition `r` uses
/// seed `base_seed + r`.
///
/// # Errors
///
/// Returns `Error::Config` if a config names an unrecognized synapse class,
/// `repetitions` is zero, two tasks would share an identifier, or a
/// repetition seed overflows `u64`.
pub fn build_matrix(
    configs: &[JobConfig],
    frequencies: &FrequencySet,
    repetitions: u32,
    base_seed: u64,
) -> Result<Vec<SimulationTask>> {
    if repetitions == 0 {
        return Err(Error::Config("repetition count must be at least 1".to_string()));
    }

    let capacity = configs.len() * frequencies.len() * repetitions as usize;
    let mut tasks = Vec::with_capacity(capacity);
    let mut seen = HashSet::with_capacity(capacity);

    for config in configs {
        let synapse = config.synapse_class()?;
        let title = config.title();
        for &frequency in frequencies.values() {
            let stimulus = Stimulus::derive(config, synapse, frequency)?;
            for repetition in 0..repetitions {
                let id = TaskId::new(&title, frequency, repetition);
                if !seen.insert(id.clone()) {
                    return Err(Error::Config(format!(
                        "duplicate task {id}: job configs and frequencies (at 3 decimals) must be unique"
                    )));
                }
                let seed = base_seed.checked_add(u64::from(repetition)).ok_or_else(|| {
                    Error::Config(format!(
                        "seed {base_seed} leaves no room for {repetitions} repetitions"
                    ))
                })?;
                tasks.push(SimulationTask {
                    id,
                    index: tasks.len(),
                    job_title: title.clone(),
                    synapse,
                    frequency,
                    repetition,
                    seed,
                    stimulus: stimulus.clone(),
                });
            }
        }
    }

    Ok(tasks)
}
