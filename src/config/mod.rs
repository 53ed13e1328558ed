//! Campaign inputs: job configs and the frequency axis
//!
//! ## Layout
//!
//! ```text
//! job-configs/
//!   config_L5_TPC_Exc.yaml     ─┐
//!   config_L5_TPC_Inh.yaml      ├─ one JobConfig per (cell type, synapse class)
//!   config_L23_PC_Exc.yaml     ─┘
//! frequencies.tsv              ── MINIS_FREQ column, one FrequencySet
//! ```
//!
//! Both are loaded once at campaign start and held read-only afterwards.

mod frequency;
mod job;

pub use frequency::{FrequencySet, FREQUENCY_COLUMN};
pub use job::{
    load_job_configs, parse_job_config_filename, AnalysisParams, JobConfig, MeanStd, Overrides,
    Protocol, ReferenceStats, SynapseClass,
};
