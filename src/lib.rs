//! # minis-validation: Spontaneous Minis Simulation Campaigns
//!
//! Runs parameter sweeps of miniature synaptic event ("minis") simulations
//! over job configs × input frequencies × repetitions, analyzes the recorded
//! clamp currents, and compares event frequency and amplitude against
//! published reference values.
//!
//! ## Pipeline
//!
//! ```text
//! config ──> campaign::build_matrix ──> backend (local pool | SLURM array)
//!                                            │  runner: simulator → Parquet trace
//!                                            v
//!                               analysis (per task, as it succeeds)
//!                                            │
//!                                            v
//!                          stats (per job config) ──> report files
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use minis_validation::analysis::analyze_trace;
//! use minis_validation::artifact::read_trace;
//! use minis_validation::campaign::TaskId;
//! use minis_validation::config::SynapseClass;
//!
//! let task_id = TaskId::new("L5_TPC_Exc", 0.1, 0);
//! let trace = read_trace(format!("L5_TPC_Exc/{task_id}.trace.parquet"), None)?;
//! let result = analyze_trace(task_id, &trace, SynapseClass::Exc, 4.5)?;
//! println!("{:.2} Hz over {} peaks", result.frequency(), result.peak_count());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod analysis;
pub mod artifact;
pub mod backend;
pub mod campaign;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod runner;
pub mod stats;

#[cfg(test)]
pub(crate) mod fixtures;

pub use error::{AnalysisError, Error, Result, TaskFailure};
