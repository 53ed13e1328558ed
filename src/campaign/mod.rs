//! Campaign model: the task matrix and per-task execution state
//!
//! ## Overview
//!
//! ```text
//! JobConfig (N) × FrequencySet (F) × repetitions (R)
//!        │
//!        └──> SimulationTask (N·F·R, immutable)
//!                  │
//!                  └── TaskRecord (mutable, one per task, held in a TaskTable)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use minis_validation::campaign::{Backoff, TaskId, TaskRecord, TaskStatus};
//! use std::path::PathBuf;
//!
//! let mut record = TaskRecord::new(TaskId::new("PC_Exc", 0.1, 0), 0, 3);
//! record.submit().unwrap();
//! record.start().unwrap();
//! record.succeed(PathBuf::from("PC_Exc-f0.100-r000.trace.parquet")).unwrap();
//! assert_eq!(record.status(), TaskStatus::Succeeded);
//! # let _ = Backoff::default();
//! ```

mod matrix;
mod record;
mod table;

pub use matrix::{build_matrix, SimulationTask, Stimulus, TaskId};
pub use record::{Backoff, RetryPolicy, Settlement, TaskRecord, TaskStatus};
pub use table::TaskTable;
