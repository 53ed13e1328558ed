//! Trace artifacts (Arrow/Parquet)
//!
//! ## Layout of one job directory
//!
//! ```text
//! <output>/<CELL>_<SYN>/
//!   <task_id>.trace.parquet     time, voltage, current (Float64)
//!   <task_id>.events.parquet    time (Float64), when events were recorded
//!   <task_id>.json              ArtifactRecord sidecar, written last
//!   work/<task_id>/             stimulus.json and raw simulator output
//! ```
//!
//! A task is complete exactly when its trace and its sidecar exist. Both are
//! written to a temporary name and renamed into place, so a crash never
//! leaves a half-written artifact that looks complete.

mod record;

pub use record::ArtifactRecord;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::Deserialize;

use crate::analysis::Trace;
use crate::campaign::TaskId;
use crate::error::AnalysisError;
use crate::{Error, Result};

/// Trace columns, in file order.
pub const TRACE_COLUMNS: [&str; 3] = ["time", "voltage", "current"];

/// Task-scoped paths under the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    /// `<output>/<CELL>_<SYN>`
    pub job_dir: PathBuf,
    /// Parquet trace
    pub trace: PathBuf,
    /// Parquet mini events
    pub events: PathBuf,
    /// JSON sidecar
    pub sidecar: PathBuf,
    /// Scratch directory of the simulator
    pub work_dir: PathBuf,
    /// Stimulus handed to the simulator
    pub stimulus: PathBuf,
    /// CSV trace written by the simulator
    pub raw_trace: PathBuf,
    /// CSV events written by the simulator
    pub raw_events: PathBuf,
}

impl ArtifactPaths {
    /// Paths of `task_id` below `output_dir`.
    #[must_use]
    pub fn new(output_dir: &Path, job_title: &str, task_id: &TaskId) -> Self {
        let job_dir = output_dir.join(job_title);
        let work_dir = job_dir.join("work").join(task_id.as_str());
        Self {
            trace: job_dir.join(format!("{task_id}.trace.parquet")),
            events: job_dir.join(format!("{task_id}.events.parquet")),
            sidecar: job_dir.join(format!("{task_id}.json")),
            stimulus: work_dir.join("stimulus.json"),
            raw_trace: work_dir.join("trace.csv"),
            raw_events: work_dir.join("events.csv"),
            work_dir,
            job_dir,
        }
    }

    /// Trace and sidecar both exist.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.trace.is_file() && self.sidecar.is_file()
    }
}

#[derive(Deserialize)]
struct TraceRow {
    time: f64,
    voltage: f64,
    current: f64,
}

#[derive(Deserialize)]
struct EventRow {
    time: f64,
}

/// Read a simulator trace CSV with a `time,voltage,current` header.
///
/// # Errors
///
/// Returns error if the file is missing, a row does not parse, or the samples
/// do not form a valid trace.
pub fn import_trace_csv<P: AsRef<Path>>(path: P) -> Result<Trace> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path.as_ref())?;

    let (mut time, mut voltage, mut current) = (Vec::new(), Vec::new(), Vec::new());
    for row in reader.deserialize::<TraceRow>() {
        let row = row?;
        time.push(row.time);
        voltage.push(row.voltage);
        current.push(row.current);
    }
    Ok(Trace::new(time, voltage, current)?)
}

/// Read a simulator events CSV (`time,synapse`); only times are kept, sorted.
///
/// # Errors
///
/// Returns error if the file is missing or a row does not parse.
pub fn import_events_csv<P: AsRef<Path>>(path: P) -> Result<Vec<f64>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path.as_ref())?;

    let mut times = Vec::new();
    for row in reader.deserialize::<EventRow>() {
        times.push(row?.time);
    }
    times.sort_by(f64::total_cmp);
    Ok(times)
}

fn f64_batch(columns: &[(&str, &[f64])]) -> Result<RecordBatch> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, _)| Field::new(*name, DataType::Float64, false))
        .collect();
    let arrays: Vec<ArrayRef> = columns
        .iter()
        .map(|(_, values)| Arc::new(Float64Array::from(values.to_vec())) as ArrayRef)
        .collect();
    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_batch(path: &Path, batch: &RecordBatch) -> Result<u64> {
    let tmp = tmp_path(path);
    let file = File::create(&tmp)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    std::fs::rename(&tmp, path)?;
    Ok(std::fs::metadata(path)?.len())
}

/// Write the trace samples as Parquet. Returns the file size in bytes.
///
/// # Errors
///
/// Returns error if the file cannot be written.
pub fn write_trace<P: AsRef<Path>>(path: P, trace: &Trace) -> Result<u64> {
    let batch = f64_batch(&[
        (TRACE_COLUMNS[0], trace.time()),
        (TRACE_COLUMNS[1], trace.voltage()),
        (TRACE_COLUMNS[2], trace.current()),
    ])?;
    write_batch(path.as_ref(), &batch)
}

/// Write mini event times as Parquet. Returns the file size in bytes.
///
/// # Errors
///
/// Returns error if the file cannot be written.
pub fn write_events<P: AsRef<Path>>(path: P, events: &[f64]) -> Result<u64> {
    let batch = f64_batch(&[("time", events)])?;
    write_batch(path.as_ref(), &batch)
}

fn read_columns(path: &Path, names: &[&str]) -> Result<Vec<Vec<f64>>> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut columns = vec![Vec::new(); names.len()];
    for batch in reader {
        let batch = batch?;
        for (name, column) in names.iter().zip(columns.iter_mut()) {
            let array = batch
                .column_by_name(name)
                .and_then(|a| a.as_any().downcast_ref::<Float64Array>())
                .ok_or_else(|| {
                    AnalysisError::MalformedTrace(format!(
                        "{}: missing Float64 column `{name}`",
                        path.display()
                    ))
                })?;
            if array.null_count() > 0 {
                return Err(AnalysisError::MalformedTrace(format!(
                    "{}: null values in `{name}`",
                    path.display()
                ))
                .into());
            }
            column.extend_from_slice(array.values());
        }
    }
    Ok(columns)
}

/// Load a Parquet trace, with its events file when given.
///
/// # Errors
///
/// Returns error if a file cannot be read or lacks a required column.
pub fn read_trace<P: AsRef<Path>>(path: P, events: Option<&Path>) -> Result<Trace> {
    let mut columns = read_columns(path.as_ref(), &TRACE_COLUMNS)?.into_iter();
    let mut next = || columns.next().unwrap_or_default();
    let (time, voltage, current) = (next(), next(), next());
    let trace = Trace::new(time, voltage, current)?;

    match events {
        Some(events) => {
            let times = read_columns(events, &["time"])?
                .into_iter()
                .next()
                .unwrap_or_default();
            Ok(trace.with_events(times))
        }
        None => Ok(trace),
    }
}

/// Sidecars of a job directory, sorted by task id.
///
/// Unreadable JSON files are skipped with a warning.
///
/// # Errors
///
/// Returns error if the directory cannot be listed.
pub fn list_artifacts<P: AsRef<Path>>(job_dir: P) -> Result<Vec<ArtifactRecord>> {
    let job_dir = job_dir.as_ref();
    let entries = std::fs::read_dir(job_dir).map_err(|e| {
        Error::Config(format!("cannot read job output dir {}: {e}", job_dir.display()))
    })?;

    let mut records = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        match ArtifactRecord::load(&path) {
            Ok(record) if job_dir.join(record.trace_file()).is_file() => records.push(record),
            Ok(record) => {
                tracing::warn!(task = %record.task_id(), "sidecar without trace, skipped");
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "not an artifact sidecar, skipped"),
        }
    }
    records.sort_by(|a, b| a.task_id().cmp(b.task_id()));
    Ok(records)
}

/// Load the trace a sidecar describes.
///
/// # Errors
///
/// Returns error if the trace or events file cannot be read.
pub fn load_artifact(job_dir: &Path, record: &ArtifactRecord) -> Result<Trace> {
    let events = record.events_file().map(|f| job_dir.join(f));
    read_trace(job_dir.join(record.trace_file()), events.as_deref())
}
