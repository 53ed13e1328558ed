//! Statistics aggregation per (job config, input frequency)
//!
//! Outcomes are grouped by key, never by arrival order, so the summary of a
//! campaign does not depend on which task finished first.

mod fit;

pub use fit::{CalibrationFit, FitPoint};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisResult;
use crate::campaign::TaskId;
use crate::config::{JobConfig, ReferenceStats};
use crate::error::AnalysisError;

/// Mean and population standard deviation; `None` for an empty slice.
#[must_use]
pub fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, var.sqrt()))
}

/// Final outcome of one task, as seen by the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Simulation permanently failed
    SimulationFailed(FailedTask),
    /// Trace analyzed
    Analyzed(AnalysisResult),
    /// Trace produced but rejected by the analyzer
    AnalysisFailed(AnalysisError),
}

/// Task that permanently failed its simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTask {
    /// Task identifier
    pub task_id: TaskId,
    /// Attempts made
    pub attempts: u32,
    /// Last error
    pub error: String,
}

/// Task whose trace could not be analyzed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFailure {
    /// Task identifier
    pub task_id: TaskId,
    /// Analyzer error
    pub error: String,
}

/// Non-fatal condition found while summarizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggregationWarning {
    /// No repetition of this frequency point was analyzed
    NoData {
        /// Input frequency (Hz)
        frequency: f64,
    },
}

/// Statistics of one (job config, input frequency) point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyStats {
    /// Input frequency (Hz)
    pub frequency: f64,
    /// Repetitions in the matrix
    pub attempted: usize,
    /// Repetitions whose simulation succeeded
    pub succeeded: usize,
    /// Repetitions whose trace was analyzed
    pub analyzed: usize,
    /// Mean detected frequency (Hz)
    pub mean_frequency: Option<f64>,
    /// Population std of the detected frequency (Hz)
    pub std_frequency: Option<f64>,
    /// Mean amplitude over pooled peaks (pA)
    pub mean_amplitude: Option<f64>,
    /// Std of the pooled amplitudes (pA)
    pub std_amplitude: Option<f64>,
    /// Number of pooled peaks
    pub amplitude_count: usize,
    /// `(mean - ref_mean) / ref_std` of the frequency
    pub frequency_z: Option<f64>,
    /// Same for the amplitude, when the reference declares one
    pub amplitude_z: Option<f64>,
}

impl FrequencyStats {
    /// Whether no repetition was analyzed.
    #[must_use]
    pub const fn is_no_data(&self) -> bool {
        self.analyzed == 0
    }
}

/// Result of one job config over the whole frequency axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSummary {
    /// `<CELL>_<SYN>`
    pub job_title: String,
    /// Extracellular calcium of the protocol (mM)
    pub calcium: f64,
    /// Published reference
    pub reference: ReferenceStats,
    /// Points in ascending input frequency
    pub points: Vec<FrequencyStats>,
    /// Point whose frequency is closest to the reference (smallest |z|)
    pub best_point: Option<FrequencyStats>,
    /// Calibration curve, when at least two non-zero points have data
    pub fit: Option<CalibrationFit>,
    /// Input frequency predicted to reproduce the reference mean
    pub minis_frequency: Option<f64>,
    /// Permanently failed simulations
    pub failed_tasks: Vec<FailedTask>,
    /// Rejected traces
    pub analysis_failures: Vec<AnalysisFailure>,
    /// No-data points and similar
    pub warnings: Vec<AggregationWarning>,
}

#[derive(Debug, Default)]
struct Group {
    frequency: f64,
    attempted: usize,
    succeeded: usize,
    frequencies: Vec<f64>,
    amplitudes: Vec<f64>,
    failed: Vec<FailedTask>,
    analysis_failures: Vec<AnalysisFailure>,
}

/// Collects task outcomes and turns them into per-config summaries.
#[derive(Debug, Default)]
pub struct Aggregator {
    groups: FxHashMap<(String, u64), Group>,
}

impl Aggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn group(&mut self, job_title: &str, frequency: f64) -> &mut Group {
        self.groups
            .entry((job_title.to_string(), frequency.to_bits()))
            .or_insert_with(|| Group {
                frequency,
                ..Group::default()
            })
    }

    /// Register a task of the matrix.
    pub fn expect(&mut self, job_title: &str, frequency: f64) {
        self.group(job_title, frequency).attempted += 1;
    }

    /// Record a permanently failed simulation.
    pub fn add_failure(&mut self, job_title: &str, frequency: f64, failed: FailedTask) {
        self.group(job_title, frequency).failed.push(failed);
    }

    /// Record the analysis outcome of a succeeded simulation.
    pub fn add_analysis(
        &mut self,
        job_title: &str,
        frequency: f64,
        task_id: &TaskId,
        outcome: Result<AnalysisResult, AnalysisError>,
    ) {
        let group = self.group(job_title, frequency);
        group.succeeded += 1;
        match outcome {
            Ok(result) => {
                group.frequencies.push(result.frequency());
                group.amplitudes.extend(result.amplitudes());
            }
            Err(e) => group.analysis_failures.push(AnalysisFailure {
                task_id: task_id.clone(),
                error: e.to_string(),
            }),
        }
    }

    /// Record an outcome given as a [`TaskOutcome`].
    pub fn add(&mut self, job_title: &str, frequency: f64, task_id: &TaskId, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::SimulationFailed(failed) => self.add_failure(job_title, frequency, failed),
            TaskOutcome::Analyzed(result) => self.add_analysis(job_title, frequency, task_id, Ok(result)),
            TaskOutcome::AnalysisFailed(e) => self.add_analysis(job_title, frequency, task_id, Err(e)),
        }
    }

    /// Summarize one job config.
    #[must_use]
    pub fn summarize(&self, config: &JobConfig) -> CampaignSummary {
        let title = config.title();
        let reference = config.reference();

        let mut groups: Vec<&Group> = self
            .groups
            .iter()
            .filter(|((t, _), _)| *t == title)
            .map(|(_, g)| g)
            .collect();
        groups.sort_by(|a, b| a.frequency.total_cmp(&b.frequency));

        let mut points = Vec::with_capacity(groups.len());
        let mut warnings = Vec::new();
        let mut failed_tasks = Vec::new();
        let mut analysis_failures = Vec::new();
        for group in groups {
            let point = point_stats(group, reference);
            if point.is_no_data() {
                tracing::warn!(job = %title, frequency = group.frequency, "no analyzed repetition");
                warnings.push(AggregationWarning::NoData {
                    frequency: group.frequency,
                });
            }
            points.push(point);
            failed_tasks.extend(group.failed.iter().cloned());
            analysis_failures.extend(group.analysis_failures.iter().cloned());
        }
        failed_tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        analysis_failures.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let best_point = points
            .iter()
            .filter_map(|p| p.frequency_z.map(|z| (z.abs(), p)))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, p)| p.clone());

        let fit = fit_points(&points);
        let minis_frequency = fit.and_then(|f| f.inverse(reference.frequency.mean));

        CampaignSummary {
            job_title: title,
            calcium: config.protocol().calcium,
            reference: reference.clone(),
            points,
            best_point,
            fit,
            minis_frequency,
            failed_tasks,
            analysis_failures,
            warnings,
        }
    }
}

fn z_score(mean: f64, reference_mean: f64, reference_std: f64) -> Option<f64> {
    (reference_std > 0.0).then(|| (mean - reference_mean) / reference_std)
}

fn point_stats(group: &Group, reference: &ReferenceStats) -> FrequencyStats {
    let freq = mean_std(&group.frequencies);
    let ampl = mean_std(&group.amplitudes);
    FrequencyStats {
        frequency: group.frequency,
        attempted: group.attempted,
        succeeded: group.succeeded,
        analyzed: group.frequencies.len(),
        mean_frequency: freq.map(|(m, _)| m),
        std_frequency: freq.map(|(_, s)| s),
        mean_amplitude: ampl.map(|(m, _)| m),
        std_amplitude: ampl.map(|(_, s)| s),
        amplitude_count: group.amplitudes.len(),
        frequency_z: freq.and_then(|(m, _)| z_score(m, reference.frequency.mean, reference.frequency.std)),
        amplitude_z: ampl
            .zip(reference.amplitude)
            .and_then(|((m, _), r)| z_score(m, r.mean, r.std)),
    }
}

/// Fit the calibration curve through the non-zero points with data. A zero
/// std (identical repetitions) is floored to the smallest positive std.
fn fit_points(points: &[FrequencyStats]) -> Option<CalibrationFit> {
    let usable: Vec<(f64, f64, f64)> = points
        .iter()
        .filter(|p| p.frequency > 0.0)
        .filter_map(|p| Some((p.frequency, p.mean_frequency?, p.std_frequency?)))
        .collect();
    if usable.len() < 2 {
        return None;
    }
    let floor = usable
        .iter()
        .map(|&(_, _, s)| s)
        .filter(|s| *s > 0.0)
        .min_by(f64::total_cmp)
        .unwrap_or(1.0);
    let fit_input: Vec<FitPoint> = usable
        .into_iter()
        .map(|(x, y, s)| FitPoint {
            x,
            y,
            sigma: if s > 0.0 { s } else { floor },
        })
        .collect();
    CalibrationFit::fit(&fit_input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::SAMPLE_JOB_CONFIG;

    #[test]
    fn test_mean_std_population() {
        let (mean, std) = mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((mean - 5.0).abs() < 1e-12);
        assert!((std - 2.0).abs() < 1e-12);
        assert_eq!(mean_std(&[]), None);
    }

    #[test]
    fn test_no_data_point_is_warning() {
        let config = JobConfig::from_yaml_str("config_PC_Exc.yaml", SAMPLE_JOB_CONFIG).unwrap();
        let mut aggregator = Aggregator::new();
        for _ in 0..2 {
            aggregator.expect("PC_Exc", 0.5);
        }
        aggregator.add(
            "PC_Exc",
            0.5,
            &TaskId::new("PC_Exc", 0.5, 0),
            TaskOutcome::AnalysisFailed(AnalysisError::TraceTooShort {
                duration_ms: 10.0,
                discard_ms: 1000.0,
            }),
        );
        let failed = FailedTask {
            task_id: TaskId::new("PC_Exc", 0.5, 1),
            attempts: 3,
            error: "exit 1".to_string(),
        };
        aggregator.add("PC_Exc", 0.5, &failed.task_id.clone(), TaskOutcome::SimulationFailed(failed));

        let summary = aggregator.summarize(&config);
        assert_eq!(summary.points.len(), 1);
        let point = &summary.points[0];
        assert!(point.is_no_data());
        assert_eq!((point.attempted, point.succeeded, point.analyzed), (2, 1, 0));
        assert_eq!(point.mean_frequency, None);
        assert_eq!(summary.warnings, vec![AggregationWarning::NoData { frequency: 0.5 }]);
        assert_eq!(summary.failed_tasks.len(), 1);
        assert_eq!(summary.analysis_failures.len(), 1);
        assert!(summary.best_point.is_none());
        assert!(summary.fit.is_none());
    }

    #[test]
    fn test_other_titles_ignored() {
        let config = JobConfig::from_yaml_str("config_PC_Exc.yaml", SAMPLE_JOB_CONFIG).unwrap();
        let mut aggregator = Aggregator::new();
        aggregator.expect("PC_Inh", 0.5);
        assert!(aggregator.summarize(&config).points.is_empty());
    }
}
