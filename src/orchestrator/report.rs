//! Report files of a campaign and of offline analysis.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::JobConfig;
use crate::stats::{CampaignSummary, FailedTask};
use crate::Result;

/// Outcome of one `simulate` run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignReport {
    /// Campaign id
    pub campaign_id: String,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
    /// Tasks in the matrix
    pub total_tasks: usize,
    /// Tasks with a trace, resumed ones included
    pub succeeded: usize,
    /// Tasks skipped because their artifact already existed
    pub resumed: usize,
    /// Tasks stopped by cancellation at the campaign deadline
    pub cancelled: usize,
    /// Whether the campaign deadline passed before every task finished
    pub timed_out: bool,
    /// Permanently failed simulations, all job configs
    pub failed_tasks: Vec<FailedTask>,
    /// One summary per job config
    pub summaries: Vec<CampaignSummary>,
}

impl fmt::Display for CampaignReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "campaign {}: {}/{} tasks succeeded ({} resumed), {} failed{}",
            self.campaign_id,
            self.succeeded,
            self.total_tasks,
            self.resumed,
            self.failed_tasks.len(),
            if self.timed_out { ", timed out" } else { "" },
        )?;
        for summary in &self.summaries {
            let reference = &summary.reference.frequency;
            write!(
                f,
                "  {:<24} ref {:>7.3} ± {:<7.3} Hz",
                summary.job_title, reference.mean, reference.std
            )?;
            match summary.best_point.as_ref().and_then(|p| Some((p, p.mean_frequency?, p.frequency_z?))) {
                Some((point, mean, z)) => write!(
                    f,
                    "  closest input {:.3} Hz -> {mean:.3} Hz (z = {z:+.2})",
                    point.frequency
                )?,
                None => write!(f, "  no data")?,
            }
            if let Some(minis) = summary.minis_frequency {
                write!(f, "  minis_frequency = {minis:.4}")?;
            }
            writeln!(f)?;
        }
        for failed in &self.failed_tasks {
            writeln!(f, "  FAILED {} after {} attempt(s): {}", failed.task_id, failed.attempts, failed.error)?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct FrequencyRow {
    calcium: f64,
    input_freq: f64,
    mean_freq: Option<f64>,
    std_freq: Option<f64>,
    n: usize,
}

#[derive(Serialize)]
struct JobResultRow<'a> {
    pathway: &'a str,
    ref_freq: f64,
    ref_std: f64,
    #[serde(rename = "Ca")]
    calcium: f64,
    minis_freq: Option<f64>,
}

/// `analysis/frequencies.tsv`: one row per input frequency. No-data points
/// have empty mean and std.
///
/// # Errors
///
/// Returns error if the file cannot be written.
pub fn write_frequencies_tsv(path: &Path, summary: &CampaignSummary) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    for point in &summary.points {
        writer.serialize(FrequencyRow {
            calcium: summary.calcium,
            input_freq: point.frequency,
            mean_freq: point.mean_frequency,
            std_freq: point.std_frequency,
            n: point.analyzed,
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the analysis outputs of one job directory:
/// `analysis/frequencies.tsv`, `analysis/summary.json` and, when the fit
/// succeeded, the calibrated job config.
///
/// # Errors
///
/// Returns error if a file cannot be written.
pub fn write_job_outputs(job_dir: &Path, config: &JobConfig, summary: &CampaignSummary) -> Result<()> {
    let analysis_dir = job_dir.join("analysis");
    std::fs::create_dir_all(&analysis_dir)?;

    write_frequencies_tsv(&analysis_dir.join("frequencies.tsv"), summary)?;
    std::fs::write(
        analysis_dir.join("summary.json"),
        serde_json::to_vec_pretty(summary)?,
    )?;

    if let Some(minis_frequency) = summary.minis_frequency {
        std::fs::write(
            job_dir.join(config.file_name()),
            config.calibrated_yaml(minis_frequency)?,
        )?;
    } else {
        tracing::warn!(job = %summary.job_title, "no calibration fit, calibrated config not written");
    }
    Ok(())
}

/// `job_results.csv`: reference and calibrated frequency per pathway.
///
/// # Errors
///
/// Returns error if the file cannot be written.
pub fn write_job_results(path: &Path, summaries: &[CampaignSummary]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for summary in summaries {
        writer.serialize(JobResultRow {
            pathway: &summary.job_title,
            ref_freq: summary.reference.frequency.mean,
            ref_std: summary.reference.frequency.std,
            calcium: summary.calcium,
            minis_freq: summary.minis_frequency,
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MeanStd, ReferenceStats};
    use crate::stats::FrequencyStats;

    fn summary() -> CampaignSummary {
        let point = |frequency, mean: Option<f64>| FrequencyStats {
            frequency,
            attempted: 2,
            succeeded: 2,
            analyzed: usize::from(mean.is_some()) * 2,
            mean_frequency: mean,
            std_frequency: mean.map(|_| 0.5),
            mean_amplitude: None,
            std_amplitude: None,
            amplitude_count: 0,
            frequency_z: mean.map(|m| (m - 13.2) / 4.1),
            amplitude_z: None,
        };
        CampaignSummary {
            job_title: "PC_Exc".to_string(),
            calcium: 1.25,
            reference: ReferenceStats {
                frequency: MeanStd { mean: 13.2, std: 4.1 },
                amplitude: None,
                n: None,
            },
            points: vec![point(0.1, Some(12.0)), point(0.2, None)],
            best_point: Some(point(0.1, Some(12.0))),
            fit: None,
            minis_frequency: Some(0.125),
            failed_tasks: vec![],
            analysis_failures: vec![],
            warnings: vec![],
        }
    }

    #[test]
    fn test_frequencies_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frequencies.tsv");
        write_frequencies_tsv(&path, &summary()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "calcium\tinput_freq\tmean_freq\tstd_freq\tn");
        assert_eq!(lines[1], "1.25\t0.1\t12.0\t0.5\t2");
        assert_eq!(lines[2], "1.25\t0.2\t\t\t0");
    }

    #[test]
    fn test_job_results_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job_results.csv");
        write_job_results(&path, &[summary()]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "pathway,ref_freq,ref_std,Ca,minis_freq\nPC_Exc,13.2,4.1,1.25,0.125\n"
        );
    }

    #[test]
    fn test_report_display() {
        let report = CampaignReport {
            campaign_id: "c1".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            total_tasks: 4,
            succeeded: 3,
            resumed: 1,
            cancelled: 0,
            timed_out: false,
            failed_tasks: vec![],
            summaries: vec![summary()],
        };
        let text = report.to_string();
        assert!(text.starts_with("campaign c1: 3/4 tasks succeeded (1 resumed), 0 failed\n"));
        assert!(text.contains("PC_Exc"));
        assert!(text.contains("minis_frequency = 0.1250"));
    }
}
