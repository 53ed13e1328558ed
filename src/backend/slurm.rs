//! SLURM implementation of [`ArrayScheduler`]: `sbatch`, `sacct`, `scancel`.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use tokio::process::Command;

use super::cluster::{ArrayScheduler, ArraySpec, ArrayTaskState};
use crate::{Error, Result};

/// `sbatch` options owned by the backend; users may not set them.
const RESERVED_KEYS: [&str; 5] = ["time", "array", "output", "error", "parsable"];

/// Parse the flattened `--slurm key value` pairs of the command line.
///
/// Leading dashes on keys are dropped, so `--slurm --account proj` and
/// `--slurm account proj` are equivalent.
///
/// # Errors
///
/// Returns `Error::Config` for an odd number of items or a reserved key.
/// The wall-time limit in particular comes from the per-task timeout.
pub fn parse_slurm_args(flat: &[String]) -> Result<Vec<(String, String)>> {
    if flat.len() % 2 != 0 {
        return Err(Error::Config(
            "--slurm takes a key and a value".to_string(),
        ));
    }
    let mut pairs = Vec::with_capacity(flat.len() / 2);
    for pair in flat.chunks(2) {
        let key = pair[0].trim_start_matches('-').to_string();
        if key.is_empty() {
            return Err(Error::Config("empty --slurm key".to_string()));
        }
        if key == "time" {
            return Err(Error::Config(
                "`time` is not allowed in --slurm, set the limit with --timeout-s".to_string(),
            ));
        }
        if RESERVED_KEYS.contains(&key.as_str()) {
            return Err(Error::Config(format!("`{key}` is managed by the cluster backend")));
        }
        pairs.push((key, pair[1].clone()));
    }
    Ok(pairs)
}

/// Compact `--array` value: consecutive indices become ranges, `%P` caps
/// the number of elements running at once.
///
/// `[0, 1, 2, 5, 7, 8]` with parallelism 2 → `0-2,5,7-8%2`.
#[must_use]
pub fn format_array_spec(indices: &[usize], parallelism: usize) -> String {
    let mut sorted = indices.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut spec = String::new();
    let mut i = 0;
    while i < sorted.len() {
        let start = sorted[i];
        let mut end = start;
        while i + 1 < sorted.len() && sorted[i + 1] == end + 1 {
            i += 1;
            end = sorted[i];
        }
        if !spec.is_empty() {
            spec.push(',');
        }
        if start == end {
            let _ = write!(spec, "{start}");
        } else {
            let _ = write!(spec, "{start}-{end}");
        }
        i += 1;
    }
    let _ = write!(spec, "%{}", parallelism.max(1));
    spec
}

/// `--time` value, rounded up to whole seconds.
#[must_use]
pub fn format_time_limit(limit: Duration) -> String {
    let total = limit.as_secs() + u64::from(limit.subsec_nanos() > 0);
    let (days, rest) = (total / 86_400, total % 86_400);
    let (hours, minutes, seconds) = (rest / 3600, rest % 3600 / 60, rest % 60);
    if days > 0 {
        format!("{days}-{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}

fn parse_state(raw: &str) -> ArrayTaskState {
    let word = raw.split_whitespace().next().unwrap_or_default();
    match word.trim_end_matches('+') {
        "PENDING" | "REQUEUED" | "RESIZING" | "SUSPENDED" => ArrayTaskState::Pending,
        "RUNNING" | "COMPLETING" | "CONFIGURING" | "STAGE_OUT" => ArrayTaskState::Running,
        "COMPLETED" => ArrayTaskState::Completed,
        "TIMEOUT" => ArrayTaskState::TimedOut,
        "CANCELLED" => ArrayTaskState::Cancelled,
        "" => ArrayTaskState::Pending,
        other => ArrayTaskState::Failed(other.to_string()),
    }
}

fn expand_indices(field: &str) -> Option<Vec<usize>> {
    let Some(list) = field.strip_prefix('[') else {
        return field.parse().ok().map(|i| vec![i]);
    };
    let list = list.strip_suffix(']')?;
    let list = list.split('%').next()?;

    let mut indices = Vec::new();
    for part in list.split(',') {
        match part.split_once('-') {
            Some((a, b)) => indices.extend(a.parse::<usize>().ok()?..=b.parse::<usize>().ok()?),
            None => indices.push(part.parse().ok()?),
        }
    }
    Some(indices)
}

/// Parse `sacct --format=JobID,State --noheader --parsable2` output for the
/// elements of array job `job_id`.
///
/// Job steps (`123_4.batch`) and lines of other jobs are ignored; pending
/// ranges such as `123_[6-9%2]` are expanded.
#[must_use]
pub fn parse_sacct(output: &str, job_id: &str) -> Vec<(usize, ArrayTaskState)> {
    let mut states = Vec::new();
    for line in output.lines() {
        let mut fields = line.trim().split('|');
        let (Some(id), Some(state)) = (fields.next(), fields.next()) else {
            continue;
        };
        if id.contains('.') {
            continue;
        }
        let Some((job, element)) = id.split_once('_') else {
            continue;
        };
        if job != job_id {
            continue;
        }
        let Some(indices) = expand_indices(element) else {
            tracing::debug!(line, "unparseable sacct line");
            continue;
        };
        let state = parse_state(state);
        states.extend(indices.into_iter().map(|i| (i, state.clone())));
    }
    states
}

/// Job id from `sbatch --parsable` output (`<id>` or `<id>;<cluster>`).
fn parse_sbatch_output(stdout: &str) -> Option<String> {
    let id = stdout.trim().split(';').next()?.trim();
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
}

/// Talks to SLURM through its command line tools.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlurmScheduler {
    sbatch_args: Vec<(String, String)>,
}

impl SlurmScheduler {
    /// Scheduler passing `--key=value` for every pair to `sbatch`.
    #[must_use]
    pub const fn new(sbatch_args: Vec<(String, String)>) -> Self {
        Self { sbatch_args }
    }

    async fn run(program: &str, args: &[String]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Scheduler(format!("cannot run {program}: {e}")))?;
        if !output.status.success() {
            return Err(Error::Scheduler(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn sbatch_command(&self, script: &Path, spec: &ArraySpec) -> Vec<String> {
        let mut args = vec![
            "--parsable".to_string(),
            format!("--array={}", format_array_spec(&spec.indices, spec.parallelism)),
            format!("--time={}", format_time_limit(spec.time_limit)),
            format!("--output={}", spec.log_dir.join("%A_%a.out").display()),
            format!("--error={}", spec.log_dir.join("%A_%a.err").display()),
        ];
        args.extend(self.sbatch_args.iter().map(|(k, v)| format!("--{k}={v}")));
        args.push(script.display().to_string());
        args
    }
}

impl ArrayScheduler for SlurmScheduler {
    async fn submit_array(&self, script: &Path, spec: &ArraySpec) -> Result<String> {
        let args = self.sbatch_command(script, spec);
        tracing::debug!(?args, "sbatch");
        let stdout = Self::run("sbatch", &args).await?;
        parse_sbatch_output(&stdout)
            .ok_or_else(|| Error::Scheduler(format!("unexpected sbatch output `{}`", stdout.trim())))
    }

    async fn query(&self, job_id: &str) -> Result<Vec<(usize, ArrayTaskState)>> {
        let args = [
            "-j",
            job_id,
            "--format=JobID,State",
            "--noheader",
            "--parsable2",
        ]
        .map(String::from);
        let stdout = Self::run("sacct", &args).await?;
        Ok(parse_sacct(&stdout, job_id))
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        Self::run("scancel", &[job_id.to_string()]).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_array_spec_ranges() {
        assert_eq!(format_array_spec(&(0..30).collect::<Vec<_>>(), 200), "0-29%200");
        assert_eq!(format_array_spec(&[0, 1, 2, 5, 7, 8], 2), "0-2,5,7-8%2");
        assert_eq!(format_array_spec(&[4], 10), "4%10");
        assert_eq!(format_array_spec(&[3, 1, 2, 2], 0), "1-3%1");
    }

    #[test]
    fn test_time_limit() {
        assert_eq!(format_time_limit(Duration::from_secs(3600)), "01:00:00");
        assert_eq!(format_time_limit(Duration::from_millis(61_500)), "00:01:02");
        assert_eq!(format_time_limit(Duration::from_secs(90_061)), "1-01:01:01");
    }

    #[test]
    fn test_parse_sacct() {
        let output = "\
4242_0|COMPLETED
4242_0.batch|COMPLETED
4242_1|FAILED
4242_2|TIMEOUT
4242_3|CANCELLED by 1234
4242_4|RUNNING
4242_5|OUT_OF_MEMORY
4242_[6-8,10%2]|PENDING
9999_0|FAILED
";
        let states = parse_sacct(output, "4242");
        assert_eq!(states.len(), 10);
        assert_eq!(states[0], (0, ArrayTaskState::Completed));
        assert_eq!(states[1], (1, ArrayTaskState::Failed("FAILED".to_string())));
        assert_eq!(states[2], (2, ArrayTaskState::TimedOut));
        assert_eq!(states[3], (3, ArrayTaskState::Cancelled));
        assert_eq!(states[4], (4, ArrayTaskState::Running));
        assert_eq!(states[5], (5, ArrayTaskState::Failed("OUT_OF_MEMORY".to_string())));
        let pending: Vec<_> = states[6..].iter().map(|(i, _)| *i).collect();
        assert_eq!(pending, vec![6, 7, 8, 10]);
        assert!(states[6..].iter().all(|(_, s)| *s == ArrayTaskState::Pending));
    }

    #[test]
    fn test_parse_sbatch_output() {
        assert_eq!(parse_sbatch_output("123456\n"), Some("123456".to_string()));
        assert_eq!(parse_sbatch_output("77;cluster1"), Some("77".to_string()));
        assert_eq!(parse_sbatch_output("Submitted batch job 5"), None);
    }

    #[test]
    fn test_parse_slurm_args() {
        let flat: Vec<String> = ["account", "proj42", "--partition", "prod"]
            .map(String::from)
            .to_vec();
        let pairs = parse_slurm_args(&flat).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("account".to_string(), "proj42".to_string()),
                ("partition".to_string(), "prod".to_string())
            ]
        );

        let err = parse_slurm_args(&["time".to_string(), "1:00:00".to_string()]).unwrap_err();
        assert!(err.to_string().contains("--timeout-s"));
        assert!(parse_slurm_args(&["array".to_string(), "1-3".to_string()]).is_err());
        assert!(parse_slurm_args(&["account".to_string()]).is_err());
    }

    #[test]
    fn test_sbatch_command() {
        let scheduler = SlurmScheduler::new(vec![("account".into(), "proj42".into())]);
        let spec = ArraySpec {
            indices: vec![0, 1, 2],
            parallelism: 200,
            time_limit: Duration::from_secs(600),
            log_dir: PathBuf::from("/logs"),
        };
        let args = scheduler.sbatch_command(Path::new("/work/job.sh"), &spec);
        assert_eq!(
            args,
            vec![
                "--parsable",
                "--array=0-2%200",
                "--time=00:10:00",
                "--output=/logs/%A_%a.out",
                "--error=/logs/%A_%a.err",
                "--account=proj42",
                "/work/job.sh",
            ]
        );
    }
}
