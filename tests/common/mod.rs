//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::path::Path;

use minis_validation::campaign::{build_matrix, SimulationTask};
use minis_validation::config::{FrequencySet, JobConfig};
use minis_validation::runner::SimulatorRunner;

/// Job config body with a given reference frequency.
pub fn job_config_yaml(ref_frequency: f64) -> String {
    format!(
        "\
cells:
  $target: Mosaic
  mtype: L5_TPC:A
protocol:
  t_stop: 3000
  record_dt: 1.0
  hold_V: -70
  enable_ttx: true
  calcium: 1.25
results:
  frequency:
    mean: {ref_frequency}
    std: 1.5
analysis:
  peak_min_height: 4.5
"
    )
}

/// Parse a job config without touching the filesystem.
pub fn job_config(file_name: &str) -> JobConfig {
    JobConfig::from_yaml_str(file_name, &job_config_yaml(8.0)).unwrap()
}

/// Write `config_<title>.yaml` for every title into `dir`.
pub fn write_job_configs(dir: &Path, titles: &[&str]) {
    std::fs::create_dir_all(dir).unwrap();
    for title in titles {
        std::fs::write(dir.join(format!("config_{title}.yaml")), job_config_yaml(8.0)).unwrap();
    }
}

/// Write a frequency TSV.
pub fn write_frequencies(path: &Path, values: &[f64]) {
    let mut text = String::from("MINIS_FREQ\n");
    for v in values {
        text.push_str(&format!("{v}\n"));
    }
    std::fs::write(path, text).unwrap();
}

/// Tasks for one `PC_Exc` config.
pub fn tasks(frequencies: &[f64], repetitions: u32) -> Vec<SimulationTask> {
    let freqs = FrequencySet::new(frequencies.to_vec()).unwrap();
    build_matrix(&[job_config("config_PC_Exc.yaml")], &freqs, repetitions, 0).unwrap()
}

/// Shell simulator writing a 3 s trace at 1 ms sampling to `$2`.
///
/// Events are single-sample 10 pA pulses (inward for Exc, outward for Inh)
/// after the first second; their count is `int(10 * ln(1 + 20 * frequency))`. Tasks
/// whose id appears in `$FAIL_IDS` (space separated) exit 1.
const SIMULATOR_SCRIPT: &str = r#"
stimulus="$1"
trace="$2"
id=$(sed -n 's/.*"task_id": "\([^"]*\)".*/\1/p' "$stimulus" | head -n 1)
for bad in $FAIL_IDS; do
  if [ "$bad" = "$id" ]; then
    echo "simulated crash for $id" >&2
    exit 1
  fi
done
sign=-1
if grep -q '"synapse": "Inh"' "$stimulus"; then sign=1; fi
freq=$(sed -n 's/.*"frequency": \([0-9.eE+-]*\).*/\1/p' "$stimulus" | head -n 1)
awk -v f="$freq" -v s="$sign" 'BEGIN {
  n = int(10 * log(1 + 20 * f));
  print "time,voltage,current";
  for (i = 0; i < 3000; i++) {
    c = 0;
    if (i > 1000 && n > 0) {
      period = int(1999 / n);
      k = i - 1001;
      if (k % period == period - 1 && int(k / period) < n) c = s * 0.01;
    }
    printf "%d,-70,%g\n", i, c;
  }
}' > "$trace"
"#;

/// Expected peak count of [`SIMULATOR_SCRIPT`] for `frequency`.
pub fn expected_peaks(frequency: f64) -> usize {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let n = (10.0 * 20.0f64.mul_add(frequency, 1.0).ln()) as usize;
    n
}

/// Runner executing [`SIMULATOR_SCRIPT`] through `sh`; `fail_ids` always crash.
pub fn shell_runner(output_dir: &Path, fail_ids: &[&str]) -> SimulatorRunner {
    let script = format!("FAIL_IDS='{}'\n{SIMULATOR_SCRIPT}", fail_ids.join(" "));
    SimulatorRunner::new(
        "sh",
        vec!["-c".to_string(), script, "minis-sim".to_string()],
        "simulation.json",
        output_dir,
    )
}
