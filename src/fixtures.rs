//! Shared unit test fixtures.

/// Job config with every optional section present.
pub(crate) const SAMPLE_JOB_CONFIG: &str = "\
cells:
  $target: Mosaic
  mtype: L5_TPC:A
protocol:
  t_stop: 10000
  record_dt: 0.1
  hold_V: -70
  enable_ttx: true
  calcium: 1.25
results:
  frequency:
    mean: 13.2
    std: 4.1
  amplitude:
    mean: 10.7
    std: 0.8
  n: 12
analysis:
  peak_min_height: 4.5
";
