//! Trace analysis on synthetic voltage-clamp recordings

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use minis_validation::analysis::{analyze_trace, Trace, DISCARD_MS};
use minis_validation::artifact::{read_trace, write_events, write_trace};
use minis_validation::campaign::TaskId;
use minis_validation::config::SynapseClass;
use minis_validation::AnalysisError;

const DT: f64 = 0.1;
const SAMPLES: usize = 100_000;
const TAU_RISE: f64 = 0.5;
const TAU_DECAY: f64 = 3.0;

/// Double exponential with unit peak.
fn kernel(t: f64) -> f64 {
    let t_peak = (TAU_DECAY / TAU_RISE).ln() * TAU_RISE * TAU_DECAY / (TAU_DECAY - TAU_RISE);
    let norm = (-t_peak / TAU_DECAY).exp() - (-t_peak / TAU_RISE).exp();
    ((-t / TAU_DECAY).exp() - (-t / TAU_RISE).exp()) / norm
}

/// 10 s recording with minis of `amplitudes` (pA) at `onsets` (ms).
/// Currents are in nA; excitatory minis are inward (negative).
fn synthetic_trace(onsets: &[f64], amplitudes: &[f64], synapse: SynapseClass) -> Trace {
    #[allow(clippy::cast_precision_loss)]
    let time: Vec<f64> = (0..SAMPLES).map(|i| i as f64 * DT).collect();
    let mut current = vec![-0.05; SAMPLES];
    for (&onset, &amplitude) in onsets.iter().zip(amplitudes) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let first = (onset / DT).ceil() as usize;
        for (i, c) in current.iter_mut().enumerate().skip(first).take(1000) {
            *c += synapse.polarity() * amplitude / 1000.0 * kernel(time[i] - onset);
        }
    }
    Trace::new(time, vec![-70.0; SAMPLES], current).unwrap()
}

fn reference_onsets() -> Vec<f64> {
    (0..119).map(|k| 1010.0 + f64::from(k) * 8900.0 / 119.0).collect()
}

fn reference_amplitudes() -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..119).map(|_| rng.gen_range(9.9..11.5)).collect()
}

fn id() -> TaskId {
    TaskId::new("L5_TPC_Exc", 0.1, 0)
}

#[test]
fn test_reference_scenario_matches_published_statistics() {
    let trace = synthetic_trace(&reference_onsets(), &reference_amplitudes(), SynapseClass::Exc);
    let result = analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).unwrap();

    assert_eq!(result.peak_count(), 119);
    let expected = 119.0 / (result.duration_ms() / 1000.0);
    assert!((result.frequency() - expected).abs() < 1e-9);
    assert!((result.frequency() - 13.2).abs() < 0.1, "frequency {}", result.frequency());

    // Mean subtraction lowers every height by the average event charge.
    #[allow(clippy::cast_precision_loss)]
    let mean = result.amplitudes().iter().sum::<f64>() / result.peak_count() as f64;
    assert!((mean - 10.7).abs() < 1.0, "amplitude mean {mean}");
    assert!(result.peaks()[0].interval.is_none());
    assert!(result.peaks()[1..]
        .iter()
        .all(|p| (p.interval.unwrap() - 8900.0 / 119.0).abs() < 0.2));
}

#[test]
fn test_inhibitory_polarity() {
    let trace = synthetic_trace(&reference_onsets(), &reference_amplitudes(), SynapseClass::Inh);
    let result = analyze_trace(id(), &trace, SynapseClass::Inh, 4.5).unwrap();
    assert_eq!(result.peak_count(), 119);

    // Read with the wrong polarity, outward minis are troughs.
    let flipped = analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).unwrap();
    assert_eq!(flipped.peak_count(), 0);
}

#[test]
fn test_settling_period_is_discarded() {
    let mut onsets = vec![200.0, 500.0, 900.0];
    onsets.extend(reference_onsets());
    let mut amplitudes = vec![10.0; 3];
    amplitudes.extend(reference_amplitudes());

    let trace = synthetic_trace(&onsets, &amplitudes, SynapseClass::Exc);
    let result = analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).unwrap();
    assert_eq!(result.peak_count(), 119);
    assert!(result.peaks().iter().all(|p| p.time > DISCARD_MS));
}

#[test]
fn test_threshold_filters_small_minis() {
    let onsets = reference_onsets();
    let amplitudes: Vec<f64> = (0..119).map(|k| if k % 2 == 0 { 10.0 } else { 2.0 }).collect();
    let trace = synthetic_trace(&onsets, &amplitudes, SynapseClass::Exc);
    let result = analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).unwrap();
    assert_eq!(result.peak_count(), 60);
}

#[test]
fn test_flat_trace_has_no_minis() {
    let trace = synthetic_trace(&[], &[], SynapseClass::Exc);
    let result = analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).unwrap();
    assert_eq!(result.peak_count(), 0);
    assert!(result.frequency().abs() < f64::EPSILON);
    assert!(result.amplitudes().is_empty());
}

#[test]
fn test_trace_within_discard_window_is_rejected() {
    let time: Vec<f64> = (0..5000).map(|i| f64::from(i) * DT).collect();
    let trace = Trace::new(time, vec![-70.0; 5000], vec![0.0; 5000]).unwrap();
    let err = analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).unwrap_err();
    assert!(matches!(err, AnalysisError::TraceTooShort { .. }));
}

#[test]
fn test_more_peaks_than_events_is_implausible() {
    let onsets = reference_onsets();
    let trace = synthetic_trace(&onsets, &reference_amplitudes(), SynapseClass::Exc)
        .with_events(onsets[..50].to_vec());
    let err = analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).unwrap_err();
    assert_eq!(err, AnalysisError::ImplausiblePeaks { peaks: 119, events: 50 });

    let trace = synthetic_trace(&onsets, &reference_amplitudes(), SynapseClass::Exc)
        .with_events(onsets.clone());
    assert!(analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).is_ok());
}

#[test]
fn test_analysis_survives_parquet_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let onsets = reference_onsets();
    let trace = synthetic_trace(&onsets, &reference_amplitudes(), SynapseClass::Exc);
    let trace_path = dir.path().join("t.trace.parquet");
    let events_path = dir.path().join("t.events.parquet");
    write_trace(&trace_path, &trace).unwrap();
    write_events(&events_path, &onsets).unwrap();

    let loaded = read_trace(&trace_path, Some(&events_path)).unwrap();
    assert_eq!(loaded.len(), SAMPLES);
    let direct = analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).unwrap();
    let reloaded = analyze_trace(id(), &loaded, SynapseClass::Exc, 4.5).unwrap();
    assert_eq!(direct.peaks(), reloaded.peaks());
}
