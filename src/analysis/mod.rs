//! Trace analysis: minis frequency and amplitude of one simulated cell
//!
//! The clamp current is reduced to a sign-normalized, baseline-subtracted
//! signal in pA; every local maximum of at least `peak_min_height` is one
//! mini. The first second of every trace is a settling period and is never
//! analyzed.

mod peaks;

pub use peaks::{find_peaks, local_maxima};

use serde::{Deserialize, Serialize};

use crate::campaign::TaskId;
use crate::config::SynapseClass;
use crate::error::AnalysisError;

/// Settling period discarded from the start of every trace (ms).
pub const DISCARD_MS: f64 = 1000.0;

/// Recorded samples of one simulated cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    time: Vec<f64>,
    voltage: Vec<f64>,
    current: Vec<f64>,
    events: Option<Vec<f64>>,
}

impl Trace {
    /// Create a trace from sample columns: time (ms), voltage (mV), current (nA).
    ///
    /// # Errors
    ///
    /// Returns `AnalysisError::MalformedTrace` if the columns differ in length,
    /// a time or current sample is NaN or infinite, or time is not
    /// non-decreasing.
    pub fn new(time: Vec<f64>, voltage: Vec<f64>, current: Vec<f64>) -> Result<Self, AnalysisError> {
        if time.len() != voltage.len() || time.len() != current.len() {
            return Err(AnalysisError::MalformedTrace(format!(
                "column lengths differ: time {}, voltage {}, current {}",
                time.len(),
                voltage.len(),
                current.len()
            )));
        }
        for (name, column) in [("time", &time), ("current", &current)] {
            if let Some(i) = column.iter().position(|v| !v.is_finite()) {
                return Err(AnalysisError::MalformedTrace(format!(
                    "{name} is not finite at sample {i}"
                )));
            }
        }
        if let Some(i) = time.windows(2).position(|w| !(w[0] <= w[1])) {
            return Err(AnalysisError::MalformedTrace(format!(
                "time is not sorted at sample {}",
                i + 1
            )));
        }
        Ok(Self {
            time,
            voltage,
            current,
            events: None,
        })
    }

    /// Attach recorded mini event times (ms).
    #[must_use]
    pub fn with_events(mut self, events: Vec<f64>) -> Self {
        self.events = Some(events);
        self
    }

    /// Sample times (ms).
    #[must_use]
    pub fn time(&self) -> &[f64] {
        &self.time
    }

    /// Membrane voltage (mV).
    #[must_use]
    pub fn voltage(&self) -> &[f64] {
        &self.voltage
    }

    /// Clamp current (nA).
    #[must_use]
    pub fn current(&self) -> &[f64] {
        &self.current
    }

    /// Recorded mini event times (ms), when the simulator reported them.
    #[must_use]
    pub fn events(&self) -> Option<&[f64]> {
        self.events.as_deref()
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.time.len()
    }

    /// Check if the trace holds no sample.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Recorded duration (ms).
    #[must_use]
    pub fn duration_ms(&self) -> f64 {
        match (self.time.first(), self.time.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }
}

/// One detected mini.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakEvent {
    /// Peak time (ms)
    pub time: f64,
    /// Baseline-subtracted, sign-normalized amplitude (pA)
    pub amplitude: f64,
    /// Time since the previous accepted peak (ms)
    pub interval: Option<f64>,
}

/// Analysis outcome of one task's trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    task_id: TaskId,
    frequency: f64,
    duration_ms: f64,
    baseline: f64,
    peaks: Vec<PeakEvent>,
}

impl AnalysisResult {
    /// Analyzed task.
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Detected minis per second of analyzed trace (Hz).
    #[must_use]
    pub const fn frequency(&self) -> f64 {
        self.frequency
    }

    /// Analyzed duration (ms).
    #[must_use]
    pub const fn duration_ms(&self) -> f64 {
        self.duration_ms
    }

    /// Mean clamp current of the analyzed window (nA).
    #[must_use]
    pub const fn baseline(&self) -> f64 {
        self.baseline
    }

    /// Accepted peaks in time order.
    #[must_use]
    pub fn peaks(&self) -> &[PeakEvent] {
        &self.peaks
    }

    /// Number of accepted peaks.
    #[must_use]
    pub fn peak_count(&self) -> usize {
        self.peaks.len()
    }

    /// Peak amplitudes (pA).
    #[must_use]
    pub fn amplitudes(&self) -> Vec<f64> {
        self.peaks.iter().map(|p| p.amplitude).collect()
    }
}

/// Detect minis in a trace.
///
/// 1. Samples at or before `t0 + 1000 ms` are dropped.
/// 2. The mean current of the remaining window is subtracted; excitatory
///    traces are flipped so that inward currents become positive.
/// 3. Local maxima of at least `peak_min_height` pA are accepted.
///
/// Frequency is `peaks / ((t_last - t_first) / 1000)` over the window.
///
/// # Errors
///
/// - `TraceTooShort` if fewer than two samples, or zero duration, remain.
/// - `ImplausiblePeaks` if recorded events exist and are outnumbered by the
///   detected peaks.
pub fn analyze_trace(
    task_id: TaskId,
    trace: &Trace,
    synapse: SynapseClass,
    peak_min_height: f64,
) -> Result<AnalysisResult, AnalysisError> {
    let too_short = || AnalysisError::TraceTooShort {
        duration_ms: trace.duration_ms(),
        discard_ms: DISCARD_MS,
    };

    let t0 = *trace.time.first().ok_or_else(too_short)?;
    let cutoff = t0 + DISCARD_MS;
    let start = trace.time.partition_point(|&t| t <= cutoff);

    let time = &trace.time[start..];
    let current = &trace.current[start..];
    if time.len() < 2 {
        return Err(too_short());
    }
    let duration_ms = time[time.len() - 1] - time[0];
    if duration_ms <= 0.0 {
        return Err(too_short());
    }

    #[allow(clippy::cast_precision_loss)]
    let baseline = current.iter().sum::<f64>() / current.len() as f64;
    let polarity = synapse.polarity();
    let signal: Vec<f64> = current
        .iter()
        .map(|c| (c - baseline) * polarity * 1000.0)
        .collect();

    let mut peaks = Vec::new();
    let mut previous: Option<f64> = None;
    for i in find_peaks(&signal, peak_min_height) {
        peaks.push(PeakEvent {
            time: time[i],
            amplitude: signal[i],
            interval: previous.map(|p| time[i] - p),
        });
        previous = Some(time[i]);
    }

    if let Some(events) = trace.events() {
        let recorded = events.iter().filter(|&&t| t > cutoff).count();
        if peaks.len() > recorded {
            return Err(AnalysisError::ImplausiblePeaks {
                peaks: peaks.len(),
                events: recorded,
            });
        }
    }

    #[allow(clippy::cast_precision_loss)]
    let frequency = peaks.len() as f64 / (duration_ms / 1000.0);

    Ok(AnalysisResult {
        task_id,
        frequency,
        duration_ms,
        baseline,
        peaks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 0.1 ms sampling from 0 to `t_stop`, with square pulses of `height` nA.
    fn pulse_trace(t_stop: f64, pulses: &[f64], height: f64) -> Trace {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let n = (t_stop / 0.1) as usize + 1;
        #[allow(clippy::cast_precision_loss)]
        let time: Vec<f64> = (0..n).map(|i| i as f64 * 0.1).collect();
        let current = time
            .iter()
            .map(|t| {
                if pulses.iter().any(|p| (t - p).abs() < 0.05) {
                    height
                } else {
                    0.0
                }
            })
            .collect();
        Trace::new(time.clone(), vec![-70.0; n], current).unwrap()
    }

    fn id() -> TaskId {
        TaskId::from("PC_Exc-f0.100-r000")
    }

    #[test]
    fn test_zero_peaks() {
        let trace = pulse_trace(3000.0, &[], 0.0);
        let result = analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).unwrap();
        assert!(result.frequency().abs() < f64::EPSILON);
        assert!(result.amplitudes().is_empty());
        assert!((result.duration_ms() - 1999.9).abs() < 1e-6);
    }

    #[test]
    fn test_exc_inward_currents_flipped() {
        // -10 pA inward pulses
        let trace = pulse_trace(3000.0, &[1500.0, 2500.0], -0.010);
        let result = analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).unwrap();
        assert_eq!(result.peak_count(), 2);
        assert!((result.peaks()[0].time - 1500.0).abs() < 1e-6);
        assert!((result.peaks()[0].amplitude - 10.0).abs() < 0.01);
        assert_eq!(result.peaks()[0].interval, None);
        assert!((result.peaks()[1].interval.unwrap() - 1000.0).abs() < 1e-6);

        // The same pulses are troughs for an inhibitory analysis.
        let result = analyze_trace(id(), &trace, SynapseClass::Inh, 4.5).unwrap();
        assert_eq!(result.peak_count(), 0);
    }

    #[test]
    fn test_non_finite_samples_rejected() {
        let trace = pulse_trace(3000.0, &[1500.0, 2500.0], -0.020);
        let mut current = trace.current().to_vec();
        current[20_000] = f64::NAN;
        let err = Trace::new(trace.time().to_vec(), trace.voltage().to_vec(), current).unwrap_err();
        assert!(matches!(err, AnalysisError::MalformedTrace(ref msg) if msg.contains("current")));

        let mut time = trace.time().to_vec();
        *time.last_mut().unwrap() = f64::INFINITY;
        let err = Trace::new(time, trace.voltage().to_vec(), trace.current().to_vec()).unwrap_err();
        assert!(matches!(err, AnalysisError::MalformedTrace(ref msg) if msg.contains("time")));
    }

    #[test]
    fn test_settling_period_discarded() {
        let trace = pulse_trace(3000.0, &[500.0, 1500.0], -0.010);
        let result = analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).unwrap();
        assert_eq!(result.peak_count(), 1);
    }

    #[test]
    fn test_below_threshold_rejected() {
        let trace = pulse_trace(3000.0, &[1500.0], -0.004);
        let result = analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).unwrap();
        assert_eq!(result.peak_count(), 0);
    }

    #[test]
    fn test_trace_shorter_than_discard() {
        let trace = pulse_trace(900.0, &[], 0.0);
        let err = analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).unwrap_err();
        assert!(matches!(err, AnalysisError::TraceTooShort { .. }));

        let trace = Trace::new(vec![], vec![], vec![]).unwrap();
        assert!(analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).is_err());
    }

    #[test]
    fn test_implausible_peaks() {
        let trace = pulse_trace(3000.0, &[1500.0, 2500.0], -0.010).with_events(vec![400.0, 1499.0]);
        let err = analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).unwrap_err();
        assert_eq!(err, AnalysisError::ImplausiblePeaks { peaks: 2, events: 1 });

        let trace = pulse_trace(3000.0, &[1500.0, 2500.0], -0.010).with_events(vec![1499.0, 2499.0]);
        assert!(analyze_trace(id(), &trace, SynapseClass::Exc, 4.5).is_ok());
    }

    #[test]
    fn test_malformed_trace() {
        assert!(Trace::new(vec![0.0, 1.0], vec![0.0], vec![0.0, 0.0]).is_err());
        assert!(Trace::new(vec![1.0, 0.0], vec![0.0; 2], vec![0.0; 2]).is_err());
    }
}
