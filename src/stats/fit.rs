//! Calibration curve `f(x) = a·ln(1 + b·x)` by weighted Levenberg–Marquardt.

use serde::{Deserialize, Serialize};

/// Initial parameters `(a, b)`.
const START: (f64, f64) = (10.0, 1.0);
const MAX_ITERATIONS: usize = 500;
const TOLERANCE: f64 = 1e-12;

/// One observation: input frequency, mean output frequency, its std.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitPoint {
    /// Input frequency (Hz)
    pub x: f64,
    /// Mean detected frequency (Hz)
    pub y: f64,
    /// Standard deviation of `y`; residuals are divided by it
    pub sigma: f64,
}

/// Fitted curve mapping input frequency to detected frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFit {
    /// Scale
    pub a: f64,
    /// Rate
    pub b: f64,
    /// Weighted sum of squared residuals
    pub chi2: f64,
    /// Iterations until convergence
    pub iterations: usize,
}

impl CalibrationFit {
    /// Fit the curve. Points with `x == 0` carry no information on `b` and are
    /// skipped; `None` unless at least two points remain and the fit converges
    /// to finite parameters.
    #[must_use]
    pub fn fit(points: &[FitPoint]) -> Option<Self> {
        let points: Vec<FitPoint> = points
            .iter()
            .copied()
            .filter(|p| p.x > 0.0 && p.y.is_finite() && p.sigma > 0.0)
            .collect();
        if points.len() < 2 {
            return None;
        }

        let (mut a, mut b) = START;
        let mut cost = chi2(&points, a, b)?;
        let mut lambda = 1e-3;
        let mut iterations = 0;

        while iterations < MAX_ITERATIONS {
            iterations += 1;

            // Normal equations of the weighted residuals (y - f) / sigma.
            let (mut jtj, mut jtr) = ([[0.0_f64; 2]; 2], [0.0_f64; 2]);
            for p in &points {
                let inner = b.mul_add(p.x, 1.0);
                let da = inner.ln() / p.sigma;
                let db = a * p.x / inner / p.sigma;
                let r = (p.y - a * inner.ln()) / p.sigma;
                jtj[0][0] += da * da;
                jtj[0][1] += da * db;
                jtj[1][1] += db * db;
                jtr[0] += da * r;
                jtr[1] += db * r;
            }
            jtj[1][0] = jtj[0][1];

            let mut improved = false;
            while lambda < 1e16 {
                let m00 = jtj[0][0] * (1.0 + lambda);
                let m11 = jtj[1][1] * (1.0 + lambda);
                let det = m00.mul_add(m11, -jtj[0][1] * jtj[1][0]);
                if det.abs() < f64::MIN_POSITIVE {
                    lambda *= 10.0;
                    continue;
                }
                let da = (m11 * jtr[0] - jtj[0][1] * jtr[1]) / det;
                let db = (m00 * jtr[1] - jtj[1][0] * jtr[0]) / det;

                match chi2(&points, a + da, b + db) {
                    Some(next) if next <= cost => {
                        let converged = (cost - next) <= TOLERANCE * cost.max(TOLERANCE)
                            && da.abs() <= 1e-10 * (1.0 + a.abs())
                            && db.abs() <= 1e-10 * (1.0 + b.abs());
                        a += da;
                        b += db;
                        cost = next;
                        lambda = (lambda / 10.0).max(1e-15);
                        improved = true;
                        if converged {
                            return Self::finish(a, b, cost, iterations);
                        }
                        break;
                    }
                    _ => lambda *= 10.0,
                }
            }
            if !improved {
                break;
            }
        }
        Self::finish(a, b, cost, iterations)
    }

    fn finish(a: f64, b: f64, chi2: f64, iterations: usize) -> Option<Self> {
        (a.is_finite() && b.is_finite() && a != 0.0 && b != 0.0).then_some(Self {
            a,
            b,
            chi2,
            iterations,
        })
    }

    /// Detected frequency predicted for input frequency `x`.
    #[must_use]
    pub fn predict(&self, x: f64) -> f64 {
        self.a * self.b.mul_add(x, 1.0).ln()
    }

    /// Input frequency predicted to produce detected frequency `y`.
    #[must_use]
    pub fn inverse(&self, y: f64) -> Option<f64> {
        let x = (y / self.a).exp_m1() / self.b;
        x.is_finite().then_some(x)
    }
}

/// Weighted squared residuals; `None` outside the curve's domain.
fn chi2(points: &[FitPoint], a: f64, b: f64) -> Option<f64> {
    let mut sum = 0.0;
    for p in points {
        let inner = b.mul_add(p.x, 1.0);
        if inner <= 0.0 {
            return None;
        }
        let r = (p.y - a * inner.ln()) / p.sigma;
        sum += r * r;
    }
    sum.is_finite().then_some(sum)
}
