//! Local maxima detection over a sampled signal.

/// Indices of local maxima.
///
/// A sample is a maximum when its left neighbour is strictly lower and the
/// first differing sample on its right is strictly lower. Flat tops count once,
/// at their middle sample (rounded down). The first and last samples are never
/// maxima.
#[must_use]
pub fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut maxima = Vec::new();
    if x.len() < 3 {
        return maxima;
    }
    let last = x.len() - 1;

    let mut i = 1;
    while i < last {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead < last && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                maxima.push((i + ahead - 1) / 2);
                i = ahead;
            }
        }
        i += 1;
    }
    maxima
}

/// Local maxima whose value is at least `min_height`.
#[must_use]
pub fn find_peaks(x: &[f64], min_height: f64) -> Vec<usize> {
    let mut peaks = local_maxima(x);
    peaks.retain(|&i| x[i] >= min_height);
    peaks
}
