//! Regression scores

use statrs::statistics::Statistics;

const SS_EPSILON: f64 = 1e-12;

/// Coefficient of determination.
///
/// A constant target scores 1.0 when predicted exactly and 0.0 otherwise.
pub fn r2(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let mean = actual.iter().mean();
    let ss_tot: f64 = actual.iter().map(|y| (y - mean).powi(2)).sum();
    let ss_res: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(y, p)| (y - p).powi(2))
        .sum();

    if ss_tot <= SS_EPSILON {
        return if ss_res <= SS_EPSILON { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

pub fn mae(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    actual
        .iter()
        .zip(predicted)
        .map(|(y, p)| (y - p).abs())
        .sum::<f64>()
        / actual.len() as f64
}

/// Mean and population standard deviation of fold scores.
pub fn mean_std(scores: &[f64]) -> (f64, f64) {
    match scores.len() {
        0 => (f64::NAN, f64::NAN),
        1 => (scores[0], 0.0),
        _ => (scores.iter().mean(), scores.iter().population_std_dev()),
    }
}
