//! Median-based statistics for outlier flagging and imputation

/// Consistency constant making MAD comparable to a normal standard deviation.
pub const MAD_SCALE: f64 = 0.6745;

/// Median of the finite values, `None` if there are none.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Median absolute deviation around the median.
pub fn median_absolute_deviation(values: &[f64]) -> Option<(f64, f64)> {
    let center = median(values)?;
    let deviations: Vec<f64> = values
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| (v - center).abs())
        .collect();
    Some((center, median(&deviations)?))
}

/// Scores each value by `0.6745 * (x - median) / MAD`.
///
/// Returns `None` when MAD is zero; every value is then as typical as the
/// median and nothing can be scored.
pub fn robust_z_scores(values: &[f64]) -> Option<Vec<f64>> {
    let (center, mad) = median_absolute_deviation(values)?;
    if mad <= f64::EPSILON {
        return None;
    }
    Some(values.iter().map(|v| MAD_SCALE * (v - center) / mad).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_even_and_empty() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[f64::NAN, 5.0]), Some(5.0));
    }

    #[test]
    fn test_mad() {
        // deviations from 3: 2,1,0,1,97 -> median 1
        let (center, mad) = median_absolute_deviation(&[1.0, 2.0, 3.0, 4.0, 100.0]).unwrap();
        assert_eq!(center, 3.0);
        assert_eq!(mad, 1.0);
    }

    #[test]
    fn test_robust_z_flags_extreme_point() {
        let z = robust_z_scores(&[1.0, 2.0, 3.0, 4.0, 100.0]).unwrap();
        assert!(z[4] > 3.5);
        assert!(z[..4].iter().all(|s| s.abs() < 3.5));
    }

    #[test]
    fn test_constant_values_are_not_scored() {
        assert!(robust_z_scores(&[7.0, 7.0, 7.0, 9.0]).is_none());
    }
}
