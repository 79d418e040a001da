// Small sample statistics shared by the histogram, cut and sweep code.

/// Copy of the finite entries, sorted ascending.
pub fn sorted_finite(samples: &[f64]) -> Vec<f64> {
    let mut values: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
    values.sort_by(f64::total_cmp);
    values
}

pub fn count_finite(samples: &[f64]) -> usize {
    samples.iter().filter(|v| v.is_finite()).count()
}

/// Linear-interpolated quantile of an ascending slice.
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    if p <= 0.0 {
        return sorted[0];
    }
    if p >= 1.0 {
        return sorted[n - 1];
    }
    let idx = p * ((n - 1) as f64);
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let w = idx - (lo as f64);
    sorted[lo] + w * (sorted[hi] - sorted[lo])
}

pub fn quantile(samples: &[f64], p: f64) -> f64 {
    quantile_sorted(&sorted_finite(samples), p)
}

pub fn median(samples: &[f64]) -> f64 {
    quantile(samples, 0.5)
}

pub fn iqr(samples: &[f64]) -> f64 {
    let sorted = sorted_finite(samples);
    quantile_sorted(&sorted, 0.75) - quantile_sorted(&sorted, 0.25)
}

/// Gaussian-equivalent width from the interquartile range.
pub fn robust_sigma(samples: &[f64]) -> f64 {
    iqr(samples) / 1.349
}

pub fn mean(samples: &[f64]) -> f64 {
    let (sum, n) = samples
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { f64::NAN } else { sum / n as f64 }
}

pub fn std_dev(samples: &[f64]) -> f64 {
    let m = mean(samples);
    let (sum, n) = samples
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), v| (s + (v - m).powi(2), n + 1));
    if n < 2 {
        f64::NAN
    } else {
        (sum / (n - 1) as f64).sqrt()
    }
}

/// Friedman–Diaconis bin width `2 * IQR / n^(1/3)`.
pub fn fd_bin_width(samples: &[f64]) -> f64 {
    let n = count_finite(samples);
    if n == 0 {
        return f64::NAN;
    }
    2.0 * iqr(samples) / (n as f64).cbrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn quantiles_interpolate() {
        let data = [4.0, 1.0, 3.0, 2.0, f64::NAN];
        assert_relative_eq!(median(&data), 2.5);
        assert_relative_eq!(quantile(&data, 0.0), 1.0);
        assert_relative_eq!(quantile(&data, 1.0), 4.0);
        assert_relative_eq!(iqr(&data), 1.5);
        assert!(quantile(&[], 0.5).is_nan());
    }

    #[test]
    fn moments_skip_non_finite() {
        let data = [1.0, 2.0, 3.0, f64::INFINITY];
        assert_relative_eq!(mean(&data), 2.0);
        assert_relative_eq!(std_dev(&data), 1.0);
        assert_eq!(count_finite(&data), 3);
    }

    #[test]
    fn fd_width_scales_with_sample_size() {
        let data: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        let expected = 2.0 * iqr(&data) / 10.0;
        assert_relative_eq!(fd_bin_width(&data), expected, epsilon = 1e-9);
    }
}
