use crate::error::{CalError, Result};
use crate::util::statistics;

/// How the bin edges of a histogram built from samples are chosen.
#[derive(Default, Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Binning {
    Width(f64),
    Count(usize),
    /// Friedman–Diaconis width computed from the samples inside the range.
    #[default]
    Auto,
}

/// Upper limit on the number of bins any binning may produce.
pub const MAX_BINS: usize = 1_000_000;

impl Binning {
    /// Bin count over `range`; for `Auto` only the samples inside `range` count.
    ///
    /// An explicit width or count above [`MAX_BINS`] is a contract error, an automatic
    /// width that would exceed it is clamped.
    pub fn number_of_bins(self, samples: &[f64], range: (f64, f64)) -> Result<usize> {
        let span = range.1 - range.0;
        match self {
            Binning::Count(n) if n > MAX_BINS => Err(CalError::Contract(format!(
                "{n} bins requested, at most {MAX_BINS} allowed"
            ))),
            Binning::Count(n) => Ok(n),
            Binning::Width(width) => {
                if !(width > 0.0) {
                    return Err(CalError::Contract(format!("invalid bin width {width}")));
                }
                let n = (span / width).round().max(1.0);
                if !(n <= MAX_BINS as f64) {
                    return Err(CalError::Contract(format!(
                        "bin width {width} over a span of {span} gives more than {MAX_BINS} bins"
                    )));
                }
                Ok(n as usize)
            }
            Binning::Auto => {
                let inside: Vec<f64> = samples
                    .iter()
                    .copied()
                    .filter(|v| *v >= range.0 && *v < range.1)
                    .collect();
                let width = statistics::fd_bin_width(&inside);
                if width.is_finite() && width > 0.0 {
                    Ok((span / width).ceil().clamp(1.0, MAX_BINS as f64) as usize)
                } else {
                    Ok(1)
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Histogram {
    pub edges: Vec<f64>,
    pub counts: Vec<f64>,
    pub overflow: u64,
    pub underflow: u64,
}

impl Histogram {
    pub fn new(edges: Vec<f64>, counts: Vec<f64>) -> Result<Self> {
        if edges.len() != counts.len() + 1 {
            return Err(CalError::Contract(format!(
                "histogram needs len(edges) == len(counts) + 1, got {} and {}",
                edges.len(),
                counts.len()
            )));
        }
        if counts.is_empty() {
            return Err(CalError::contract("histogram has no bins"));
        }
        if edges.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(CalError::contract("histogram edges must be strictly increasing"));
        }
        if counts.iter().any(|c| !c.is_finite() || *c < 0.0) {
            return Err(CalError::contract(
                "histogram counts must be finite and non-negative",
            ));
        }
        Ok(Histogram {
            edges,
            counts,
            overflow: 0,
            underflow: 0,
        })
    }

    /// Uniform empty histogram over `range`.
    pub fn uniform(range: (f64, f64), number_of_bins: usize) -> Result<Self> {
        if number_of_bins == 0 || !(range.1 > range.0) {
            return Err(CalError::Contract(format!(
                "invalid uniform binning: {number_of_bins} bins over {range:?}"
            )));
        }
        let bin_width = (range.1 - range.0) / number_of_bins as f64;
        let edges = (0..=number_of_bins)
            .map(|i| range.0 + i as f64 * bin_width)
            .collect();
        Histogram::new(edges, vec![0.0; number_of_bins])
    }

    pub fn from_samples(samples: &[f64], range: (f64, f64), binning: Binning) -> Result<Self> {
        if !(range.1 > range.0) {
            return Err(CalError::Contract(format!("invalid histogram range {range:?}")));
        }
        let number_of_bins = binning.number_of_bins(samples, range)?;
        let mut histogram = Histogram::uniform(range, number_of_bins)?;
        for &value in samples {
            histogram.fill(value);
        }
        Ok(histogram)
    }

    pub fn fill(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        match self.bin_index(value) {
            Some(index) => self.counts[index] += 1.0,
            None if value >= self.upper() => self.overflow += 1,
            None => self.underflow += 1,
        }
    }

    pub fn n_bins(&self) -> usize {
        self.counts.len()
    }

    pub fn lower(&self) -> f64 {
        self.edges[0]
    }

    pub fn upper(&self) -> f64 {
        self.edges[self.edges.len() - 1]
    }

    pub fn range(&self) -> (f64, f64) {
        (self.lower(), self.upper())
    }

    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }

    pub fn bin_width(&self, index: usize) -> f64 {
        self.edges[index + 1] - self.edges[index]
    }

    pub fn widths(&self) -> Vec<f64> {
        self.edges.windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn centers(&self) -> Vec<f64> {
        self.edges.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect()
    }

    // Get the bin index for a given x position. The upper edge is exclusive.
    pub fn bin_index(&self, x: f64) -> Option<usize> {
        if x < self.lower() || x >= self.upper() {
            return None;
        }
        let index = self.edges.partition_point(|edge| *edge <= x);
        Some(index.saturating_sub(1).min(self.n_bins() - 1))
    }

    /// Index and center of the bin with the most counts.
    pub fn max_bin(&self) -> (usize, f64) {
        let (index, _) = self
            .counts
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |(best_i, best), (i, &c)| {
                if c > best { (i, c) } else { (best_i, best) }
            });
        (index, 0.5 * (self.edges[index] + self.edges[index + 1]))
    }

    /// Sub-histogram of the bins whose centers fall inside `[start_x, end_x]`.
    pub fn slice(&self, start_x: f64, end_x: f64) -> Result<Histogram> {
        let centers = self.centers();
        let indices: Vec<usize> = (0..self.n_bins())
            .filter(|&i| centers[i] >= start_x && centers[i] <= end_x)
            .collect();
        let (Some(&first), Some(&last)) = (indices.first(), indices.last()) else {
            return Err(CalError::Contract(format!(
                "no bins between {start_x} and {end_x}"
            )));
        };
        Histogram::new(
            self.edges[first..=last + 1].to_vec(),
            self.counts[first..=last].to_vec(),
        )
    }

    // Calculate the statistics for the histogram within the specified x range.
    pub fn get_statistics(&self, start_x: f64, end_x: f64) -> (f64, f64, f64) {
        let centers = self.centers();
        let mut sum_product = 0.0;
        let mut total_count = 0.0;

        for (center, count) in centers.iter().zip(&self.counts) {
            if *center >= start_x && *center <= end_x {
                sum_product += count * center;
                total_count += count;
            }
        }

        if total_count == 0.0 {
            return (0.0, 0.0, 0.0);
        }

        let mean = sum_product / total_count;
        let sum_squared_diff: f64 = centers
            .iter()
            .zip(&self.counts)
            .filter(|(center, _)| **center >= start_x && **center <= end_x)
            .map(|(center, count)| count * (center - mean).powi(2))
            .sum();

        (total_count, mean, (sum_squared_diff / total_count).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rejects_malformed_histograms() {
        assert!(Histogram::new(vec![0.0, 1.0], vec![1.0, 2.0]).is_err());
        assert!(Histogram::new(vec![0.0, 1.0, 1.0], vec![1.0, 2.0]).is_err());
        assert!(Histogram::new(vec![0.0, 1.0], vec![-1.0]).is_err());
        assert!(Histogram::new(vec![0.0], vec![]).unwrap_err().is_contract());
    }

    #[test]
    fn fill_tracks_under_and_overflow() {
        let samples = [-1.0, 0.0, 0.5, 1.5, 9.99, 10.0, 42.0, f64::NAN];
        let hist = Histogram::from_samples(&samples, (0.0, 10.0), Binning::Width(1.0)).unwrap();
        assert_eq!(hist.n_bins(), 10);
        assert_relative_eq!(hist.total(), 4.0);
        assert_eq!(hist.underflow, 1);
        assert_eq!(hist.overflow, 2);
        assert_relative_eq!(hist.counts[0], 2.0);
        assert_relative_eq!(hist.counts[9], 1.0);
    }

    #[test]
    fn bin_counts_are_capped() {
        let samples = [0.0, 1.0];
        let err = Histogram::from_samples(&samples, (0.0, 1e9), Binning::Width(1e-6)).unwrap_err();
        assert!(err.is_contract());
        assert!(Binning::Count(MAX_BINS + 1).number_of_bins(&samples, (0.0, 1.0)).unwrap_err().is_contract());
        assert_eq!(Binning::Width(0.25).number_of_bins(&samples, (0.0, 10.0)).unwrap(), 40);

        // tight cluster, tiny IQR over a wide range
        let clustered: Vec<f64> = (0..1000).map(|i| i as f64 * 1e-9).collect();
        let n = Binning::Auto.number_of_bins(&clustered, (0.0, 1e6)).unwrap();
        assert_eq!(n, MAX_BINS);
    }

    #[test]
    fn auto_binning_uses_fd_width() {
        let samples: Vec<f64> = (0..1000).map(|i| i as f64 / 100.0).collect();
        let hist = Histogram::from_samples(&samples, (0.0, 10.0), Binning::Auto).unwrap();
        let width = statistics::fd_bin_width(&samples);
        assert_eq!(hist.n_bins(), (10.0 / width).ceil() as usize);
        assert_relative_eq!(hist.total(), 1000.0);
    }

    #[test]
    fn statistics_and_slices() {
        let hist = Histogram::new(
            vec![0.0, 1.0, 2.0, 3.0, 4.0],
            vec![0.0, 10.0, 10.0, 0.0],
        )
        .unwrap();
        let (total, mean, stdev) = hist.get_statistics(0.0, 4.0);
        assert_relative_eq!(total, 20.0);
        assert_relative_eq!(mean, 2.0);
        assert_relative_eq!(stdev, 0.5);

        let sub = hist.slice(1.0, 3.0).unwrap();
        assert_eq!(sub.n_bins(), 2);
        assert_relative_eq!(sub.lower(), 1.0);
        assert_relative_eq!(sub.upper(), 3.0);
        assert_eq!(hist.max_bin().0, 1);
        assert_eq!(hist.bin_index(3.999), Some(3));
        assert_eq!(hist.bin_index(4.0), None);
    }
}
