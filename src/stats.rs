//! Numeric summaries over edge-length and node-age samples.
//!
//! All summaries sort a copy of the sample first, so the result does not
//! depend on the order in which worker distributions were merged.
//!
//! Definitions:
//! - `sd` is the sample standard deviation (n − 1 denominator). With fewer
//!   than two values the variance is `f64::INFINITY`.
//! - Quantiles are nearest-rank on the sorted sample at index
//!   `round(q · (n − 1))`.
//! - The HPD interval is the narrowest window of `ceil(mass · n)` consecutive
//!   sorted values; a single value yields the zero-width interval `(x, x)`.

/// Probability mass of the reported HPD interval.
pub const HPD_MASS: f64 = 0.95;

/// How a list of samples is reduced to one value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Aggregator {
    #[default]
    Mean,
    Median,
}

impl Aggregator {
    /// Reduces `values`; `None` if empty.
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let sorted = sorted_copy(values);
        Some(match self {
            Aggregator::Mean => mean_of_sorted(&sorted),
            Aggregator::Median => median_of_sorted(&sorted),
        })
    }
}

/// Statistics bundle attached to an edge (lengths) or node (ages).
#[derive(Clone, Debug, PartialEq)]
pub struct Summary {
    pub n: usize,
    pub mean: f64,
    pub median: f64,
    pub variance: f64,
    pub sd: f64,
    pub min: f64,
    pub max: f64,
    pub q05: f64,
    pub q95: f64,
    pub hpd95: (f64, f64),
}

impl Summary {
    /// Summarizes a sample; `None` if it is empty.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let sorted = sorted_copy(values);
        let mean = mean_of_sorted(&sorted);
        let variance = sample_variance(&sorted, mean);
        Some(Summary {
            n: sorted.len(),
            mean,
            median: median_of_sorted(&sorted),
            variance,
            sd: variance.sqrt(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            q05: quantile_of_sorted(&sorted, 0.05),
            q95: quantile_of_sorted(&sorted, 0.95),
            hpd95: hpd_of_sorted(&sorted, HPD_MASS),
        })
    }
}

fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}

fn mean_of_sorted(sorted: &[f64]) -> f64 {
    sorted.iter().sum::<f64>() / sorted.len() as f64
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

fn sample_variance(sorted: &[f64], mean: f64) -> f64 {
    if sorted.len() < 2 {
        return f64::INFINITY;
    }
    let ss: f64 = sorted.iter().map(|x| (x - mean) * (x - mean)).sum();
    ss / (sorted.len() - 1) as f64
}

fn quantile_of_sorted(sorted: &[f64], q: f64) -> f64 {
    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn hpd_of_sorted(sorted: &[f64], mass: f64) -> (f64, f64) {
    let n = sorted.len();
    let k = ((mass * n as f64).ceil() as usize).clamp(1, n);
    let mut best = (sorted[0], sorted[k - 1]);
    for i in 1..=(n - k) {
        let (lo, hi) = (sorted[i], sorted[i + k - 1]);
        if hi - lo < best.1 - best.0 {
            best = (lo, hi);
        }
    }
    best
}

/// Empirical quantile of an unsorted sample; `None` if empty.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(quantile_of_sorted(&sorted_copy(values), q.clamp(0.0, 1.0)))
}

/// Narrowest interval containing `mass` of an unsorted sample.
pub fn hpd_interval(values: &[f64], mass: f64) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    Some(hpd_of_sorted(&sorted_copy(values), mass.clamp(0.0, 1.0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_median_of_three_ages() {
        let ages = [2.0, 3.0, 4.0];
        assert_eq!(Aggregator::Mean.apply(&ages), Some(3.0));
        assert_eq!(Aggregator::Median.apply(&ages), Some(3.0));
        assert_eq!(Aggregator::Median.apply(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(Aggregator::Mean.apply(&[]), None);
    }

    #[test]
    fn test_summary_single_sample_sentinels() {
        let s = Summary::from_values(&[1.5]).unwrap();
        assert_eq!(s.n, 1);
        assert!(s.variance.is_infinite());
        assert!(s.sd.is_infinite());
        assert_eq!(s.hpd95, (1.5, 1.5));
        assert_eq!((s.q05, s.q95), (1.5, 1.5));
    }

    #[test]
    fn test_summary_sample_sd() {
        let s = Summary::from_values(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(s.mean, 5.0);
        assert!((s.variance - 32.0 / 7.0).abs() < 1e-12);
        assert_eq!((s.min, s.max), (2.0, 9.0));
    }

    #[test]
    fn test_quantiles_nearest_rank() {
        let values: Vec<f64> = (0..=100).map(f64::from).collect();
        assert_eq!(quantile(&values, 0.05), Some(5.0));
        assert_eq!(quantile(&values, 0.95), Some(95.0));
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[test]
    fn test_hpd_prefers_dense_region() {
        // 19 values packed near 1.0 plus one far outlier: the 95% window
        // (19 values) should exclude the outlier.
        let mut values: Vec<f64> = (0..19).map(|i| 1.0 + i as f64 * 0.01).collect();
        values.push(50.0);
        let (lo, hi) = hpd_interval(&values, 0.95).unwrap();
        assert_eq!(lo, 1.0);
        assert!((hi - 1.18).abs() < 1e-12);
    }

    #[test]
    fn test_summary_is_order_independent() {
        let a = Summary::from_values(&[0.1, 0.7, 0.2, 0.3]).unwrap();
        let b = Summary::from_values(&[0.3, 0.2, 0.7, 0.1]).unwrap();
        assert_eq!(a, b);
    }
}
