//! Whole-tree topology counts.
//!
//! A topology is identified by its sorted set of non-trivial splits, so two
//! trees that differ only in child order or edge lengths share a key.

use std::collections::HashMap;

use crate::bitset::Bitset;

/// Occurrence weight per distinct topology.
#[derive(Clone, Debug, Default)]
pub struct TopologyCounter {
    counts: HashMap<Vec<Bitset>, f64>,
    total_weight: f64,
}

impl TopologyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one tree given its non-trivial splits (any order, no dups).
    pub fn count(&mut self, mut splits: Vec<Bitset>, weight: f64) {
        splits.sort_unstable();
        *self.counts.entry(splits).or_insert(0.0) += weight;
        self.total_weight += weight;
    }

    /// Adds another counter's tallies; commutative and associative.
    pub fn merge(&mut self, other: TopologyCounter) {
        for (key, weight) in other.counts {
            *self.counts.entry(key).or_insert(0.0) += weight;
        }
        self.total_weight += other.total_weight;
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn count_of(&self, splits: &[Bitset]) -> f64 {
        let mut key = splits.to_vec();
        key.sort_unstable();
        self.counts.get(&key).copied().unwrap_or(0.0)
    }

    /// Topologies with their frequencies, most frequent first; ties broken
    /// by the smaller split key.
    pub fn frequencies(&self) -> Vec<(Vec<Bitset>, f64)> {
        if self.total_weight <= 0.0 {
            return Vec::new();
        }
        let mut out: Vec<(Vec<Bitset>, f64)> = self
            .counts
            .iter()
            .map(|(k, w)| (k.clone(), w / self.total_weight))
            .collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    /// The observed topology with maximum clade credibility: the largest sum
    /// of log split frequencies under `split_frequency`. Ties go to the more
    /// frequent topology, then to the smaller split key.
    pub fn most_credible<F>(&self, split_frequency: F) -> Option<&[Bitset]>
    where
        F: Fn(&Bitset) -> f64,
    {
        let score = |key: &[Bitset]| -> f64 {
            key.iter().map(|s| split_frequency(s).ln()).sum()
        };
        self.counts
            .iter()
            .map(|(key, weight)| (key, *weight, score(key)))
            .max_by(|a, b| {
                a.2.total_cmp(&b.2)
                    .then_with(|| a.1.total_cmp(&b.1))
                    .then_with(|| b.0.cmp(a.0))
            })
            .map(|(key, _, _)| key.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bs(indices: &[usize]) -> Bitset {
        Bitset::from_indices(indices.iter().copied())
    }

    #[test]
    fn test_counts_ignore_split_order() {
        let mut counter = TopologyCounter::new();
        counter.count(vec![bs(&[1, 2]), bs(&[3, 4])], 1.0);
        counter.count(vec![bs(&[3, 4]), bs(&[1, 2])], 1.0);
        counter.count(vec![bs(&[1, 3])], 1.0);
        assert_eq!(counter.len(), 2);
        assert_eq!(counter.count_of(&[bs(&[3, 4]), bs(&[1, 2])]), 2.0);

        let freqs = counter.frequencies();
        assert_eq!(freqs[0].0, vec![bs(&[1, 2]), bs(&[3, 4])]);
        assert!((freqs[0].1 - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_merge_adds_totals() {
        let mut a = TopologyCounter::new();
        a.count(vec![bs(&[1, 2])], 1.0);
        let mut b = TopologyCounter::new();
        b.count(vec![bs(&[1, 2])], 2.0);
        b.count(vec![bs(&[2, 3])], 1.0);
        a.merge(b);
        assert_eq!(a.total_weight(), 4.0);
        assert_eq!(a.count_of(&[bs(&[1, 2])]), 3.0);
    }

    #[test]
    fn test_most_credible_uses_split_support() {
        let mut counter = TopologyCounter::new();
        let t1 = vec![bs(&[1, 2]), bs(&[3, 4])];
        let t2 = vec![bs(&[1, 2]), bs(&[2, 3])];
        counter.count(t1.clone(), 1.0);
        counter.count(t2.clone(), 2.0);
        // t1's second split is far better supported than t2's
        let freq = |s: &Bitset| if *s == bs(&[1, 2]) { 0.9 } else if *s == bs(&[3, 4]) { 0.8 } else { 0.1 };
        assert_eq!(counter.most_credible(freq), Some(t1.as_slice()));
    }
}
