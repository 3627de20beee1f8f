//! Aggregate split statistics over many trees.
//!
//! A [`SplitDistribution`] only grows: trees are counted into it, or another
//! distribution built against the same registry instance is merged in.
//! Workers each own one, the coordinator merges them, and the consensus
//! builder and support annotator read the result.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::bitset::Bitset;
use crate::codec::{self, BipartitionCodec};
use crate::error::{Result, SplitError};
use crate::stats::Summary;
use crate::taxon::TaxonRegistry;
use crate::topology::TopologyCounter;
use crate::tree::{Rooting, Tree};

/// Split counts, edge lengths and node ages keyed by canonical split.
#[derive(Clone, Debug)]
pub struct SplitDistribution {
    registry: Arc<TaxonRegistry>,
    rooting: Rooting,
    counts: HashMap<Bitset, f64>,
    edge_lengths: HashMap<Bitset, Vec<f64>>,
    node_ages: HashMap<Bitset, Vec<f64>>,
    total_trees_counted: usize,
    total_weight: f64,
    topologies: Option<TopologyCounter>,
    /// Skip recording edge lengths.
    pub ignore_edge_lengths: bool,
    /// Skip recording node ages.
    pub ignore_node_ages: bool,
}

impl SplitDistribution {
    /// An empty distribution; rootedness is fixed by the first tree counted.
    pub fn new(registry: Arc<TaxonRegistry>) -> Self {
        SplitDistribution {
            registry,
            rooting: Rooting::Unknown,
            counts: HashMap::new(),
            edge_lengths: HashMap::new(),
            node_ages: HashMap::new(),
            total_trees_counted: 0,
            total_weight: 0.0,
            topologies: None,
            ignore_edge_lengths: false,
            ignore_node_ages: false,
        }
    }

    /// Fixes rootedness up front instead of taking it from the first tree.
    pub fn with_rooting(mut self, rooting: Rooting) -> Self {
        self.rooting = rooting;
        self
    }

    /// Also count whole-tree topologies.
    pub fn with_topologies(mut self) -> Self {
        self.topologies = Some(TopologyCounter::new());
        self
    }

    /// Counts every edge of `tree` with the given weight.
    ///
    /// Encodes the tree first if it has no splits yet. Edge lengths and node
    /// ages present on the tree are appended to the split's lists.
    ///
    /// # Errors
    /// [`SplitError::MixedRooting`] if the tree declares a rootedness other
    /// than the one already fixed on this distribution; encoding errors.
    pub fn count_splits_on_tree(&mut self, tree: &mut Tree, weight: f64) -> Result<()> {
        let rooting = match (self.rooting, tree.rooting) {
            (Rooting::Unknown, Rooting::Unknown) => Rooting::Unrooted,
            (Rooting::Unknown, declared) => declared,
            (fixed, Rooting::Unknown) => fixed,
            (fixed, declared) if fixed == declared => fixed,
            (fixed, declared) => {
                return Err(SplitError::MixedRooting {
                    expected: fixed.as_str(),
                    found: declared.as_str(),
                });
            }
        };

        if tree.rooting != rooting || !tree.is_encoded() {
            tree.rooting = rooting;
            BipartitionCodec::new(self.registry.clone(), rooting).encode(tree)?;
        }
        self.rooting = rooting;

        for id in tree.preorder() {
            let node = &tree[id];
            let Some(split) = node.edge.split.as_ref() else { continue };
            *self.counts.entry(split.clone()).or_insert(0.0) += weight;
            if !self.ignore_edge_lengths {
                if let Some(length) = node.edge.length {
                    self.edge_lengths.entry(split.clone()).or_default().push(length);
                }
            }
            if !self.ignore_node_ages {
                if let Some(age) = node.age {
                    self.node_ages.entry(split.clone()).or_default().push(age);
                }
            }
        }

        if let Some(topologies) = self.topologies.as_mut() {
            topologies.count(codec::nontrivial_splits(tree, self.registry.len()), weight);
        }

        self.total_trees_counted += 1;
        self.total_weight += weight;
        trace!(trees = self.total_trees_counted, splits = self.counts.len(), "counted tree");
        Ok(())
    }

    /// `counts[s] / total_weight` for every split seen, computed on demand.
    pub fn split_frequencies(&self) -> HashMap<Bitset, f64> {
        if self.total_weight <= 0.0 {
            return HashMap::new();
        }
        self.counts
            .iter()
            .map(|(split, count)| (split.clone(), count / self.total_weight))
            .collect()
    }

    /// Frequency of one split; 0.0 if never observed.
    pub fn frequency(&self, split: &Bitset) -> f64 {
        if self.total_weight <= 0.0 {
            return 0.0;
        }
        self.counts.get(split).map_or(0.0, |c| c / self.total_weight)
    }

    /// Splits with frequencies, most frequent first, ties by ascending mask.
    pub fn splits_by_frequency(&self) -> Vec<(Bitset, f64)> {
        let mut splits: Vec<(Bitset, f64)> = self.split_frequencies().into_iter().collect();
        splits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        splits
    }

    /// Merges `other` into `self`.
    ///
    /// Counts and totals are summed key-wise; length and age lists are
    /// concatenated. Commutative and associative over counts and totals.
    ///
    /// # Errors
    /// [`SplitError::IncompatibleRegistry`] unless both were built against
    /// the same registry instance; [`SplitError::MixedRooting`] if both have
    /// fixed, different rootedness.
    pub fn merge(&mut self, other: SplitDistribution) -> Result<()> {
        if !self.registry.same_instance(&other.registry) {
            return Err(SplitError::IncompatibleRegistry);
        }
        self.rooting = match (self.rooting, other.rooting) {
            (Rooting::Unknown, r) | (r, Rooting::Unknown) => r,
            (a, b) if a == b => a,
            (a, b) => {
                return Err(SplitError::MixedRooting { expected: a.as_str(), found: b.as_str() });
            }
        };

        for (split, count) in other.counts {
            *self.counts.entry(split).or_insert(0.0) += count;
        }
        for (split, lengths) in other.edge_lengths {
            self.edge_lengths.entry(split).or_default().extend(lengths);
        }
        for (split, ages) in other.node_ages {
            self.node_ages.entry(split).or_default().extend(ages);
        }
        self.total_trees_counted += other.total_trees_counted;
        self.total_weight += other.total_weight;

        match (self.topologies.as_mut(), other.topologies) {
            (Some(mine), Some(theirs)) => mine.merge(theirs),
            (None, Some(theirs)) => self.topologies = Some(theirs),
            _ => {}
        }
        Ok(())
    }

    pub fn registry(&self) -> &Arc<TaxonRegistry> {
        &self.registry
    }

    pub fn rooting(&self) -> Rooting {
        self.rooting
    }

    pub fn counts(&self) -> &HashMap<Bitset, f64> {
        &self.counts
    }

    pub fn count(&self, split: &Bitset) -> f64 {
        self.counts.get(split).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, split: &Bitset) -> bool {
        self.counts.contains_key(split)
    }

    /// Recorded lengths for a split, if any edge carrying it had a length.
    pub fn edge_lengths(&self, split: &Bitset) -> Option<&[f64]> {
        self.edge_lengths.get(split).map(Vec::as_slice)
    }

    /// Recorded ages of the node below a split.
    pub fn node_ages(&self, split: &Bitset) -> Option<&[f64]> {
        self.node_ages.get(split).map(Vec::as_slice)
    }

    pub fn edge_length_summary(&self, split: &Bitset) -> Option<Summary> {
        self.edge_lengths(split).and_then(Summary::from_values)
    }

    pub fn node_age_summary(&self, split: &Bitset) -> Option<Summary> {
        self.node_ages(split).and_then(Summary::from_values)
    }

    pub fn total_trees_counted(&self) -> usize {
        self.total_trees_counted
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn is_empty(&self) -> bool {
        self.total_trees_counted == 0
    }

    pub fn topologies(&self) -> Option<&TopologyCounter> {
        self.topologies.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Node;

    fn registry() -> Arc<TaxonRegistry> {
        Arc::new(TaxonRegistry::from_labels(["A", "B", "C", "D"]).unwrap())
    }

    /// Builds `((x0,x1):len,(x2,x3):len)` on the given registry.
    fn quartet(registry: &TaxonRegistry, order: [&str; 4], rooting: Rooting, len: f64) -> Tree {
        let mut tree = Tree::new().with_rooting(rooting);
        let root = tree.root();
        for pair in order.chunks(2) {
            let inner = tree.add_child(root, Node::default().with_length(Some(len)));
            for label in pair {
                let taxon = registry.get(label).unwrap();
                tree.add_child(inner, Node::leaf(taxon).with_length(Some(1.0)));
            }
        }
        tree
    }

    #[test]
    fn test_example_frequencies() {
        let registry = registry();
        let mut dist = SplitDistribution::new(registry.clone());
        for i in 0..10 {
            let order = if i < 7 { ["A", "B", "C", "D"] } else { ["A", "C", "B", "D"] };
            let mut tree = quartet(&registry, order, Rooting::Unrooted, 0.5);
            dist.count_splits_on_tree(&mut tree, 1.0).unwrap();
        }
        assert_eq!(dist.total_trees_counted(), 10);
        assert_eq!(dist.rooting(), Rooting::Unrooted);

        let cd = Bitset::from_indices([2, 3]);
        let bd = Bitset::from_indices([1, 3]);
        assert!((dist.frequency(&cd) - 0.7).abs() < 1e-12);
        assert!((dist.frequency(&bd) - 0.3).abs() < 1e-12);
        assert_eq!(dist.frequency(&Bitset::from_indices([1, 2])), 0.0);
        // Basal bifurcation collapsed: one length per tree, summed halves
        assert_eq!(dist.edge_lengths(&cd).unwrap(), &[1.0; 7]);
    }

    #[test]
    fn test_mixed_rooting_is_rejected() {
        let registry = registry();
        let mut dist = SplitDistribution::new(registry.clone());
        let mut rooted = quartet(&registry, ["A", "B", "C", "D"], Rooting::Rooted, 1.0);
        dist.count_splits_on_tree(&mut rooted, 1.0).unwrap();

        let mut unknown = quartet(&registry, ["A", "B", "C", "D"], Rooting::Unknown, 1.0);
        dist.count_splits_on_tree(&mut unknown, 1.0).unwrap();
        assert_eq!(unknown.rooting, Rooting::Rooted);

        let mut unrooted = quartet(&registry, ["A", "B", "C", "D"], Rooting::Unrooted, 1.0);
        let err = dist.count_splits_on_tree(&mut unrooted, 1.0).unwrap_err();
        assert!(matches!(err, SplitError::MixedRooting { expected: "rooted", found: "unrooted" }));
        assert_eq!(dist.total_trees_counted(), 2);
    }

    #[test]
    fn test_weights_and_ages() {
        let registry = registry();
        let mut dist = SplitDistribution::new(registry.clone()).with_topologies();
        for (len, weight) in [(1.0, 1.0), (2.0, 3.0)] {
            let mut tree = quartet(&registry, ["A", "B", "C", "D"], Rooting::Rooted, len);
            tree.calc_node_ages(1e-9).unwrap();
            dist.count_splits_on_tree(&mut tree, weight).unwrap();
        }
        let ab = Bitset::from_indices([0, 1]);
        assert_eq!(dist.total_weight(), 4.0);
        assert_eq!(dist.count(&ab), 4.0);
        assert_eq!(dist.frequency(&ab), 1.0);
        assert_eq!(dist.node_ages(&Bitset::first_n(4)).unwrap(), &[2.0, 3.0]);
        assert_eq!(dist.topologies().unwrap().len(), 1);
    }

    #[test]
    fn test_merge_requires_same_registry_instance() {
        let mut a = SplitDistribution::new(registry());
        let b = SplitDistribution::new(registry());
        assert!(matches!(a.merge(b), Err(SplitError::IncompatibleRegistry)));
    }

    #[test]
    fn test_merge_sums_counts_and_lists() {
        let registry = registry();
        let mut a = SplitDistribution::new(registry.clone());
        let mut b = SplitDistribution::new(registry.clone());
        let mut t1 = quartet(&registry, ["A", "B", "C", "D"], Rooting::Unrooted, 0.5);
        let mut t2 = quartet(&registry, ["A", "C", "B", "D"], Rooting::Unrooted, 1.0);
        let mut t3 = quartet(&registry, ["A", "B", "C", "D"], Rooting::Unrooted, 2.0);
        a.count_splits_on_tree(&mut t1, 1.0).unwrap();
        b.count_splits_on_tree(&mut t2, 1.0).unwrap();
        b.count_splits_on_tree(&mut t3, 1.0).unwrap();
        a.merge(b).unwrap();

        let cd = Bitset::from_indices([2, 3]);
        assert_eq!(a.total_trees_counted(), 3);
        assert_eq!(a.count(&cd), 2.0);
        let mut lengths = a.edge_lengths(&cd).unwrap().to_vec();
        lengths.sort_by(f64::total_cmp);
        assert_eq!(lengths, vec![1.0, 4.0]);
    }
}
