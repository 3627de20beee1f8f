//! Consensus tree construction from split frequencies.
//!
//! # Algorithm
//! 1. Candidates are the non-trivial splits passing the frequency threshold
//! 2. Sort by descending frequency, ties by ascending bitmask value
//! 3. Start from a star: one root whose children are one leaf per taxon
//! 4. For each candidate, walk down from the root to the node whose children
//!    exactly cover the split and group those children under a new node;
//!    a child that straddles the split means the candidate conflicts with
//!    something already accepted and it is discarded
//! 5. Re-encode the result and check it reproduces the accepted set
//!
//! ```text
//!   star           accept {C,D}        accept {B,C,D}
//!  /| |\            /  |  \              /    \
//! A B C D          A   B  (C,D)         A   (B,(C,D))
//! ```
//!
//! Above one half no two candidates can conflict (two incompatible splits
//! cannot both occur in more than half of the trees), so with the default
//! threshold nothing is ever discarded.

use std::sync::Arc;

use tracing::{debug, info};

use crate::bitset::Bitset;
use crate::codec::{self, BipartitionCodec};
use crate::distribution::SplitDistribution;
use crate::error::{Result, SplitError};
use crate::taxon::TaxonRegistry;
use crate::tree::{Node, NodeId, Rooting, Tree};

/// Whether a split exactly at the threshold is kept.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThresholdPolicy {
    /// Keep splits with frequency `> f`.
    #[default]
    Strict,
    /// Keep splits with frequency `>= f`.
    Inclusive,
}

impl ThresholdPolicy {
    fn passes(&self, freq: f64, min_freq: f64) -> bool {
        match self {
            ThresholdPolicy::Strict => freq > min_freq,
            ThresholdPolicy::Inclusive => freq >= min_freq,
        }
    }
}

/// A built tree plus the bookkeeping of which candidates made it in.
#[derive(Clone, Debug)]
pub struct Consensus {
    pub tree: Tree,
    /// Accepted non-trivial splits, in acceptance order.
    pub accepted: Vec<Bitset>,
    /// Candidates dropped because they conflicted with accepted splits.
    pub discarded: Vec<Bitset>,
}

/// Greedy compatibility-preserving consensus construction.
#[derive(Clone, Copy, Debug)]
pub struct ConsensusBuilder {
    min_freq: f64,
    policy: ThresholdPolicy,
}

impl Default for ConsensusBuilder {
    /// Majority rule: frequency strictly above 0.5.
    fn default() -> Self {
        ConsensusBuilder { min_freq: 0.5, policy: ThresholdPolicy::Strict }
    }
}

impl ConsensusBuilder {
    /// # Errors
    /// [`SplitError::InvalidThreshold`] if `min_freq` is outside (0, 1].
    pub fn new(min_freq: f64, policy: ThresholdPolicy) -> Result<Self> {
        if !(min_freq > 0.0 && min_freq <= 1.0) {
            return Err(SplitError::InvalidThreshold(min_freq));
        }
        Ok(ConsensusBuilder { min_freq, policy })
    }

    pub fn min_freq(&self) -> f64 {
        self.min_freq
    }

    pub fn policy(&self) -> ThresholdPolicy {
        self.policy
    }

    /// Non-trivial splits passing the threshold, in insertion order.
    pub fn candidates(&self, dist: &SplitDistribution) -> Vec<(Bitset, f64)> {
        let n = dist.registry().len();
        let rooting = dist.rooting();
        dist.splits_by_frequency()
            .into_iter()
            .filter(|(split, freq)| {
                !codec::is_trivial(split, n, rooting) && self.policy.passes(*freq, self.min_freq)
            })
            .collect()
    }

    /// Builds the consensus tree of `dist`.
    ///
    /// # Errors
    /// [`SplitError::EmptyDistribution`] if no tree was counted,
    /// [`SplitError::InconsistentConsensus`] if the self-check fails.
    pub fn build(&self, dist: &SplitDistribution) -> Result<Consensus> {
        if dist.is_empty() {
            return Err(SplitError::EmptyDistribution);
        }
        let candidates: Vec<Bitset> = self.candidates(dist).into_iter().map(|(s, _)| s).collect();
        let consensus = build_from_splits(dist.registry(), dist.rooting(), &candidates)?;
        info!(
            trees = dist.total_trees_counted(),
            candidates = candidates.len(),
            accepted = consensus.accepted.len(),
            discarded = consensus.discarded.len(),
            min_freq = self.min_freq,
            "built consensus tree"
        );
        Ok(consensus)
    }

    /// Builds the observed topology with maximum clade credibility.
    ///
    /// # Errors
    /// [`SplitError::InvalidConfig`] if `dist` did not count topologies.
    pub fn build_mcc(&self, dist: &SplitDistribution) -> Result<Consensus> {
        if dist.is_empty() {
            return Err(SplitError::EmptyDistribution);
        }
        let topologies = dist.topologies().ok_or_else(|| {
            SplitError::InvalidConfig("maximum clade credibility needs topology counting".into())
        })?;
        let splits = topologies
            .most_credible(|s| dist.frequency(s))
            .ok_or(SplitError::EmptyDistribution)?
            .to_vec();
        build_from_splits(dist.registry(), dist.rooting(), &splits)
    }
}

enum Placement {
    Inserted,
    Present,
    Incompatible,
}

/// Nests `splits` in the given order into a star tree over `registry`.
pub fn build_from_splits(
    registry: &Arc<TaxonRegistry>,
    rooting: Rooting,
    splits: &[Bitset],
) -> Result<Consensus> {
    let rooting = if rooting == Rooting::Unknown { Rooting::Unrooted } else { rooting };
    let n = registry.len();
    let mut tree = Tree::new().with_rooting(rooting);
    // Head-side mask of every node, indexed by node id
    let mut masks = vec![registry.all_taxa_mask()];
    for index in 0..n {
        if let Some(taxon) = registry.taxon_at(index) {
            let id = tree.add_child(tree.root(), Node::leaf(taxon));
            set_mask(&mut masks, id, Bitset::singleton(index));
        }
    }

    let mut accepted = Vec::new();
    let mut discarded = Vec::new();
    for split in splits {
        match place(&mut tree, &mut masks, split) {
            Placement::Inserted => accepted.push(split.clone()),
            Placement::Present => {}
            Placement::Incompatible => {
                let taxa: Vec<usize> = split.iter_ones().collect();
                debug!(?taxa, "discarding incompatible split");
                discarded.push(split.clone());
            }
        }
    }

    BipartitionCodec::new(registry.clone(), rooting).encode(&mut tree)?;
    let mut expected = accepted.clone();
    expected.sort_unstable();
    let found = codec::nontrivial_splits(&tree, n);
    if found != expected {
        return Err(SplitError::InconsistentConsensus { expected: expected.len(), found: found.len() });
    }

    Ok(Consensus { tree, accepted, discarded })
}

fn set_mask(masks: &mut Vec<Bitset>, id: NodeId, mask: Bitset) {
    if masks.len() <= id {
        masks.resize(id + 1, Bitset::empty());
    }
    masks[id] = mask;
}

/// Finds the node whose children exactly cover `split` and groups them.
fn place(tree: &mut Tree, masks: &mut Vec<Bitset>, split: &Bitset) -> Placement {
    let mut node = tree.root();
    if !split.is_subset_of(&masks[node]) {
        return Placement::Incompatible;
    }
    loop {
        let mut inside = Vec::new();
        let mut descend = None;
        for &child in tree.children(node) {
            let mask = &masks[child];
            if mask.is_subset_of(split) {
                inside.push(child);
            } else if split.is_subset_of(mask) {
                descend = Some(child);
                break;
            } else if mask.intersects(split) {
                return Placement::Incompatible;
            }
        }
        if let Some(child) = descend {
            node = child;
            continue;
        }
        if inside.len() < 2 || inside.len() == tree.children(node).len() {
            return Placement::Present;
        }
        let group = tree.group_children(node, &inside);
        set_mask(masks, group, split.clone());
        return Placement::Inserted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<TaxonRegistry> {
        Arc::new(TaxonRegistry::from_labels(["A", "B", "C", "D", "E"]).unwrap())
    }

    fn bare(tree: &Tree) -> String {
        let opts = crate::tree::NewickOptions { edge_lengths: false, annotations: false, rooting_comment: false };
        tree.to_newick(&opts)
    }

    #[test]
    fn test_threshold_validation() {
        assert!(ConsensusBuilder::new(0.5, ThresholdPolicy::Inclusive).is_ok());
        assert!(ConsensusBuilder::new(1.0, ThresholdPolicy::Strict).is_ok());
        for bad in [0.0, -0.1, 1.01, f64::NAN] {
            assert!(matches!(
                ConsensusBuilder::new(bad, ThresholdPolicy::Strict),
                Err(SplitError::InvalidThreshold(_))
            ));
        }
    }

    #[test]
    fn test_nested_splits_build_caterpillar() {
        let registry = registry();
        let splits = [Bitset::from_indices([3, 4]), Bitset::from_indices([2, 3, 4])];
        let consensus = build_from_splits(&registry, Rooting::Unrooted, &splits).unwrap();
        assert_eq!(bare(&consensus.tree), "(A,B,(C,(D,E)));");
        assert_eq!(consensus.accepted.len(), 2);
        assert!(consensus.discarded.is_empty());
    }

    #[test]
    fn test_insertion_order_does_not_matter_for_compatible_splits() {
        let registry = registry();
        let splits = [Bitset::from_indices([2, 3, 4]), Bitset::from_indices([3, 4])];
        let consensus = build_from_splits(&registry, Rooting::Unrooted, &splits).unwrap();
        assert_eq!(bare(&consensus.tree), "(A,B,(C,(D,E)));");
    }

    #[test]
    fn test_incompatible_split_is_discarded() {
        let registry = registry();
        let splits = [Bitset::from_indices([1, 2]), Bitset::from_indices([2, 3])];
        let consensus = build_from_splits(&registry, Rooting::Unrooted, &splits).unwrap();
        assert_eq!(consensus.accepted, vec![Bitset::from_indices([1, 2])]);
        assert_eq!(consensus.discarded, vec![Bitset::from_indices([2, 3])]);
        assert_eq!(bare(&consensus.tree), "(A,(B,C),D,E);");
    }

    #[test]
    fn test_rooted_clades_may_contain_taxon_zero() {
        let registry = registry();
        let splits = [Bitset::from_indices([0, 1]), Bitset::from_indices([2, 3, 4])];
        let consensus = build_from_splits(&registry, Rooting::Rooted, &splits).unwrap();
        assert_eq!(bare(&consensus.tree), "((A,B),(C,D,E));");
        assert_eq!(consensus.tree.rooting, Rooting::Rooted);
    }

    #[test]
    fn test_empty_distribution() {
        let dist = SplitDistribution::new(registry());
        assert!(matches!(ConsensusBuilder::default().build(&dist), Err(SplitError::EmptyDistribution)));
    }
}
