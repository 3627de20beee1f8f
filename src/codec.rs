//! Encode every edge of a tree as a canonical split bitmask.
//!
//! # What is a bipartition?
//! Each edge divides the taxa into two groups.
//! ```text
//!      root
//!     /    \
//!   {A,B}  {C,D}  ← this edge creates split {A,B}|{C,D}
//! ```
//!
//! # Canonical form
//! - **Rooted**: the head-side mask as-is (the clade below the edge).
//! - **Unrooted**: the side that does NOT contain taxon 0. If the head side
//!   contains taxon 0 it is replaced by its complement within the registry.
//!
//! Canonical forms never depend on node ids or on how a tree was drawn, only
//! on the registry's index assignment.

use std::sync::Arc;

use crate::bitset::Bitset;
use crate::error::{Result, SplitError};
use crate::taxon::TaxonRegistry;
use crate::tree::{Rooting, Tree};

/// Computes split bitmasks against one shared registry.
#[derive(Clone, Debug)]
pub struct BipartitionCodec {
    registry: Arc<TaxonRegistry>,
    rooting: Rooting,
}

impl BipartitionCodec {
    /// `rooting` overrides the tree's own flag unless it is `Unknown`.
    pub fn new(registry: Arc<TaxonRegistry>, rooting: Rooting) -> Self {
        BipartitionCodec { registry, rooting }
    }

    pub fn registry(&self) -> &Arc<TaxonRegistry> {
        &self.registry
    }

    /// Writes `edge.split` on every reachable node in one post-order pass.
    ///
    /// # Algorithm
    /// 1. Resolve rootedness (codec flag, then tree flag, then unrooted)
    /// 2. Unrooted trees have a basal bifurcation collapsed first
    /// 3. **Leaf**: the taxon's cached single-bit mask
    /// 4. **Internal node**: OR of its children's head-side masks
    /// 5. Canonicalize per rootedness
    ///
    /// Idempotent; re-run after any structural edit.
    ///
    /// # Errors
    /// [`SplitError::UnlabeledLeaf`] if a leaf has no taxon,
    /// [`SplitError::UnknownTaxon`] if a taxon belongs to another registry.
    pub fn encode(&self, tree: &mut Tree) -> Result<()> {
        let rooting = self.resolve(tree.rooting);
        tree.rooting = rooting;
        if rooting == Rooting::Unrooted {
            tree.collapse_basal_bifurcation();
        }

        let all = self.registry.all_taxa_mask();
        let order = tree.postorder();
        // Head-side masks, indexed by node id
        let mut raw: Vec<Option<Bitset>> = vec![None; order.iter().max().map_or(0, |m| m + 1)];

        for id in order {
            let mask = if tree.is_leaf(id) {
                let taxon = tree[id].taxon.as_ref().ok_or(SplitError::UnlabeledLeaf(id))?;
                self.registry.bitmask_of(taxon)?
            } else {
                let mut mask = Bitset::empty();
                for &child in tree.children(id) {
                    if let Some(child_mask) = &raw[child] {
                        mask.or_assign(child_mask);
                    }
                }
                mask
            };
            tree[id].edge.split = Some(canonicalize(&mask, &all, rooting));
            raw[id] = Some(mask);
        }
        Ok(())
    }

    fn resolve(&self, tree_rooting: Rooting) -> Rooting {
        match (self.rooting, tree_rooting) {
            (Rooting::Unknown, Rooting::Unknown) => Rooting::Unrooted,
            (Rooting::Unknown, declared) => declared,
            (forced, _) => forced,
        }
    }
}

/// Canonical form of a head-side mask.
///
/// # Example
/// Taxa A=0, B=1, C=2, D=3, unrooted:
/// - {A,B} `0b0011` contains A → flipped to {C,D} `0b1100`
/// - {C,D} `0b1100` kept as-is
pub fn canonicalize(mask: &Bitset, all: &Bitset, rooting: Rooting) -> Bitset {
    if rooting != Rooting::Rooted && mask.contains(0) {
        mask.complement_within(all)
    } else {
        mask.clone()
    }
}

/// True for splits every tree on `n` taxa has: empty, single taxon, or all
/// taxa. In unrooted form `n - 1` taxa is the pendant edge of taxon 0.
pub fn is_trivial(split: &Bitset, n: usize, rooting: Rooting) -> bool {
    let ones = split.count_ones();
    ones <= 1 || ones >= n || (rooting != Rooting::Rooted && ones + 1 == n)
}

/// Sorted non-trivial splits of an encoded tree.
pub fn nontrivial_splits(tree: &Tree, n: usize) -> Vec<Bitset> {
    let mut splits: Vec<Bitset> = tree
        .preorder()
        .into_iter()
        .filter_map(|id| tree[id].edge.split.clone())
        .filter(|s| !is_trivial(s, n, tree.rooting))
        .collect();
    splits.sort_unstable();
    splits.dedup();
    splits
}
