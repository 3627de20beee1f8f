//! Arbitrary-width bitmask over taxon indices.
//!
//! # Overview
//! A split (bipartition) is stored as the set of taxa on one side of an edge.
//! Each bit position corresponds to a taxon index in a [`TaxonRegistry`].
//!
//! # Example
//! For a registry with taxa [A, B, C, D] mapped to indices [0, 1, 2, 3]:
//! - Split {A, C} → bitset `0b0101` (bits 0 and 2 set)
//! - Split {B, C, D} → bitset `0b1110` (bits 1, 2, 3 set)
//!
//! [`TaxonRegistry`]: crate::taxon::TaxonRegistry

use std::cmp::Ordering;

/// A compact bitset for representing which taxa belong to one side of a split.
///
/// Internally stores bits in `Vec<u64>` words to support arbitrarily large
/// registries. The word vector never ends in a zero word, so two bitsets
/// holding the same taxa compare and hash equal regardless of how many taxa
/// the registry had when they were built.
///
/// Ordering is numeric: the bitset is read as one unsigned integer.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Bitset(Vec<u64>);

impl Bitset {
    /// The empty set (numeric value 0).
    pub fn empty() -> Self {
        Bitset(Vec::new())
    }

    /// A bitset with exactly one bit set.
    ///
    /// ```
    /// # use split_consensus::bitset::Bitset;
    /// let bs = Bitset::singleton(65);
    /// assert_eq!(bs.words().len(), 2);
    /// assert!(bs.contains(65));
    /// ```
    pub fn singleton(idx: usize) -> Self {
        let mut bs = Bitset::empty();
        bs.set(idx);
        bs
    }

    /// A bitset with the lowest `n` bits set.
    pub fn first_n(n: usize) -> Self {
        let mut words = vec![u64::MAX; n >> 6];
        if n & 63 != 0 {
            words.push((1u64 << (n & 63)) - 1);
        }
        Bitset(words)
    }

    pub fn from_indices<I: IntoIterator<Item = usize>>(indices: I) -> Self {
        let mut bs = Bitset::empty();
        for idx in indices {
            bs.set(idx);
        }
        bs
    }

    /// Raw words, least significant first.
    pub fn words(&self) -> &[u64] {
        &self.0
    }

    /// Sets the bit at the given index to 1, growing the word vector if needed.
    ///
    /// ```
    /// # use split_consensus::bitset::Bitset;
    /// let mut bs = Bitset::empty();
    /// bs.set(0);
    /// bs.set(5);
    /// assert_eq!(bs.words()[0], 0b00100001);
    /// ```
    #[inline]
    pub fn set(&mut self, idx: usize) {
        let word = idx >> 6;     // Equivalent to idx / 64
        let bit = idx & 63;      // Equivalent to idx % 64
        if self.0.len() <= word {
            self.0.resize(word + 1, 0);
        }
        self.0[word] |= 1u64 << bit;
    }

    #[inline]
    pub fn contains(&self, idx: usize) -> bool {
        self.0
            .get(idx >> 6)
            .is_some_and(|w| w & (1u64 << (idx & 63)) != 0)
    }

    /// Performs bitwise OR with another bitset (union operation).
    ///
    /// ```
    /// # use split_consensus::bitset::Bitset;
    /// let mut left = Bitset::singleton(0);
    /// left.or_assign(&Bitset::singleton(1));
    /// assert_eq!(left.words()[0], 0b11);
    /// ```
    #[inline]
    pub fn or_assign(&mut self, other: &Bitset) {
        if self.0.len() < other.0.len() {
            self.0.resize(other.0.len(), 0);
        }
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a |= *b;
        }
    }

    /// Counts the number of set bits (population count).
    #[inline]
    pub fn count_ones(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if every bit of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &Bitset) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a & !b == 0)
    }

    pub fn intersects(&self, other: &Bitset) -> bool {
        self.0.iter().zip(&other.0).any(|(a, b)| a & b != 0)
    }

    /// Bits of `universe` that are not set in `self`.
    ///
    /// # Example
    /// Universe of 4 taxa `0b1111`: `0b0011` → `0b1100`.
    pub fn complement_within(&self, universe: &Bitset) -> Bitset {
        let words = universe
            .0
            .iter()
            .enumerate()
            .map(|(i, u)| u & !self.0.get(i).copied().unwrap_or(0))
            .collect();
        Bitset::normalized(words)
    }

    /// Indices of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(w, &word)| {
            (0..64).filter(move |b| word & (1u64 << b) != 0).map(move |b| (w << 6) | b)
        })
    }

    fn normalized(mut words: Vec<u64>) -> Self {
        while words.last() == Some(&0) {
            words.pop();
        }
        Bitset(words)
    }
}

impl Ord for Bitset {
    fn cmp(&self, other: &Self) -> Ordering {
        // No trailing zero words, so more words means a larger number.
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.iter().rev().cmp(other.0.iter().rev()))
    }
}

impl PartialOrd for Bitset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitset_basic() {
        let mut bs = Bitset::empty();
        bs.set(0);
        bs.set(2);
        assert_eq!(bs.words()[0], 0b0101);
        assert!(bs.contains(2));
        assert!(!bs.contains(1));
        assert!(!bs.contains(300));
    }

    #[test]
    fn test_bitset_or() {
        let mut bs1 = Bitset::from_indices([0, 1]);
        let bs2 = Bitset::from_indices([2, 3]);

        bs1.or_assign(&bs2);
        assert_eq!(bs1.words()[0], 0b1111);
        assert_eq!(bs1.count_ones(), 4);
    }

    /// Visual example: How bitsets represent a small tree
    ///
    /// ```text
    ///           root
    ///          /    \
    ///        node1   D
    ///        /   \
    ///       A    node2
    ///            /   \
    ///           B     C
    /// ```
    ///
    /// Leaf mapping: A=0, B=1, C=2, D=3
    ///
    /// - node2: {B, C} → `0b0110`
    /// - node1: {A, B, C} → `0b0111`
    #[test]
    fn test_mini_tree_example() {
        let node2 = Bitset::from_indices([1, 2]);
        let mut node1 = Bitset::singleton(0);
        node1.or_assign(&node2);
        assert_eq!(node1.words()[0], 0b0111);
        assert!(node2.is_subset_of(&node1));
        assert!(!node1.is_subset_of(&node2));
        assert!(node1.intersects(&node2));
    }

    #[test]
    fn test_complement_trims_high_words() {
        let universe = Bitset::first_n(70);
        let high = Bitset::from_indices(64..70);
        let low = high.complement_within(&universe);
        assert_eq!(low, Bitset::first_n(64));
        assert_eq!(low.words().len(), 1);
        assert!(low.complement_within(&low).is_empty());
    }

    #[test]
    fn test_equality_ignores_width() {
        let mut grown = Bitset::from_indices([3, 100]);
        let wide = grown.complement_within(&Bitset::from_indices([100]));
        grown = Bitset::singleton(3);
        assert!(wide.is_empty());
        assert_eq!(grown, Bitset::from_indices([3]));
        assert_eq!(Bitset::first_n(0), Bitset::empty());
    }

    #[test]
    fn test_numeric_ordering() {
        let a = Bitset::from_indices([0, 1, 2]); // 7
        let b = Bitset::singleton(3); // 8
        let c = Bitset::singleton(64);
        assert!(a < b);
        assert!(b < c);
        assert!(Bitset::empty() < a);
    }

    #[test]
    fn test_iter_ones() {
        let bs = Bitset::from_indices([5, 0, 127, 64]);
        assert_eq!(bs.iter_ones().collect::<Vec<_>>(), vec![0, 5, 64, 127]);
    }
}
