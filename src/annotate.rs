//! Transfer split statistics onto a tree.
//!
//! The tree may be a consensus tree or any target tree read against the
//! distribution's registry. Every edge is looked up by its canonical split;
//! support goes to node labels, edge lengths or the node's `support` field,
//! and edge-length / node-age samples are reduced and summarized.

use tracing::debug;

use crate::codec::BipartitionCodec;
use crate::distribution::SplitDistribution;
use crate::error::{Result, SplitError};
use crate::stats::{Aggregator, Summary};
use crate::tree::Tree;

/// How support values are rendered into node labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupportFormat {
    /// Render as percentage (`70`) instead of proportion (`0.70`).
    pub percentage: bool,
    pub decimals: usize,
}

impl Default for SupportFormat {
    fn default() -> Self {
        SupportFormat { percentage: false, decimals: 2 }
    }
}

impl SupportFormat {
    pub fn format(&self, freq: f64) -> String {
        if self.percentage {
            format!("{:.*}", self.decimals, freq * 100.0)
        } else {
            format!("{:.*}", self.decimals, freq)
        }
    }
}

/// Where support values are written; any combination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupportTargets {
    pub label: bool,
    pub edge_length: bool,
    pub annotation: bool,
}

impl Default for SupportTargets {
    fn default() -> Self {
        SupportTargets { label: true, edge_length: false, annotation: true }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SupportConfig {
    pub targets: SupportTargets,
    pub format: SupportFormat,
}

/// Options for [`SupportAnnotator::summarize_node_ages`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeAgeOptions {
    pub aggregator: Aggregator,
    /// Raise any node younger than one of its children to that child's age.
    pub collapse_negative: bool,
    /// Keep negative age-derived edge lengths instead of failing.
    pub allow_negative_edges: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SupportAnnotator {
    config: SupportConfig,
}

impl SupportAnnotator {
    pub fn new(config: SupportConfig) -> Self {
        SupportAnnotator { config }
    }

    pub fn config(&self) -> &SupportConfig {
        &self.config
    }

    fn encode(tree: &mut Tree, dist: &SplitDistribution) -> Result<()> {
        BipartitionCodec::new(dist.registry().clone(), dist.rooting()).encode(tree)
    }

    /// Writes each edge's split frequency (0.0 if never seen, 1.0 on leaves)
    /// to the configured targets.
    pub fn map_support_to_tree(&self, tree: &mut Tree, dist: &SplitDistribution) -> Result<()> {
        Self::encode(tree, dist)?;
        let root = tree.root();
        let targets = self.config.targets;
        for id in tree.preorder() {
            let freq = if tree.is_leaf(id) {
                1.0
            } else {
                tree[id].edge.split.as_ref().map_or(0.0, |s| dist.frequency(s))
            };
            let node = &mut tree[id];
            if targets.annotation {
                node.support = Some(freq);
            }
            if id == root {
                continue;
            }
            if targets.label && !node.is_leaf() {
                node.label = Some(self.config.format.format(freq));
            }
            if targets.edge_length {
                node.edge.length = Some(freq);
            }
        }
        Ok(())
    }

    /// Sets each edge length to `aggregator` over the split's recorded
    /// lengths and attaches the length summary.
    ///
    /// A split that was counted but never carried a length leaves the edge
    /// untouched; a split never observed at all gets length 0.0.
    pub fn summarize_edge_lengths(
        &self,
        tree: &mut Tree,
        dist: &SplitDistribution,
        aggregator: Aggregator,
    ) -> Result<()> {
        Self::encode(tree, dist)?;
        for id in tree.preorder() {
            let Some(split) = tree[id].edge.split.clone() else { continue };
            match dist.edge_lengths(&split) {
                Some(lengths) => {
                    tree[id].edge.length = aggregator.apply(lengths);
                    tree[id].edge.length_summary = Summary::from_values(lengths);
                }
                None if dist.contains(&split) => {}
                None => {
                    debug!(node = id, "split never observed; edge length set to 0.0");
                    tree[id].edge.length = Some(0.0);
                }
            }
        }
        Ok(())
    }

    /// Sets node ages from the split's recorded ages and derives edge lengths
    /// as `parent age - node age`.
    ///
    /// A node whose split has no ages inherits its parent's age. The split's
    /// edge-length summary is attached as well, though lengths come from ages.
    ///
    /// # Errors
    /// [`SplitError::NegativeEdgeLength`] if a derived length is negative and
    /// neither `collapse_negative` nor `allow_negative_edges` is set.
    pub fn summarize_node_ages(
        &self,
        tree: &mut Tree,
        dist: &SplitDistribution,
        options: NodeAgeOptions,
    ) -> Result<()> {
        Self::encode(tree, dist)?;
        let preorder = tree.preorder();

        for &id in &preorder {
            let lengths = tree[id].edge.split.as_ref().and_then(|s| dist.edge_lengths(s));
            tree[id].edge.length_summary = lengths.and_then(Summary::from_values);
            let ages = tree[id].edge.split.as_ref().and_then(|s| dist.node_ages(s));
            match ages {
                Some(ages) => {
                    let summary = Summary::from_values(ages);
                    tree[id].age = options.aggregator.apply(ages);
                    tree[id].age_summary = summary;
                }
                None => {
                    tree[id].age = tree[id].parent.and_then(|p| tree[p].age);
                }
            }
        }

        if options.collapse_negative {
            for id in tree.postorder() {
                let oldest_child = tree
                    .children(id)
                    .iter()
                    .filter_map(|&c| tree[c].age)
                    .fold(None, |acc: Option<f64>, a| Some(acc.map_or(a, |m| m.max(a))));
                if let Some(oldest) = oldest_child {
                    if tree[id].age.is_none_or(|age| age < oldest) {
                        tree[id].age = Some(oldest);
                    }
                }
            }
        }

        for &id in &preorder {
            let Some(parent) = tree[id].parent else { continue };
            let (Some(parent_age), Some(node_age)) = (tree[parent].age, tree[id].age) else {
                continue;
            };
            let length = parent_age - node_age;
            if length < 0.0 && !options.allow_negative_edges {
                return Err(SplitError::NegativeEdgeLength { node: id, length, parent_age, node_age });
            }
            tree[id].edge.length = Some(length);
        }
        Ok(())
    }
}
