//! Arena tree model carrying splits, support and summary statistics.
//!
//! # Structure
//! Nodes live in a contiguous vector and are referenced by [`NodeId`]. Every
//! node owns the edge leading into it from its parent (the edge's *head* is
//! the node, its *tail* is the parent; the root edge has no tail). Nodes that
//! are detached by structural edits stay in the arena but are no longer
//! reachable from the root, so traversals never see them.
//!
//! ```text
//!           root            edge(node1): tail = root, head = node1
//!          /    \           edge(root):  tail = none, head = root
//!      node1     D
//!      /   \
//!     A     B
//! ```

use std::fmt::Write as _;
use std::ops::{Index, IndexMut};

use crate::bitset::Bitset;
use crate::error::{Result, SplitError};
use crate::stats::Summary;
use crate::taxon::Taxon;

/// Index of a node in a [`Tree`] arena.
pub type NodeId = usize;

/// Rootedness of a tree or of a split distribution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Rooting {
    /// Not declared; resolved by whoever consumes the tree.
    #[default]
    Unknown,
    Rooted,
    Unrooted,
}

impl Rooting {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rooting::Unknown => "unknown",
            Rooting::Rooted => "rooted",
            Rooting::Unrooted => "unrooted",
        }
    }

    pub fn is_rooted(&self) -> bool {
        matches!(self, Rooting::Rooted)
    }
}

/// The edge leading into a node.
#[derive(Clone, Debug, Default)]
pub struct Edge {
    pub length: Option<f64>,
    /// Canonical split bitmask, set by [`BipartitionCodec::encode`](crate::codec::BipartitionCodec::encode).
    pub split: Option<Bitset>,
    pub length_summary: Option<Summary>,
}

#[derive(Clone, Debug, Default)]
pub struct Node {
    pub taxon: Option<Taxon>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub label: Option<String>,
    /// Distance from the tips; only meaningful on rooted trees.
    pub age: Option<f64>,
    pub edge: Edge,
    /// Split frequency written by the support annotator.
    pub support: Option<f64>,
    pub age_summary: Option<Summary>,
}

impl Node {
    pub fn leaf(taxon: Taxon) -> Self {
        Node { taxon: Some(taxon), ..Node::default() }
    }

    pub fn with_length(mut self, length: Option<f64>) -> Self {
        self.edge.length = length;
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// A phylogenetic tree stored in an arena of [`Node`]s.
#[derive(Clone, Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
    pub rooting: Rooting,
    /// Optional sampling weight (`[&W x]`).
    pub weight: Option<f64>,
    pub name: Option<String>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// Creates a tree holding only a root node.
    pub fn new() -> Self {
        Tree {
            nodes: vec![Node::default()],
            root: 0,
            rooting: Rooting::Unknown,
            weight: None,
            name: None,
        }
    }

    pub fn with_rooting(mut self, rooting: Rooting) -> Self {
        self.rooting = rooting;
        self
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Appends `node` as the last child of `parent` and returns its id.
    pub fn add_child(&mut self, parent: NodeId, mut node: Node) -> NodeId {
        let id = self.nodes.len();
        node.parent = Some(parent);
        self.nodes.push(node);
        self.nodes[parent].children.push(id);
        id
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// Tail node of the edge leading into `id`.
    pub fn edge_tail(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes[id].is_leaf()
    }

    /// Reachable nodes, parents before children, children in order.
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id].children.iter().rev());
        }
        order
    }

    /// Reachable nodes, children before parents.
    pub fn postorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(self.root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
            } else {
                stack.push((id, true));
                for &child in self.nodes[id].children.iter().rev() {
                    stack.push((child, false));
                }
            }
        }
        order
    }

    pub fn leaves(&self) -> Vec<NodeId> {
        self.preorder().into_iter().filter(|&id| self.is_leaf(id)).collect()
    }

    /// True once every reachable edge carries a split.
    pub fn is_encoded(&self) -> bool {
        self.preorder().iter().all(|&id| self.nodes[id].edge.split.is_some())
    }

    /// Drops all split bitmasks; called after structural edits.
    pub fn clear_splits(&mut self) {
        for node in &mut self.nodes {
            node.edge.split = None;
        }
    }

    /// Moves `members` (children of `parent`) under a new internal node that
    /// takes the position of the first member. Returns the new node.
    pub fn group_children(&mut self, parent: NodeId, members: &[NodeId]) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node { parent: Some(parent), ..Node::default() });

        let old = std::mem::take(&mut self.nodes[parent].children);
        let mut placed = false;
        let mut kept = Vec::with_capacity(old.len());
        for child in old {
            if members.contains(&child) {
                if !placed {
                    kept.push(id);
                    placed = true;
                }
            } else {
                kept.push(child);
            }
        }
        self.nodes[parent].children = kept;

        for &member in members {
            self.nodes[member].parent = Some(id);
        }
        self.nodes[id].children = members.to_vec();
        self.clear_splits();
        id
    }

    /// Removes a bifurcation at the root by dissolving one internal child into
    /// the root. The two root edges form one unrooted edge, so their lengths
    /// are summed onto the remaining child. Returns `true` if the tree changed.
    ///
    /// ```text
    ///       root                 root
    ///      /    \               / | \
    ///   node1    C     →       A  B  C   (C.length += node1.length)
    ///   /   \
    ///  A     B
    /// ```
    pub fn collapse_basal_bifurcation(&mut self) -> bool {
        let root = self.root;
        if self.nodes[root].children.len() != 2 {
            return false;
        }
        let (first, second) = (self.nodes[root].children[0], self.nodes[root].children[1]);
        let (dissolve, keep) = if !self.is_leaf(first) {
            (first, second)
        } else if !self.is_leaf(second) {
            (second, first)
        } else {
            return false;
        };

        let merged = match (self.nodes[dissolve].edge.length, self.nodes[keep].edge.length) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
        };
        self.nodes[keep].edge.length = merged;

        let grandchildren = std::mem::take(&mut self.nodes[dissolve].children);
        for &gc in &grandchildren {
            self.nodes[gc].parent = Some(root);
        }
        self.nodes[dissolve].parent = None;
        let children = &mut self.nodes[root].children;
        let pos = children.iter().position(|&c| c == dissolve).unwrap_or(0);
        children.splice(pos..=pos, grandchildren);
        self.clear_splits();
        true
    }

    /// Sets node ages as distance from the tips.
    ///
    /// Leaves are age 0; an internal node's age is the largest
    /// `child.age + child.length` (missing lengths count as 0.0).
    ///
    /// # Errors
    /// [`SplitError::NotUltrametric`] if two children of one node imply
    /// ages further apart than `tolerance`.
    pub fn calc_node_ages(&mut self, tolerance: f64) -> Result<()> {
        for id in self.postorder() {
            if self.is_leaf(id) {
                self.nodes[id].age = Some(0.0);
                continue;
            }
            let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
            for &child in &self.nodes[id].children {
                let c = &self.nodes[child];
                let implied = c.age.unwrap_or(0.0) + c.edge.length.unwrap_or(0.0);
                lo = lo.min(implied);
                hi = hi.max(implied);
            }
            if hi - lo > tolerance {
                return Err(SplitError::NotUltrametric { node: id, difference: hi - lo });
            }
            self.nodes[id].age = Some(hi);
        }
        Ok(())
    }

    /// Serializes the reachable tree as a Newick string ending in `;`.
    pub fn to_newick(&self, options: &NewickOptions) -> String {
        let mut out = String::new();
        if options.rooting_comment {
            match self.rooting {
                Rooting::Rooted => out.push_str("[&R] "),
                Rooting::Unrooted => out.push_str("[&U] "),
                Rooting::Unknown => {}
            }
        }
        self.write_newick(self.root, options, &mut out);
        out.push(';');
        out
    }

    fn write_newick(&self, id: NodeId, options: &NewickOptions, out: &mut String) {
        let node = &self.nodes[id];
        if !node.is_leaf() {
            out.push('(');
            for (i, &child) in node.children.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                self.write_newick(child, options, out);
            }
            out.push(')');
        }

        let label = node
            .taxon
            .as_ref()
            .map(|t| t.label().to_string())
            .or_else(|| node.label.clone());
        if let Some(label) = label {
            out.push_str(&escape_label(&label));
        }

        if options.annotations {
            let comment = annotation_comment(node);
            if !comment.is_empty() {
                let _ = write!(out, "[&{comment}]");
            }
        }

        if options.edge_lengths && id != self.root {
            if let Some(length) = node.edge.length {
                let _ = write!(out, ":{length}");
            }
        }
    }
}

impl Index<NodeId> for Tree {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }
}

impl IndexMut<NodeId> for Tree {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }
}

/// What [`Tree::to_newick`] emits besides topology and labels.
#[derive(Clone, Copy, Debug)]
pub struct NewickOptions {
    pub edge_lengths: bool,
    /// `[&support=..,length_mean=..]` metadata comments.
    pub annotations: bool,
    /// Leading `[&R]` / `[&U]`.
    pub rooting_comment: bool,
}

impl Default for NewickOptions {
    fn default() -> Self {
        NewickOptions { edge_lengths: true, annotations: false, rooting_comment: true }
    }
}

fn annotation_comment(node: &Node) -> String {
    let mut fields: Vec<String> = Vec::new();
    if let Some(support) = node.support {
        fields.push(format!("support={support}"));
    }
    if let Some(s) = &node.edge.length_summary {
        fields.extend(summary_fields("length", s));
    }
    if let Some(age) = node.age {
        fields.push(format!("age={age}"));
    }
    if let Some(s) = &node.age_summary {
        fields.extend(summary_fields("age", s));
    }
    fields.join(",")
}

fn summary_fields(prefix: &str, s: &Summary) -> Vec<String> {
    let mut fields = vec![
        format!("{prefix}_mean={}", s.mean),
        format!("{prefix}_median={}", s.median),
    ];
    if s.sd.is_finite() {
        fields.push(format!("{prefix}_sd={}", s.sd));
    }
    fields.push(format!("{prefix}_range={{{},{}}}", s.min, s.max));
    fields.push(format!("{prefix}_hpd95={{{},{}}}", s.hpd95.0, s.hpd95.1));
    fields.push(format!("{prefix}_q05_q95={{{},{}}}", s.q05, s.q95));
    fields
}

/// Quotes a label if it contains Newick punctuation or whitespace,
/// doubling any embedded single quotes.
pub fn escape_label(label: &str) -> String {
    const SPECIAL: &[char] = &['(', ')', '[', ']', '\'', ':', ';', ','];
    if label.chars().any(|c| c.is_whitespace() || SPECIAL.contains(&c)) {
        format!("'{}'", label.replace('\'', "''"))
    } else {
        label.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxon::TaxonRegistry;

    /// ((A:1,B:1):2,C:3);
    fn small_tree(registry: &TaxonRegistry) -> Tree {
        let mut tree = Tree::new().with_rooting(Rooting::Rooted);
        let root = tree.root();
        let inner = tree.add_child(root, Node::default().with_length(Some(2.0)));
        for label in ["A", "B"] {
            let taxon = registry.register(label).unwrap();
            tree.add_child(inner, Node::leaf(taxon).with_length(Some(1.0)));
        }
        let c = registry.register("C").unwrap();
        tree.add_child(root, Node::leaf(c).with_length(Some(3.0)));
        tree
    }

    #[test]
    fn test_traversal_orders() {
        let registry = TaxonRegistry::new();
        let tree = small_tree(&registry);
        assert_eq!(tree.preorder(), vec![0, 1, 2, 3, 4]);
        assert_eq!(tree.postorder(), vec![2, 3, 1, 4, 0]);
        assert_eq!(tree.leaves(), vec![2, 3, 4]);
        assert_eq!(tree.edge_tail(1), Some(0));
        assert_eq!(tree.edge_tail(0), None);
    }

    #[test]
    fn test_newick_output() {
        let registry = TaxonRegistry::new();
        let tree = small_tree(&registry);
        assert_eq!(tree.to_newick(&NewickOptions::default()), "[&R] ((A:1,B:1):2,C:3);");
        let bare = NewickOptions { edge_lengths: false, annotations: false, rooting_comment: false };
        assert_eq!(tree.to_newick(&bare), "((A,B),C);");
    }

    #[test]
    fn test_annotation_comment_carries_summary_intervals() {
        let registry = TaxonRegistry::new();
        let mut tree = small_tree(&registry);
        tree[1].support = Some(0.5);
        tree[1].edge.length_summary = Summary::from_values(&[2.0]);
        let options = NewickOptions { edge_lengths: false, annotations: true, rooting_comment: false };
        assert_eq!(
            tree.to_newick(&options),
            "((A,B)[&support=0.5,length_mean=2,length_median=2,length_range={2,2},\
             length_hpd95={2,2},length_q05_q95={2,2}],C);"
        );
    }

    #[test]
    fn test_calc_node_ages() {
        let registry = TaxonRegistry::new();
        let mut tree = small_tree(&registry);
        tree.calc_node_ages(1e-9).unwrap();
        assert_eq!(tree[1].age, Some(1.0));
        assert_eq!(tree[0].age, Some(3.0));

        tree[4].edge.length = Some(5.0);
        assert!(matches!(tree.calc_node_ages(1e-9), Err(SplitError::NotUltrametric { node: 0, .. })));
    }

    #[test]
    fn test_collapse_basal_bifurcation() {
        let registry = TaxonRegistry::new();
        let mut tree = small_tree(&registry);
        assert!(tree.collapse_basal_bifurcation());
        assert_eq!(tree.children(tree.root()), &[2, 3, 4]);
        assert_eq!(tree[4].edge.length, Some(5.0));
        assert_eq!(tree[2].parent, Some(0));
        assert!(!tree.collapse_basal_bifurcation());
    }

    #[test]
    fn test_group_children_preserves_position() {
        let registry = TaxonRegistry::new();
        let mut tree = Tree::new();
        let root = tree.root();
        let ids: Vec<NodeId> = ["A", "B", "C", "D"]
            .iter()
            .map(|l| tree.add_child(root, Node::leaf(registry.register(l).unwrap())))
            .collect();
        let group = tree.group_children(root, &[ids[1], ids[3]]);
        assert_eq!(tree.children(root), &[ids[0], group, ids[2]]);
        assert_eq!(tree.children(group), &[ids[1], ids[3]]);
        let bare = NewickOptions { edge_lengths: false, annotations: false, rooting_comment: false };
        assert_eq!(tree.to_newick(&bare), "(A,(B,D),C);");
    }

    #[test]
    fn test_escape_label() {
        assert_eq!(escape_label("Homo_sapiens"), "Homo_sapiens");
        assert_eq!(escape_label("Homo sapiens"), "'Homo sapiens'");
        assert_eq!(escape_label("O'Brien"), "'O''Brien'");
    }
}
