//! Crate-wide error type.
//!
//! Configuration errors are raised before any I/O, data errors abort the
//! ingestion unit that hit them, and in parallel mode one worker's error
//! terminates the whole pipeline.

use std::path::PathBuf;

/// Errors raised while counting, summarizing or building trees.
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    /// A new taxon was registered after the registry had been sealed.
    #[error("taxon registry is sealed; cannot register new taxon '{0}'")]
    ImmutableRegistry(String),

    /// A taxon handle from another registry (or an unknown label) was used.
    #[error("taxon '{0}' does not belong to this registry")]
    UnknownTaxon(String),

    /// A leaf without a taxon was found while encoding splits.
    #[error("leaf node {0} has no taxon assigned")]
    UnlabeledLeaf(usize),

    /// A tree's rootedness contradicts the distribution it is counted into.
    #[error("cannot mix rooted and unrooted trees (distribution is {expected}, tree is {found})")]
    MixedRooting { expected: &'static str, found: &'static str },

    /// Two distributions built against different registry instances.
    #[error("split distributions do not share the same taxon registry")]
    IncompatibleRegistry,

    /// Consensus requested from a distribution without any tree.
    #[error("split distribution is empty (no trees counted)")]
    EmptyDistribution,

    /// Frequency threshold outside (0, 1].
    #[error("minimum split frequency must be in (0, 1], got {0}")]
    InvalidThreshold(f64),

    /// Age-derived edge length below zero without permission to keep it.
    #[error("negative edge length {length} below node {node} (parent age {parent_age}, node age {node_age})")]
    NegativeEdgeLength { node: usize, length: f64, parent_age: f64, node_age: f64 },

    /// Tips of a rooted tree are not equidistant from its root.
    #[error("tree is not ultrametric: node {node} has child ages differing by {difference}")]
    NotUltrametric { node: usize, difference: f64 },

    /// The built consensus does not reproduce the accepted split set.
    #[error("consensus tree encodes {found} splits but {expected} were accepted")]
    InconsistentConsensus { expected: usize, found: usize },

    /// Contradictory or out-of-range configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The tree-source reader could not parse a tree.
    #[error("failed to parse tree {index} in {path}: {message}")]
    Parse { path: String, index: usize, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An input path does not exist or is not readable.
    #[error("tree source not found: {0}")]
    MissingSource(PathBuf),

    /// Every input source was missing or skipped.
    #[error("no valid tree sources remain")]
    NoValidSources,

    /// A worker thread panicked or the pool could not be built.
    #[error("worker failure: {0}")]
    WorkerFailed(String),

    /// Fewer worker results than workers arrived at the coordinator.
    #[error("ingestion cancelled: received {received} of {expected} worker results")]
    Cancelled { expected: usize, received: usize },
}

pub type Result<T> = std::result::Result<T, SplitError>;
