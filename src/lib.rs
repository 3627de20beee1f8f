//! Crate root: module orchestration and public re-exports.
//!
//! Modules:
//! - `bitset`: arbitrary-width bitmask used as the split representation.
//! - `taxon`: taxa and the shared, sealable taxon registry.
//! - `tree`: arena tree model with edge/node annotations and Newick output.
//! - `codec`: assigns canonical split bitmasks to every edge of a tree.
//! - `stats`: numeric summaries over recorded edge lengths and node ages.
//! - `distribution`: split counts, lengths and ages accumulated over trees.
//! - `topology`: whole-tree topology counts and clade credibility.
//! - `consensus`: greedy compatible consensus and MCC tree construction.
//! - `annotate`: maps support, lengths and ages onto a target tree.
//! - `io`: Newick / NEXUS reading, tree and split-table writers.
//! - `pipeline`: serial and worker-pool ingestion of many sources.

pub mod error;
pub mod bitset;
pub mod taxon;
pub mod tree;
pub mod codec;
pub mod stats;
pub mod distribution;
pub mod topology;
pub mod consensus;
pub mod annotate;
pub mod io;
pub mod pipeline;

// Re-export frequently used types & functions
pub use error::{Result, SplitError};
pub use bitset::Bitset;
pub use taxon::{Taxon, TaxonRegistry};
pub use tree::{NewickOptions, Rooting, Tree};
pub use codec::BipartitionCodec;
pub use stats::{Aggregator, Summary};
pub use distribution::SplitDistribution;
pub use topology::TopologyCounter;
pub use consensus::{Consensus, ConsensusBuilder, ThresholdPolicy};
pub use annotate::{NodeAgeOptions, SupportAnnotator, SupportConfig, SupportFormat, SupportTargets};
pub use io::{FileTreeSource, TreeFormat, TreeReader, TreeSource, write_split_table, write_trees};
pub use pipeline::{CancelToken, IngestConfig, IngestionPipeline, MissingSourcePolicy, RootingPolicy};
