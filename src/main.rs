use clap::{Parser, ValueEnum};
use split_consensus::annotate::{NodeAgeOptions, SupportAnnotator, SupportConfig, SupportFormat, SupportTargets};
use split_consensus::consensus::{ConsensusBuilder, ThresholdPolicy};
use split_consensus::distribution::SplitDistribution;
use split_consensus::error::{Result, SplitError};
use split_consensus::io::{self, FileTreeSource, TreeFormat, TreeSource};
use split_consensus::pipeline::{IngestConfig, IngestionPipeline, MissingSourcePolicy, RootingPolicy};
use split_consensus::stats::Aggregator;
use split_consensus::tree::{NewickOptions, Tree};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Summarize the splits of a sample of trees into a consensus tree, or map
/// split support onto a given target tree.
#[derive(Parser, Debug)]
#[command(name = "sumsplits", version, about = "Split support and consensus trees from tree samples")]
struct Args {
    /// Tree files (Newick or NEXUS, optionally .gz); `-` reads stdin
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Input format; guessed from content when omitted
    #[arg(long = "format", value_enum)]
    format: Option<FormatArg>,

    /// Burn-in: drop the first N trees of every input
    #[arg(short = 'b', long = "burnin", default_value_t = 0)]
    burnin: usize,

    /// Number of worker threads reading inputs
    #[arg(short = 'w', long = "workers", default_value_t = 1)]
    workers: usize,

    /// Minimum split frequency for the consensus tree
    #[arg(short = 'f', long = "min-freq", default_value_t = 0.5)]
    min_freq: f64,

    /// Keep splits at exactly the minimum frequency too (`>=` instead of `>`)
    #[arg(long = "inclusive", default_value_t = false)]
    inclusive: bool,

    /// Map support onto the trees of this file instead of building a consensus
    #[arg(short = 't', long = "target", conflicts_with = "mcc")]
    target: Option<PathBuf>,

    /// Use the maximum clade credibility tree as the target
    #[arg(long = "mcc", default_value_t = false)]
    mcc: bool,

    /// Report support as a percentage instead of a proportion
    #[arg(short = 'p', long = "percentage", default_value_t = false)]
    percentage: bool,

    /// Decimal places of support values
    #[arg(short = 'd', long = "decimals", default_value_t = 2)]
    decimals: usize,

    /// Where support goes: label | length | annotation (repeatable)
    #[arg(long = "support-as", value_enum)]
    support_as: Vec<SupportArg>,

    /// Edge lengths of the output: mean | median | none (keep as is)
    #[arg(long = "edge-lengths", value_enum, default_value_t = SummaryArg::Mean)]
    edge_lengths: SummaryArg,

    /// Set node ages from the sample (implies rooted trees): mean | median | none
    #[arg(long = "node-ages", value_enum, default_value_t = SummaryArg::None)]
    node_ages: SummaryArg,

    /// Raise nodes younger than their children instead of failing
    #[arg(long = "collapse-negative", default_value_t = false)]
    collapse_negative: bool,

    /// Keep negative edge lengths derived from node ages
    #[arg(long = "allow-negative-edges", default_value_t = false)]
    allow_negative_edges: bool,

    /// Treat all input trees as rooted
    #[arg(long = "rooted", conflicts_with = "unrooted", default_value_t = false)]
    rooted: bool,

    /// Treat all input trees as unrooted
    #[arg(long = "unrooted", default_value_t = false)]
    unrooted: bool,

    /// Log and skip missing input files instead of failing
    #[arg(long = "skip-missing", default_value_t = false)]
    skip_missing: bool,

    /// Log progress every N trees (0 disables)
    #[arg(long = "progress-every", default_value_t = 0)]
    progress_every: usize,

    /// Weight trees by their `[&W x]` comment
    #[arg(long = "weighted", default_value_t = false)]
    weighted: bool,

    /// Also write a TSV table of all splits to this path
    #[arg(long = "split-table")]
    split_table: Option<PathBuf>,

    /// Output path for the summary trees (`-` for stdout, `.gz` compresses)
    #[arg(short = 'o', long = "output", default_value = "-")]
    output: PathBuf,

    /// Output tree format
    #[arg(long = "output-format", value_enum, default_value_t = FormatArg::Nexus)]
    output_format: FormatArg,

    /// Quiet mode: only warnings and errors are logged
    #[arg(short = 'q', long = "quiet", default_value_t = false)]
    quiet: bool,

    /// Log as JSON lines
    #[arg(long = "log-json", default_value_t = false)]
    log_json: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FormatArg { Newick, Nexus }

impl From<FormatArg> for TreeFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Newick => TreeFormat::Newick,
            FormatArg::Nexus => TreeFormat::Nexus,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum SupportArg { Label, Length, Annotation }

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum SummaryArg { Mean, Median, None }

impl SummaryArg {
    fn aggregator(self) -> Option<Aggregator> {
        match self {
            SummaryArg::Mean => Some(Aggregator::Mean),
            SummaryArg::Median => Some(Aggregator::Median),
            SummaryArg::None => None,
        }
    }
}

fn init_tracing(quiet: bool, json: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_target(false).with_writer(std::io::stderr)).init();
    }
}

fn main() {
    let args = Args::parse();
    init_tracing(args.quiet, args.log_json);

    if let Err(e) = run(&args) {
        error!("{e}");
        let code = match e {
            SplitError::InvalidConfig(_) | SplitError::InvalidThreshold(_) => 2,
            SplitError::MissingSource(_) | SplitError::NoValidSources | SplitError::Parse { .. } => 3,
            SplitError::Io(_) => 4,
            _ => 1,
        };
        std::process::exit(code);
    }
}

fn ingest_config(args: &Args) -> IngestConfig {
    let rooting = if args.rooted {
        RootingPolicy::ForceRooted
    } else if args.unrooted {
        RootingPolicy::ForceUnrooted
    } else {
        RootingPolicy::AsDeclared
    };
    IngestConfig {
        burnin: args.burnin,
        workers: args.workers,
        progress_every: args.progress_every,
        missing_sources: if args.skip_missing { MissingSourcePolicy::Skip } else { MissingSourcePolicy::Fail },
        rooting,
        track_ages: args.node_ages != SummaryArg::None,
        weighted: args.weighted,
        count_topologies: args.mcc,
        ignore_edge_lengths: args.edge_lengths == SummaryArg::None,
        ..IngestConfig::default()
    }
}

fn support_config(args: &Args) -> SupportConfig {
    let targets = if args.support_as.is_empty() {
        SupportTargets::default()
    } else {
        SupportTargets {
            label: args.support_as.contains(&SupportArg::Label),
            edge_length: args.support_as.contains(&SupportArg::Length),
            annotation: args.support_as.contains(&SupportArg::Annotation),
        }
    };
    SupportConfig {
        targets,
        format: SupportFormat { percentage: args.percentage, decimals: args.decimals },
    }
}

fn run(args: &Args) -> Result<()> {
    // Configuration errors surface before any input is touched
    let policy = if args.inclusive { ThresholdPolicy::Inclusive } else { ThresholdPolicy::Strict };
    let builder = ConsensusBuilder::new(args.min_freq, policy)?;
    let config = ingest_config(args);
    config.validate(&args.inputs)?;
    if args.node_ages != SummaryArg::None && args.support_as.contains(&SupportArg::Length) {
        return Err(SplitError::InvalidConfig("support cannot be written as edge lengths when node ages set them".into()));
    }
    let annotator = SupportAnnotator::new(support_config(args));
    let source = FileTreeSource { format: args.format.map(TreeFormat::from) };

    let t0 = Instant::now();
    let pipeline = IngestionPipeline::new(source, config);
    let dist = if args.workers > 1 {
        pipeline.ingest_parallel(&args.inputs, None)?
    } else {
        pipeline.ingest_serial(&args.inputs, None)?
    };
    if dist.is_empty() {
        return Err(SplitError::EmptyDistribution);
    }
    info!(
        trees = dist.total_trees_counted(),
        splits = dist.counts().len(),
        taxa = dist.registry().len(),
        secs = t0.elapsed().as_secs_f64(),
        "read tree sample"
    );

    let mut trees = match (&args.target, args.mcc) {
        (Some(target), _) => read_targets(target, &source, &dist)?,
        (None, true) => vec![builder.build_mcc(&dist)?.tree],
        (None, false) => vec![builder.build(&dist)?.tree],
    };

    for tree in &mut trees {
        annotate(args, &annotator, tree, &dist)?;
    }

    let options = NewickOptions {
        edge_lengths: true,
        annotations: annotator.config().targets.annotation,
        rooting_comment: true,
    };
    let mut out = io::open_output(&args.output)?;
    io::write_trees(&mut out, &trees, args.output_format.into(), &options, dist.registry())?;
    info!(trees = trees.len(), output = %args.output.display(), "wrote summary trees");

    if let Some(path) = &args.split_table {
        let mut out = io::open_output(path)?;
        io::write_split_table(&mut out, &dist)?;
        info!(output = %path.display(), "wrote split table");
    }
    Ok(())
}

/// Target trees are bound to the sample's registry, which is frozen first.
fn read_targets(path: &Path, source: &FileTreeSource, dist: &SplitDistribution) -> Result<Vec<Tree>> {
    dist.registry().seal();
    let trees = source.open(path, 0, dist.registry())?.collect::<Result<Vec<_>>>()?;
    if trees.is_empty() {
        return Err(SplitError::InvalidConfig(format!("no trees in target file {}", path.display())));
    }
    Ok(trees)
}

fn annotate(args: &Args, annotator: &SupportAnnotator, tree: &mut Tree, dist: &SplitDistribution) -> Result<()> {
    if let Some(aggregator) = args.node_ages.aggregator() {
        let options = NodeAgeOptions {
            aggregator,
            collapse_negative: args.collapse_negative,
            allow_negative_edges: args.allow_negative_edges,
        };
        annotator.summarize_node_ages(tree, dist, options)?;
    } else if let Some(aggregator) = args.edge_lengths.aggregator() {
        annotator.summarize_edge_lengths(tree, dist, aggregator)?;
    }
    annotator.map_support_to_tree(tree, dist)
}
