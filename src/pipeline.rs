//! Serial and worker-pool ingestion of many tree sources into one
//! [`SplitDistribution`].
//!
//! In parallel mode the coordinator freezes a [`TaxonRegistry`] first, then
//! `W` workers pull paths off a pre-loaded queue, each counting into a
//! private distribution. Each worker sends exactly one result over a
//! channel; the coordinator merges them once all `W` have arrived. Merge
//! is order-independent, so the result does not depend on which worker
//! read which file.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;

use tracing::{debug, info, warn};

use crate::distribution::SplitDistribution;
use crate::error::{Result, SplitError};
use crate::io::{FileTreeSource, TreeSource};
use crate::taxon::TaxonRegistry;
use crate::tree::{Rooting, Tree};

/// What to do with a source path that does not exist.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MissingSourcePolicy {
    #[default]
    Fail,
    /// Log and continue; at least one source must remain.
    Skip,
}

/// How the rootedness of incoming trees is decided.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RootingPolicy {
    /// Use the tree's `[&R]`/`[&U]` comment; unmarked trees are unrooted.
    #[default]
    AsDeclared,
    ForceRooted,
    ForceUnrooted,
}

impl RootingPolicy {
    fn forced(&self) -> Option<Rooting> {
        match self {
            RootingPolicy::AsDeclared => None,
            RootingPolicy::ForceRooted => Some(Rooting::Rooted),
            RootingPolicy::ForceUnrooted => Some(Rooting::Unrooted),
        }
    }
}

/// Ingestion settings.
#[derive(Clone, Debug)]
pub struct IngestConfig {
    /// Leading trees dropped from each source.
    pub burnin: usize,
    pub workers: usize,
    /// Report progress every N trees; 0 disables.
    pub progress_every: usize,
    pub missing_sources: MissingSourcePolicy,
    pub rooting: RootingPolicy,
    /// Compute and record node ages (implies rooted trees).
    pub track_ages: bool,
    pub ultrametric_tolerance: f64,
    /// Use `[&W x]` tree weights instead of 1.0 per tree.
    pub weighted: bool,
    pub count_topologies: bool,
    pub ignore_edge_lengths: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            burnin: 0,
            workers: 1,
            progress_every: 0,
            missing_sources: MissingSourcePolicy::Fail,
            rooting: RootingPolicy::AsDeclared,
            track_ages: false,
            ultrametric_tolerance: 1e-5,
            weighted: false,
            count_topologies: false,
            ignore_edge_lengths: false,
        }
    }
}

impl IngestConfig {
    /// Checks settings against the given sources without touching them.
    ///
    /// # Errors
    /// [`SplitError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self, sources: &[PathBuf]) -> Result<()> {
        if self.workers == 0 {
            return Err(SplitError::InvalidConfig("at least one worker is required".into()));
        }
        if self.track_ages && self.rooting == RootingPolicy::ForceUnrooted {
            return Err(SplitError::InvalidConfig("node ages require rooted trees".into()));
        }
        if !(self.ultrametric_tolerance >= 0.0) {
            return Err(SplitError::InvalidConfig(format!(
                "ultrametricity tolerance must be non-negative, got {}",
                self.ultrametric_tolerance
            )));
        }
        let stdin_count = sources.iter().filter(|p| is_stdin(p)).count();
        if stdin_count > 1 {
            return Err(SplitError::InvalidConfig("standard input can only be read once".into()));
        }
        if stdin_count == 1 && self.workers > 1 {
            return Err(SplitError::InvalidConfig(
                "standard input cannot be read with more than one worker".into(),
            ));
        }
        Ok(())
    }
}

fn is_stdin(path: &Path) -> bool {
    path.as_os_str() == "-"
}

/// Shared stop flag for a running ingestion.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Pre-loaded, read-only list of paths handed out by an atomic cursor.
struct WorkQueue {
    paths: Arc<[PathBuf]>,
    next: AtomicUsize,
}

impl WorkQueue {
    fn new(paths: Vec<PathBuf>) -> Self {
        WorkQueue { paths: paths.into(), next: AtomicUsize::new(0) }
    }

    fn pop(&self) -> Option<&Path> {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        self.paths.get(i).map(PathBuf::as_path)
    }
}

/// Reads tree sources into split distributions.
pub struct IngestionPipeline<S: TreeSource = FileTreeSource> {
    source: S,
    config: IngestConfig,
    cancel: CancelToken,
}

impl<S: TreeSource> IngestionPipeline<S> {
    pub fn new(source: S, config: IngestConfig) -> Self {
        IngestionPipeline { source, config, cancel: CancelToken::new() }
    }

    /// Shares an external token, e.g. one tripped by a signal handler.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Applies the missing-source policy to `paths`.
    ///
    /// # Errors
    /// [`SplitError::MissingSource`] under [`MissingSourcePolicy::Fail`];
    /// [`SplitError::NoValidSources`] if nothing remains.
    pub fn resolve_sources(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut sources = Vec::with_capacity(paths.len());
        for path in paths {
            if is_stdin(path) || self.source.exists(path) {
                sources.push(path.clone());
                continue;
            }
            match self.config.missing_sources {
                MissingSourcePolicy::Fail => return Err(SplitError::MissingSource(path.clone())),
                MissingSourcePolicy::Skip => warn!(path = %path.display(), "skipping missing source"),
            }
        }
        if sources.is_empty() {
            return Err(SplitError::NoValidSources);
        }
        Ok(sources)
    }

    /// Builds and seals a registry from the taxa of the first tree found.
    ///
    /// Burn-in is ignored here; only taxon labels are taken.
    ///
    /// # Errors
    /// [`SplitError::NoValidSources`] if no source yields a tree.
    pub fn discover_registry(&self, sources: &[PathBuf]) -> Result<Arc<TaxonRegistry>> {
        let registry = Arc::new(TaxonRegistry::new());
        for path in sources {
            if let Some(tree) = self.source.open(path, 0, &registry)?.next() {
                tree?;
                registry.seal();
                info!(path = %path.display(), taxa = registry.len(), "discovered taxon registry");
                return Ok(registry);
            }
        }
        Err(SplitError::NoValidSources)
    }

    fn new_distribution(&self, registry: Arc<TaxonRegistry>) -> SplitDistribution {
        let mut dist = SplitDistribution::new(registry);
        if let Some(rooting) = self.config.rooting.forced() {
            dist = dist.with_rooting(rooting);
        }
        if self.config.count_topologies {
            dist = dist.with_topologies();
        }
        dist.ignore_edge_lengths = self.config.ignore_edge_lengths;
        dist.ignore_node_ages = !self.config.track_ages;
        dist
    }

    fn count_tree(&self, dist: &mut SplitDistribution, mut tree: Tree) -> Result<()> {
        if let Some(rooting) = self.config.rooting.forced() {
            tree.rooting = rooting;
        } else if self.config.track_ages && tree.rooting == Rooting::Unknown {
            tree.rooting = Rooting::Rooted;
        }
        if self.config.track_ages && tree.rooting.is_rooted() {
            tree.calc_node_ages(self.config.ultrametric_tolerance)?;
        }
        let weight = if self.config.weighted { tree.weight.unwrap_or(1.0) } else { 1.0 };
        dist.count_splits_on_tree(&mut tree, weight)
    }

    /// Counts one source after burn-in; returns the number of trees counted.
    fn count_source<F>(
        &self,
        dist: &mut SplitDistribution,
        path: &Path,
        counted: &mut usize,
        on_progress: &mut F,
    ) -> Result<usize>
    where
        F: FnMut(usize),
    {
        let registry = dist.registry().clone();
        let reader = self.source.open(path, self.config.burnin, &registry)?;
        let before = *counted;
        for tree in reader {
            self.count_tree(dist, tree?)?;
            *counted += 1;
            if self.config.progress_every > 0 && *counted % self.config.progress_every == 0 {
                on_progress(*counted);
            }
        }
        debug!(path = %path.display(), trees = *counted - before, "finished source");
        Ok(*counted - before)
    }

    /// Reads `paths` in order on the calling thread.
    ///
    /// Without a `registry`, a fresh unsealed one is used and taxa are
    /// registered as they are first seen.
    pub fn ingest_serial(
        &self,
        paths: &[PathBuf],
        registry: Option<Arc<TaxonRegistry>>,
    ) -> Result<SplitDistribution> {
        self.ingest_serial_with_progress(paths, registry, |trees| info!(trees, "progress"))
    }

    /// [`ingest_serial`](Self::ingest_serial) with a callback invoked every
    /// `progress_every` trees with the running total.
    pub fn ingest_serial_with_progress<F>(
        &self,
        paths: &[PathBuf],
        registry: Option<Arc<TaxonRegistry>>,
        mut on_progress: F,
    ) -> Result<SplitDistribution>
    where
        F: FnMut(usize),
    {
        self.config.validate(paths)?;
        let sources = self.resolve_sources(paths)?;
        let registry = registry.unwrap_or_default();
        let mut dist = self.new_distribution(registry);
        let mut counted = 0;
        for path in &sources {
            self.count_source(&mut dist, path, &mut counted, &mut on_progress)?;
        }
        info!(sources = sources.len(), trees = counted, splits = dist.counts().len(), "ingested trees");
        Ok(dist)
    }

    /// Reads `paths` with `config.workers` workers and merges the results.
    ///
    /// A supplied `registry` is sealed; otherwise one is discovered from the
    /// first tree of the first source. Taxa missing from it are errors.
    ///
    /// Standard input is not accepted: discovery would consume it before
    /// any worker reads it.
    ///
    /// # Errors
    /// The first worker error, [`SplitError::WorkerFailed`] if a worker
    /// panicked, or [`SplitError::Cancelled`] if fewer than `workers`
    /// results arrived.
    pub fn ingest_parallel(
        &self,
        paths: &[PathBuf],
        registry: Option<Arc<TaxonRegistry>>,
    ) -> Result<SplitDistribution> {
        self.config.validate(paths)?;
        if paths.iter().any(|p| is_stdin(p)) {
            return Err(SplitError::InvalidConfig(
                "standard input can only be read by serial ingestion".into(),
            ));
        }
        let sources = self.resolve_sources(paths)?;
        let registry = match registry {
            Some(registry) => {
                registry.seal();
                registry
            }
            None => self.discover_registry(&sources)?,
        };

        let workers = self.config.workers;
        let queue = WorkQueue::new(sources);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| SplitError::WorkerFailed(e.to_string()))?;

        // Worker failures stop this run only; the shared token stays as is
        let run = CancelToken::new();
        let (tx, rx) = mpsc::channel::<Result<SplitDistribution>>();
        pool.scope(|scope| {
            for worker in 0..workers {
                let tx = tx.clone();
                let (queue, registry, run) = (&queue, &registry, &run);
                scope.spawn(move |_| {
                    let outcome =
                        panic::catch_unwind(AssertUnwindSafe(|| self.run_worker(worker, queue, registry, run)));
                    let result = outcome.unwrap_or_else(|payload| {
                        run.cancel();
                        let message = panic_message(payload.as_ref());
                        warn!(worker, %message, "worker panicked");
                        Some(Err(SplitError::WorkerFailed(format!("worker {worker} panicked: {message}"))))
                    });
                    if let Some(result) = result {
                        // The receiver outlives the scope
                        let _ = tx.send(result);
                    }
                });
            }
        });
        drop(tx);

        let mut partials = Vec::with_capacity(workers);
        for result in rx {
            partials.push(result?);
        }
        if partials.len() != workers {
            warn!(expected = workers, received = partials.len(), "ingestion cancelled");
            return Err(SplitError::Cancelled { expected: workers, received: partials.len() });
        }

        let mut dist = self.new_distribution(registry);
        for partial in partials {
            dist.merge(partial)?;
        }
        info!(
            workers,
            sources = queue.paths.len(),
            trees = dist.total_trees_counted(),
            splits = dist.counts().len(),
            "ingested trees"
        );
        Ok(dist)
    }

    /// `None` if cancelled; an error also cancels the other workers of `run`.
    fn run_worker(
        &self,
        worker: usize,
        queue: &WorkQueue,
        registry: &Arc<TaxonRegistry>,
        run: &CancelToken,
    ) -> Option<Result<SplitDistribution>> {
        let mut dist = self.new_distribution(registry.clone());
        let mut counted = 0;
        let mut report = |trees: usize| debug!(worker, trees, "progress");
        loop {
            if self.cancel.is_cancelled() || run.is_cancelled() {
                debug!(worker, "worker stopping on cancellation");
                return None;
            }
            let Some(path) = queue.pop() else { break };
            if let Err(e) = self.count_source(&mut dist, path, &mut counted, &mut report) {
                warn!(worker, path = %path.display(), error = %e, "worker failed");
                run.cancel();
                return Some(Err(e));
            }
        }
        debug!(worker, trees = counted, "worker finished");
        Some(Ok(dist))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::TreeReader;
    use std::collections::HashMap;

    /// In-memory sources keyed by path.
    struct MemorySource(HashMap<PathBuf, String>);

    impl MemorySource {
        fn new(files: &[(&str, &str)]) -> Self {
            MemorySource(files.iter().map(|(p, c)| (PathBuf::from(p), c.to_string())).collect())
        }
    }

    impl TreeSource for MemorySource {
        type Reader = TreeReader;

        fn open(&self, path: &Path, skip: usize, registry: &Arc<TaxonRegistry>) -> Result<TreeReader> {
            if path == Path::new("explodes") {
                panic!("source exploded");
            }
            let content = self.0.get(path).ok_or_else(|| SplitError::MissingSource(path.to_path_buf()))?;
            let mut reader = TreeReader::from_str(content, None, registry.clone());
            reader.skip_unparsed(skip);
            Ok(reader)
        }

        fn exists(&self, path: &Path) -> bool {
            self.0.contains_key(path)
        }
    }

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    fn by_labels(dist: &SplitDistribution) -> Vec<(Vec<String>, f64)> {
        let mut out: Vec<_> = dist
            .split_frequencies()
            .into_iter()
            .map(|(s, f)| (dist.registry().labels_of(&s), f))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    #[test]
    fn test_validate_rejects_contradictions() {
        let config = IngestConfig { workers: 0, ..Default::default() };
        assert!(matches!(config.validate(&[]), Err(SplitError::InvalidConfig(_))));

        let config = IngestConfig { track_ages: true, rooting: RootingPolicy::ForceUnrooted, ..Default::default() };
        assert!(matches!(config.validate(&[]), Err(SplitError::InvalidConfig(_))));

        let config = IngestConfig { workers: 2, ..Default::default() };
        assert!(matches!(config.validate(&paths(&["-"])), Err(SplitError::InvalidConfig(_))));
        assert!(IngestConfig::default().validate(&paths(&["-"])).is_ok());
    }

    #[test]
    fn test_serial_burnin_and_progress() {
        let source = MemorySource::new(&[
            ("a", "garbage that is never parsed;\n((A,B),(C,D));\n((A,B),(C,D));"),
            ("b", "garbage;\n((A,C),(B,D));"),
        ]);
        let config = IngestConfig { burnin: 1, progress_every: 2, ..Default::default() };
        let pipeline = IngestionPipeline::new(source, config);
        let mut ticks = Vec::new();
        let dist = pipeline
            .ingest_serial_with_progress(&paths(&["a", "b"]), None, |n| ticks.push(n))
            .unwrap();
        assert_eq!(dist.total_trees_counted(), 3);
        assert_eq!(ticks, vec![2]);
        let ab = crate::bitset::Bitset::from_indices([0, 1]);
        let canonical = crate::codec::canonicalize(&ab, &dist.registry().all_taxa_mask(), dist.rooting());
        assert!((dist.frequency(&canonical) - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_source_policy() {
        let source = MemorySource::new(&[]);
        let pipeline = IngestionPipeline::new(source, IngestConfig::default());
        let missing = paths(&["/nonexistent/trees.nwk"]);
        assert!(matches!(pipeline.resolve_sources(&missing), Err(SplitError::MissingSource(_))));

        let config = IngestConfig { missing_sources: MissingSourcePolicy::Skip, ..Default::default() };
        let pipeline = IngestionPipeline::new(MemorySource::new(&[]), config);
        assert!(matches!(pipeline.resolve_sources(&missing), Err(SplitError::NoValidSources)));
    }

    #[test]
    fn test_parallel_matches_serial() {
        let files = [
            ("a", "((A,B),(C,D),E);\n((A,B),(C,E),D);"),
            ("b", "((A,C),(B,D),E);"),
            ("c", "((A,B),(C,D),E);\n((A,B),C,(D,E));\n((A,B),(C,D),E);"),
        ];
        let names = paths(&["a", "b", "c"]);
        let serial = IngestionPipeline::new(MemorySource::new(&files), IngestConfig::default())
            .ingest_serial(&names, None)
            .unwrap();
        for workers in [1, 2, 3, 5] {
            let config = IngestConfig { workers, ..Default::default() };
            let parallel = IngestionPipeline::new(MemorySource::new(&files), config)
                .ingest_parallel(&names, None)
                .unwrap();
            assert_eq!(parallel.total_trees_counted(), 6);
            assert_eq!(by_labels(&parallel), by_labels(&serial), "workers = {workers}");
        }
    }

    #[test]
    fn test_parallel_rejects_taxa_outside_discovered_registry() {
        let files = [("a", "((A,B),(C,D));"), ("b", "((A,B),(C,X));")];
        let config = IngestConfig { workers: 2, ..Default::default() };
        let result = IngestionPipeline::new(MemorySource::new(&files), config).ingest_parallel(&paths(&["a", "b"]), None);
        assert!(matches!(result, Err(SplitError::ImmutableRegistry(label)) if label == "X"));
    }

    #[test]
    fn test_cancelled_ingestion_reports_short_count() {
        let files = [("a", "((A,B),(C,D));")];
        let config = IngestConfig { workers: 2, ..Default::default() };
        let pipeline = IngestionPipeline::new(MemorySource::new(&files), config);
        pipeline.cancel_token().cancel();
        let result = pipeline.ingest_parallel(&paths(&["a"]), None);
        assert!(matches!(result, Err(SplitError::Cancelled { expected: 2, received: 0 })));
    }

    #[test]
    fn test_parallel_rejects_stdin_before_reading() {
        let pipeline = IngestionPipeline::new(MemorySource::new(&[]), IngestConfig::default());
        let result = pipeline.ingest_parallel(&paths(&["-"]), None);
        assert!(matches!(result, Err(SplitError::InvalidConfig(_))));
        let result = pipeline.ingest_parallel(&paths(&["a", "-"]), None);
        assert!(matches!(result, Err(SplitError::InvalidConfig(_))));
    }

    #[test]
    fn test_failed_run_does_not_poison_later_runs() {
        let files = [("a", "((A,B),(C,D));"), ("b", "((A,B),(C,X));")];
        let config = IngestConfig { workers: 2, ..Default::default() };
        let pipeline = IngestionPipeline::new(MemorySource::new(&files), config);
        assert!(pipeline.ingest_parallel(&paths(&["a", "b"]), None).is_err());
        assert!(!pipeline.cancel_token().is_cancelled());

        let dist = pipeline.ingest_parallel(&paths(&["a"]), None).unwrap();
        assert_eq!(dist.total_trees_counted(), 1);
    }

    #[test]
    fn test_worker_panic_becomes_worker_failed() {
        let files = [("a", "((A,B),(C,D));"), ("explodes", "")];
        let config = IngestConfig { workers: 2, ..Default::default() };
        let pipeline = IngestionPipeline::new(MemorySource::new(&files), config);
        let result = pipeline.ingest_parallel(&paths(&["a", "explodes"]), None);
        assert!(matches!(result, Err(SplitError::WorkerFailed(msg)) if msg.contains("source exploded")));
    }
}
