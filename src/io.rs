//! Reading tree sources and writing trees and split tables.
//!
//! Newick parsing itself is delegated to `phylotree`; this module splits a
//! source into individual tree strings (plain Newick or a NEXUS/BEAST
//! `TREES` block with an optional `TRANSLATE` table), reads the `[&R]`,
//! `[&U]` and `[&W x]` comments, strips the rest of the bracket comments,
//! and converts each parsed tree into a [`Tree`] bound to a shared
//! [`TaxonRegistry`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use itertools::Itertools;
use phylotree::tree::Tree as PhyloTree;

use crate::distribution::SplitDistribution;
use crate::error::{Result, SplitError};
use crate::taxon::TaxonRegistry;
use crate::tree::{NewickOptions, Node, NodeId, Rooting, Tree};

/// Input or output tree file format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeFormat {
    Newick,
    Nexus,
}

impl TreeFormat {
    /// NEXUS if the content starts with `#NEXUS`, Newick otherwise.
    pub fn guess(content: &str) -> Self {
        if content.trim_start().to_ascii_uppercase().starts_with("#NEXUS") {
            TreeFormat::Nexus
        } else {
            TreeFormat::Newick
        }
    }
}

/// A source of trees: given a path, yields trees bound to `registry`.
///
/// The first `skip` trees are dropped without being parsed.
pub trait TreeSource: Sync {
    type Reader: Iterator<Item = Result<Tree>>;

    fn open(&self, path: &Path, skip: usize, registry: &Arc<TaxonRegistry>) -> Result<Self::Reader>;

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Newick / NEXUS files on disk (`-` reads stdin, `.gz` is decompressed).
#[derive(Clone, Copy, Debug, Default)]
pub struct FileTreeSource {
    /// `None` guesses from the content.
    pub format: Option<TreeFormat>,
}

impl TreeSource for FileTreeSource {
    type Reader = TreeReader;

    fn open(&self, path: &Path, skip: usize, registry: &Arc<TaxonRegistry>) -> Result<TreeReader> {
        let content = read_source_text(path)?;
        let mut reader = TreeReader::from_str(&content, self.format, registry.clone());
        reader.source = path.display().to_string();
        reader.skip_unparsed(skip);
        Ok(reader)
    }
}

struct TreeBlock {
    name: Option<String>,
    body: String,
}

/// Lazy, forward-only sequence of trees from one source.
pub struct TreeReader {
    blocks: std::vec::IntoIter<TreeBlock>,
    translate: HashMap<String, String>,
    registry: Arc<TaxonRegistry>,
    source: String,
    index: usize,
}

impl TreeReader {
    /// Splits `content` into tree strings; nothing is parsed yet.
    pub fn from_str(content: &str, format: Option<TreeFormat>, registry: Arc<TaxonRegistry>) -> Self {
        let format = format.unwrap_or_else(|| TreeFormat::guess(content));
        let (translate, blocks) = match format {
            TreeFormat::Nexus => (parse_translate_block(content), collect_tree_blocks(content)),
            TreeFormat::Newick => (HashMap::new(), split_newick_strings(content)),
        };
        TreeReader {
            blocks: blocks.into_iter(),
            translate,
            registry,
            source: String::from("<memory>"),
            index: 0,
        }
    }

    /// Drops up to `n` trees without parsing them; returns how many.
    pub fn skip_unparsed(&mut self, n: usize) -> usize {
        let mut skipped = 0;
        while skipped < n && self.blocks.next().is_some() {
            skipped += 1;
        }
        self.index += skipped;
        skipped
    }
}

impl Iterator for TreeReader {
    type Item = Result<Tree>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.blocks.next()?;
        let index = self.index;
        self.index += 1;
        Some(parse_tree(&block, &self.translate, &self.registry).map_err(|e| match e {
            SplitError::Parse { message, .. } => SplitError::Parse { path: self.source.clone(), index, message },
            other => other,
        }))
    }
}

/// Reads a whole source into memory: `-` is stdin, `*.gz` is gunzipped.
pub fn read_source_text(path: &Path) -> Result<String> {
    let mut content = String::new();
    if path.as_os_str() == "-" {
        io::stdin().read_to_string(&mut content)?;
        return Ok(content);
    }
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SplitError::MissingSource(path.to_path_buf()),
        _ => SplitError::Io(e),
    })?;
    if path.to_string_lossy().ends_with(".gz") {
        MultiGzDecoder::new(file).read_to_string(&mut content)?;
    } else {
        io::BufReader::new(file).read_to_string(&mut content)?;
    }
    Ok(content)
}

/// Bracket comments of a tree string: rooting, weight, and the string with
/// every `[...]` removed.
///
/// BEAST format includes annotations like `:[&rate=0.123]2.45`; only the
/// branch length survives.
fn read_comments(newick: &str) -> (Rooting, Option<f64>, String) {
    let mut rooting = Rooting::Unknown;
    let mut weight = None;
    let mut stripped = String::with_capacity(newick.len());
    let mut comment = String::new();
    let mut depth = 0usize;

    for ch in newick.chars() {
        match ch {
            '[' => {
                depth += 1;
                if depth == 1 {
                    comment.clear();
                    continue;
                }
            }
            ']' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    let c = comment.trim();
                    if c.eq_ignore_ascii_case("&R") {
                        rooting = Rooting::Rooted;
                    } else if c.eq_ignore_ascii_case("&U") {
                        rooting = Rooting::Unrooted;
                    } else if let Some(w) = c.strip_prefix("&W ").or_else(|| c.strip_prefix("&w ")) {
                        weight = parse_weight(w.trim());
                    }
                    continue;
                }
            }
            _ => {}
        }
        if depth > 0 {
            comment.push(ch);
        } else {
            stripped.push(ch);
        }
    }
    (rooting, weight, stripped)
}

/// `0.5` or a fraction such as `1/3`.
fn parse_weight(text: &str) -> Option<f64> {
    match text.split_once('/') {
        Some((num, den)) => {
            let (num, den) = (num.trim().parse::<f64>().ok()?, den.trim().parse::<f64>().ok()?);
            (den != 0.0).then(|| num / den)
        }
        None => text.parse().ok(),
    }
}

fn parse_tree(block: &TreeBlock, translate: &HashMap<String, String>, registry: &TaxonRegistry) -> Result<Tree> {
    let (rooting, weight, newick) = read_comments(&block.body);
    let parse_err = |message: String| SplitError::Parse { path: String::new(), index: 0, message };
    let phylo = PhyloTree::from_newick(newick.trim()).map_err(|e| parse_err(e.to_string()))?;

    let mut tree = Tree::new().with_rooting(rooting);
    tree.weight = weight;
    tree.name = block.name.clone();

    let phylo_root = phylo.get_root().map_err(|e| parse_err(e.to_string()))?;
    // (phylotree node, parent in our arena); the root maps onto our root
    let mut stack: Vec<(usize, Option<NodeId>)> = vec![(phylo_root, None)];
    while let Some((pid, parent)) = stack.pop() {
        let pnode = phylo.get(&pid).map_err(|e| parse_err(e.to_string()))?;
        let name = pnode.name.as_deref().map(clean_label).filter(|n| !n.is_empty());
        let mut node = Node::default().with_length(pnode.parent_edge);

        if pnode.children.is_empty() {
            if let Some(name) = name {
                let label = translate.get(&name).cloned().unwrap_or(name);
                node.taxon = Some(registry.register(&label)?);
            }
        } else {
            node.label = name;
        }

        let id = match parent {
            Some(parent) => tree.add_child(parent, node),
            None => {
                let root = tree.root();
                tree[root] = node;
                root
            }
        };
        // Reverse so children come off the stack in their original order
        for &child in pnode.children.iter().rev() {
            stack.push((child, Some(id)));
        }
    }
    Ok(tree)
}

/// Trims whitespace and surrounding single quotes, un-doubling inner quotes.
fn clean_label(name: &str) -> String {
    let name = name.trim();
    if name.len() >= 2 && name.starts_with('\'') && name.ends_with('\'') {
        name[1..name.len() - 1].replace("''", "'")
    } else {
        name.to_string()
    }
}

/// Splits plain Newick content at `;` outside comments and quotes.
fn split_newick_strings(content: &str) -> Vec<TreeBlock> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quoted = false;
    for ch in content.chars() {
        match ch {
            '\'' if depth == 0 => quoted = !quoted,
            '[' if !quoted => depth += 1,
            ']' if !quoted && depth > 0 => depth -= 1,
            ';' if !quoted && depth == 0 => {
                let body = current.trim();
                if !body.is_empty() {
                    blocks.push(TreeBlock { name: None, body: format!("{body};") });
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    blocks
}

/// `TREE name = [&R] (...);` lines of a NEXUS `TREES` block.
fn collect_tree_blocks(content: &str) -> Vec<TreeBlock> {
    content
        .lines()
        .map(str::trim)
        .skip_while(|line| !is_tree_line(line))
        .take_while(|line| !line.to_ascii_uppercase().starts_with("END;"))
        .filter(|line| is_tree_line(line))
        .filter_map(|line| {
            let (header, body) = line.split_once('=')?;
            let name = header.trim()[4..].trim().trim_start_matches('*').trim();
            Some(TreeBlock {
                name: (!name.is_empty()).then(|| clean_label(name)),
                body: body.trim().to_string(),
            })
        })
        .collect()
}

fn is_tree_line(line: &str) -> bool {
    let upper = line.to_ascii_uppercase();
    upper.starts_with("TREE ") || upper.starts_with("TREE\t")
}

/// `TRANSLATE` table of a NEXUS `TREES` block.
///
/// ```text
/// Translate
///     1 '1959.M.CD.59.ZR59',
///     2 '1960.DRC60A'
/// ;
/// ```
fn parse_translate_block(content: &str) -> HashMap<String, String> {
    let mut table = HashMap::new();
    let mut lines = content
        .lines()
        .map(str::trim)
        .skip_while(|line| !line.to_ascii_uppercase().starts_with("TRANSLATE"))
        .skip(1);
    for line in lines.by_ref() {
        if line.starts_with(';') {
            break;
        }
        let entry = line.trim_end_matches(';').trim_end_matches(',');
        if let Some((id, label)) = entry.trim().split_once(char::is_whitespace) {
            table.insert(id.to_string(), clean_label(label));
        }
        if line.ends_with(';') {
            break;
        }
    }
    table
}

/// Opens `path` for writing: `-` is stdout, `*.gz` is gzip-compressed.
pub fn open_output(path: &Path) -> io::Result<Box<dyn Write>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(BufWriter::new(io::stdout())));
    }
    let file = File::create(path)?;
    if path.to_string_lossy().ends_with(".gz") {
        Ok(Box::new(BufWriter::new(GzEncoder::new(file, Compression::default()))))
    } else {
        Ok(Box::new(BufWriter::new(file)))
    }
}

/// Writes trees as Newick (one per line) or as a NEXUS document.
pub fn write_trees<W: Write>(
    out: &mut W,
    trees: &[Tree],
    format: TreeFormat,
    options: &NewickOptions,
    registry: &TaxonRegistry,
) -> io::Result<()> {
    match format {
        TreeFormat::Newick => {
            for tree in trees {
                writeln!(out, "{}", tree.to_newick(options))?;
            }
        }
        TreeFormat::Nexus => {
            writeln!(out, "#NEXUS\n")?;
            writeln!(out, "BEGIN TAXA;")?;
            writeln!(out, "    DIMENSIONS NTAX={};", registry.len())?;
            writeln!(out, "    TAXLABELS")?;
            for label in registry.labels() {
                writeln!(out, "        {}", crate::tree::escape_label(&label))?;
            }
            writeln!(out, "    ;\nEND;\n")?;
            writeln!(out, "BEGIN TREES;")?;
            for (i, tree) in trees.iter().enumerate() {
                let name = tree.name.clone().unwrap_or_else(|| format!("tree_{}", i + 1));
                writeln!(out, "    TREE {} = {}", crate::tree::escape_label(&name), tree.to_newick(options))?;
            }
            writeln!(out, "END;")?;
        }
    }
    out.flush()
}

/// Writes one row per split: member taxa, count, frequency, and mean edge
/// length / node age where recorded. Most frequent splits first.
pub fn write_split_table<W: Write>(out: &mut W, dist: &SplitDistribution) -> io::Result<()> {
    let registry = dist.registry();
    writeln!(out, "split\tcount\tfrequency\tlength_mean\tage_mean")?;
    for (split, freq) in dist.splits_by_frequency() {
        let taxa = registry.labels_of(&split).iter().join(",");
        let length = dist.edge_length_summary(&split).map(|s| s.mean.to_string()).unwrap_or_default();
        let age = dist.node_age_summary(&split).map(|s| s.mean.to_string()).unwrap_or_default();
        writeln!(out, "{{{taxa}}}\t{}\t{freq}\t{length}\t{age}", dist.count(&split))?;
    }
    out.flush()
}
