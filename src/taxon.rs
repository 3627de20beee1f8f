//! Taxon identities and their stable index assignment.
//!
//! # Overview
//! A [`TaxonRegistry`] hands out [`Taxon`] handles in accession order; the
//! position of a taxon in that order is its bit index in every split
//! [`Bitset`]. Registries are passed explicitly (usually as
//! `Arc<TaxonRegistry>`) to every component that derives or compares splits.
//!
//! # Sealing
//! Before a registry is shared with concurrent workers it is sealed. Looking
//! up an existing label still works afterwards, registering a new one fails
//! with [`SplitError::ImmutableRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::bitset::Bitset;
use crate::error::{Result, SplitError};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

struct TaxonEntry {
    label: String,
    index: usize,
    registry: u64,
}

/// An operational taxonomic unit.
///
/// Equality is identity: two handles are equal only if they were issued by
/// the same registration, never because their labels match.
#[derive(Clone)]
pub struct Taxon(Arc<TaxonEntry>);

impl Taxon {
    pub fn label(&self) -> &str {
        &self.0.label
    }

    /// Index assigned by the issuing registry.
    pub fn index(&self) -> usize {
        self.0.index
    }
}

impl PartialEq for Taxon {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Taxon {}

impl Hash for Taxon {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for Taxon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Taxon({}#{})", self.0.label, self.0.index)
    }
}

#[derive(Default)]
struct RegistryInner {
    taxa: Vec<Taxon>,
    by_label: HashMap<String, Taxon>,
    masks: Vec<Bitset>,
}

/// Ordered set of taxa with cached single-taxon bitmasks.
pub struct TaxonRegistry {
    id: u64,
    inner: RwLock<RegistryInner>,
    sealed: AtomicBool,
}

impl TaxonRegistry {
    pub fn new() -> Self {
        TaxonRegistry {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            inner: RwLock::new(RegistryInner::default()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Builds a registry from labels in the given order.
    pub fn from_labels<I, S>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let registry = TaxonRegistry::new();
        for label in labels {
            registry.register(label.as_ref())?;
        }
        Ok(registry)
    }

    /// Returns the taxon for `label`, registering it at the next index if new.
    ///
    /// # Errors
    /// [`SplitError::ImmutableRegistry`] if the label is new and the registry
    /// is sealed.
    pub fn register(&self, label: &str) -> Result<Taxon> {
        if let Some(taxon) = self.get(label) {
            return Ok(taxon);
        }
        if self.is_sealed() {
            return Err(SplitError::ImmutableRegistry(label.to_string()));
        }

        let mut inner = self.inner.write();
        // Another thread may have won the race between the read and write lock.
        if let Some(taxon) = inner.by_label.get(label) {
            return Ok(taxon.clone());
        }
        if self.is_sealed() {
            return Err(SplitError::ImmutableRegistry(label.to_string()));
        }
        let index = inner.taxa.len();
        let taxon = Taxon(Arc::new(TaxonEntry {
            label: label.to_string(),
            index,
            registry: self.id,
        }));
        inner.taxa.push(taxon.clone());
        inner.by_label.insert(label.to_string(), taxon.clone());
        inner.masks.push(Bitset::singleton(index));
        Ok(taxon)
    }

    /// Looks up an already registered label.
    pub fn get(&self, label: &str) -> Option<Taxon> {
        self.inner.read().by_label.get(label).cloned()
    }

    pub fn taxon_at(&self, index: usize) -> Option<Taxon> {
        self.inner.read().taxa.get(index).cloned()
    }

    /// Stable index of `taxon` for the lifetime of this registry.
    pub fn index_of(&self, taxon: &Taxon) -> Result<usize> {
        if taxon.0.registry != self.id {
            return Err(SplitError::UnknownTaxon(taxon.label().to_string()));
        }
        Ok(taxon.index())
    }

    /// Cached `1 << index_of(taxon)`.
    pub fn bitmask_of(&self, taxon: &Taxon) -> Result<Bitset> {
        let index = self.index_of(taxon)?;
        self.inner
            .read()
            .masks
            .get(index)
            .cloned()
            .ok_or_else(|| SplitError::UnknownTaxon(taxon.label().to_string()))
    }

    /// Bitmask with one bit per registered taxon.
    pub fn all_taxa_mask(&self) -> Bitset {
        Bitset::first_n(self.len())
    }

    pub fn len(&self) -> usize {
        self.inner.read().taxa.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Labels in index order.
    pub fn labels(&self) -> Vec<String> {
        self.inner.read().taxa.iter().map(|t| t.label().to_string()).collect()
    }

    /// Labels of the taxa whose bits are set in `mask`.
    pub fn labels_of(&self, mask: &Bitset) -> Vec<String> {
        let inner = self.inner.read();
        mask.iter_ones()
            .filter_map(|i| inner.taxa.get(i).map(|t| t.label().to_string()))
            .collect()
    }

    /// Freezes the taxon set. Idempotent.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// True if both handles are the same registry instance.
    pub fn same_instance(&self, other: &TaxonRegistry) -> bool {
        self.id == other.id
    }
}

impl Default for TaxonRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaxonRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaxonRegistry")
            .field("id", &self.id)
            .field("taxa", &self.len())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}
