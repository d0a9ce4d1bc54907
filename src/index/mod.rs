//! Secondary indexes over the values of one property.
//!
//! An [`IndexSpecification`] is a caller-supplied key extractor. Indexes are
//! keyed by the specification's identity, never by its behaviour: two
//! specifications built from identical closures are two different indexes.
//!
//! Two kinds are maintained by [`IndexCache`]:
//! - **ID** indexes map each key to exactly one value. A duplicate key is an
//!   [`Error::IndexConflict`]; when the conflict appears during incremental
//!   maintenance the index is evicted so the next query rebuilds it.
//! - **General** indexes map each key to every value producing it and never
//!   conflict.

use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::model::{NodeId, NodeRef};
use crate::storage::NodeSource;
use crate::{Error, Result};

/// Bounds every index key must satisfy.
pub trait IndexKey: Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> IndexKey for T where T: Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Identity of an index specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpecId(u64);

static NEXT_SPEC_ID: AtomicU64 = AtomicU64::new(1);

type Extractor<K> = dyn Fn(NodeRef<'_>) -> K + Send + Sync;

/// A key extraction function identifying one secondary index.
pub struct IndexSpecification<K> {
    id: SpecId,
    label: Arc<str>,
    extract: Arc<Extractor<K>>,
}

impl<K: IndexKey> IndexSpecification<K> {
    pub fn new(label: impl Into<Arc<str>>, extract: impl Fn(NodeRef<'_>) -> K + Send + Sync + 'static) -> Self {
        Self {
            id: SpecId(NEXT_SPEC_ID.fetch_add(1, Ordering::Relaxed)),
            label: label.into(),
            extract: Arc::new(extract),
        }
    }

    pub fn id(&self) -> SpecId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Extract the key of `value`, resolved through `source`.
    pub fn key_of(&self, value: NodeId, source: &dyn NodeSource) -> Result<K> {
        let node = source.get(value)?;
        Ok((self.extract)(node))
    }
}

impl IndexSpecification<String> {
    /// Shared index over value names.
    pub fn by_name() -> &'static IndexSpecification<String> {
        static BY_NAME: OnceLock<IndexSpecification<String>> = OnceLock::new();
        BY_NAME.get_or_init(|| IndexSpecification::new("name", |node| node.name().to_string()))
    }
}

impl<K> Clone for IndexSpecification<K> {
    fn clone(&self) -> Self {
        Self { id: self.id, label: Arc::clone(&self.label), extract: Arc::clone(&self.extract) }
    }
}

impl<K> PartialEq for IndexSpecification<K> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<K> Eq for IndexSpecification<K> {}

impl<K> fmt::Debug for IndexSpecification<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexSpecification")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

// ============================================================================
// Scans (used below the indexing threshold)
// ============================================================================

/// ID lookup by linear scan. Checks uniqueness over all values so the
/// outcome matches a materialized ID index.
pub(crate) fn scan_id<K: IndexKey>(
    values: &[NodeId],
    spec: &IndexSpecification<K>,
    key: &K,
    source: &dyn NodeSource,
) -> Result<Option<NodeId>> {
    let index = IdIndex::build(spec, values, source)?;
    Ok(index.entries.get(key).copied())
}

pub(crate) fn scan_all<K: IndexKey>(
    values: &[NodeId],
    spec: &IndexSpecification<K>,
    key: &K,
    source: &dyn NodeSource,
) -> Result<Vec<NodeId>> {
    let mut found = Vec::new();
    for &value in values {
        if spec.key_of(value, source)? == *key {
            found.push(value);
        }
    }
    Ok(found)
}

// ============================================================================
// Concrete indexes
// ============================================================================

/// Type-erased index stored in the cache.
trait ErasedIndex: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// `value` was appended to the container.
    fn insert(&mut self, value: NodeId, source: &dyn NodeSource) -> Result<()>;

    /// One occurrence of `value` left the container; `still_present` if
    /// another occurrence remains.
    fn remove(&mut self, value: NodeId, still_present: bool, source: &dyn NodeSource) -> Result<()>;
}

struct IdIndex<K> {
    spec: IndexSpecification<K>,
    entries: HashMap<K, NodeId>,
}

impl<K: IndexKey> IdIndex<K> {
    fn build(spec: &IndexSpecification<K>, values: &[NodeId], source: &dyn NodeSource) -> Result<Self> {
        let mut index = Self { spec: spec.clone(), entries: HashMap::with_capacity(values.len()) };
        for &value in values {
            index.insert(value, source)?;
        }
        Ok(index)
    }
}

impl<K: IndexKey> ErasedIndex for IdIndex<K> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn insert(&mut self, value: NodeId, source: &dyn NodeSource) -> Result<()> {
        let key = self.spec.key_of(value, source)?;
        match self.entries.get(&key) {
            Some(&existing) if existing != value => Err(Error::IndexConflict { key: format!("{key:?}") }),
            Some(_) => Ok(()),
            None => {
                self.entries.insert(key, value);
                Ok(())
            }
        }
    }

    fn remove(&mut self, value: NodeId, still_present: bool, source: &dyn NodeSource) -> Result<()> {
        if still_present {
            return Ok(());
        }
        let key = self.spec.key_of(value, source)?;
        if self.entries.get(&key) == Some(&value) {
            self.entries.remove(&key);
        } else {
            // The key moved since insertion.
            self.entries.retain(|_, v| *v != value);
        }
        Ok(())
    }
}

struct GeneralIndex<K> {
    spec: IndexSpecification<K>,
    entries: HashMap<K, SmallVec<[NodeId; 2]>>,
}

impl<K: IndexKey> GeneralIndex<K> {
    fn build(spec: &IndexSpecification<K>, values: &[NodeId], source: &dyn NodeSource) -> Result<Self> {
        let mut index = Self { spec: spec.clone(), entries: HashMap::new() };
        for &value in values {
            index.insert(value, source)?;
        }
        Ok(index)
    }
}

impl<K: IndexKey> ErasedIndex for GeneralIndex<K> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn insert(&mut self, value: NodeId, source: &dyn NodeSource) -> Result<()> {
        let key = self.spec.key_of(value, source)?;
        self.entries.entry(key).or_default().push(value);
        Ok(())
    }

    fn remove(&mut self, value: NodeId, _still_present: bool, source: &dyn NodeSource) -> Result<()> {
        let key = self.spec.key_of(value, source)?;
        let removed = match self.entries.get_mut(&key) {
            Some(bucket) => match bucket.iter().position(|v| *v == value) {
                Some(i) => {
                    bucket.remove(i);
                    if bucket.is_empty() {
                        self.entries.remove(&key);
                    }
                    true
                }
                None => false,
            },
            None => false,
        };
        if !removed {
            for bucket in self.entries.values_mut() {
                if let Some(i) = bucket.iter().position(|v| *v == value) {
                    bucket.remove(i);
                    break;
                }
            }
            self.entries.retain(|_, bucket| !bucket.is_empty());
        }
        Ok(())
    }
}

// ============================================================================
// IndexCache
// ============================================================================

/// Lazily built indexes over one container's values.
#[derive(Default)]
pub struct IndexCache {
    id_indexes: HashMap<SpecId, Box<dyn ErasedIndex>>,
    indexes: HashMap<SpecId, Box<dyn ErasedIndex>>,
}

impl IndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.id_indexes.len() + self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_id_index(&self, spec: SpecId) -> bool {
        self.id_indexes.contains_key(&spec)
    }

    pub fn has_index(&self, spec: SpecId) -> bool {
        self.indexes.contains_key(&spec)
    }

    /// Cached ID lookup; `None` if no index for `spec` is built yet.
    pub(crate) fn lookup_id<K: IndexKey>(&self, spec: &IndexSpecification<K>, key: &K) -> Option<Option<NodeId>> {
        let index = self.id_indexes.get(&spec.id)?;
        let index = index.as_any().downcast_ref::<IdIndex<K>>()?;
        Some(index.entries.get(key).copied())
    }

    pub(crate) fn lookup_all<K: IndexKey>(&self, spec: &IndexSpecification<K>, key: &K) -> Option<Vec<NodeId>> {
        let index = self.indexes.get(&spec.id)?;
        let index = index.as_any().downcast_ref::<GeneralIndex<K>>()?;
        Some(index.entries.get(key).map(|b| b.to_vec()).unwrap_or_default())
    }

    /// Build the ID index for `spec` over `values` and cache it.
    /// A conflict leaves nothing cached.
    pub(crate) fn build_id<K: IndexKey>(
        &mut self,
        spec: &IndexSpecification<K>,
        key: &K,
        values: &[NodeId],
        source: &dyn NodeSource,
    ) -> Result<Option<NodeId>> {
        let index = IdIndex::build(spec, values, source)?;
        debug!(spec = spec.label(), entries = index.entries.len(), "built id index");
        let found = index.entries.get(key).copied();
        self.id_indexes.insert(spec.id, Box::new(index));
        Ok(found)
    }

    pub(crate) fn build_general<K: IndexKey>(
        &mut self,
        spec: &IndexSpecification<K>,
        key: &K,
        values: &[NodeId],
        source: &dyn NodeSource,
    ) -> Result<Vec<NodeId>> {
        let index = GeneralIndex::build(spec, values, source)?;
        debug!(spec = spec.label(), keys = index.entries.len(), "built index");
        let found = index.entries.get(key).map(|b| b.to_vec()).unwrap_or_default();
        self.indexes.insert(spec.id, Box::new(index));
        Ok(found)
    }

    /// Maintain every cached index after `value` was appended.
    ///
    /// An index that cannot take the value (a conflicting ID index, or a key
    /// that cannot be extracted) is evicted and rebuilt on demand. Every index
    /// is visited; the first error is returned afterwards.
    pub(crate) fn value_added(&mut self, value: NodeId, source: &dyn NodeSource) -> Result<()> {
        let mut first_error = None;
        maintain(&mut self.indexes, &mut first_error, |index| index.insert(value, source));
        maintain(&mut self.id_indexes, &mut first_error, |index| index.insert(value, source));
        first_error.map_or(Ok(()), Err)
    }

    /// Maintain every cached index after one occurrence of `value` was
    /// dropped, with the same eviction rule as [`value_added`](Self::value_added).
    pub(crate) fn value_removed(&mut self, value: NodeId, still_present: bool, source: &dyn NodeSource) -> Result<()> {
        let mut first_error = None;
        maintain(&mut self.indexes, &mut first_error, |index| index.remove(value, still_present, source));
        maintain(&mut self.id_indexes, &mut first_error, |index| index.remove(value, still_present, source));
        first_error.map_or(Ok(()), Err)
    }

    pub(crate) fn clear(&mut self) {
        if !self.is_empty() {
            trace!(indexes = self.len(), "dropping index cache");
        }
        self.id_indexes.clear();
        self.indexes.clear();
    }
}

fn maintain(
    indexes: &mut HashMap<SpecId, Box<dyn ErasedIndex>>,
    first_error: &mut Option<Error>,
    mut update: impl FnMut(&mut dyn ErasedIndex) -> Result<()>,
) {
    indexes.retain(|spec, index| match update(index.as_mut()) {
        Ok(()) => true,
        Err(err) => {
            debug!(?spec, %err, "evicting index");
            first_error.get_or_insert(err);
            false
        }
    });
}

impl fmt::Debug for IndexCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexCache")
            .field("id_indexes", &self.id_indexes.len())
            .field("indexes", &self.indexes.len())
            .finish()
    }
}
