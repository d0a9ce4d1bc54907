//! Adaptive storage for the values of one property.
//!
//! A container moves through four tiers as it grows:
//!
//! | Tier | Size | Representation |
//! |------|------|----------------|
//! | `Empty` | 0 | nothing |
//! | `Single` | 1 | the value inline |
//! | `Small` | 2 ..= T+H | `Vec`, lookups by linear scan |
//! | `Indexed` | > T+H | `Vec` + occurrence counts + lazily built indexes |
//!
//! `T` is [`RepositoryConfig::index_threshold`] and `H` is
//! [`RepositoryConfig::index_tolerance`]. An indexed container only drops
//! back to `Small` once it shrinks below T−H, so alternating inserts and
//! removals near the boundary do not rebuild indexes every call.
//!
//! The tier is never observable through values, order or size.

use hashbrown::HashMap;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use tracing::trace;

use super::{NodeSource, RepositoryConfig};
use crate::index::{self, IndexCache, IndexKey, IndexSpecification};
use crate::model::NodeId;
use crate::{Error, Result};

/// Storage tier currently backing a [`ValueContainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Empty,
    Single,
    Small,
    Indexed,
}

#[derive(Debug)]
struct IndexedValues {
    values: Vec<NodeId>,
    counts: HashMap<NodeId, u32>,
    cache: RwLock<IndexCache>,
}

impl IndexedValues {
    fn new(values: Vec<NodeId>) -> Self {
        let mut counts = HashMap::with_capacity(values.len());
        for value in &values {
            *counts.entry(*value).or_insert(0) += 1;
        }
        Self { values, counts, cache: RwLock::new(IndexCache::new()) }
    }

    fn push(&mut self, value: NodeId, source: &dyn NodeSource) -> Result<()> {
        self.values.push(value);
        *self.counts.entry(value).or_insert(0) += 1;
        self.cache.get_mut().value_added(value, source)
    }

    /// Drop one occurrence from the counts; true if another remains.
    fn release(&mut self, value: NodeId) -> bool {
        match self.counts.get_mut(&value) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            _ => {
                self.counts.remove(&value);
                false
            }
        }
    }
}

#[derive(Debug, Default)]
enum Repr {
    #[default]
    Empty,
    Single(NodeId),
    Small(Vec<NodeId>),
    Indexed(Box<IndexedValues>),
}

/// Ordered list of value handles bound to one property of one node.
#[derive(Debug, Default)]
pub struct ValueContainer {
    repr: Repr,
}

fn promote_above(config: &RepositoryConfig) -> usize {
    config.index_threshold + config.index_tolerance
}

fn demote_below(config: &RepositoryConfig) -> usize {
    config.index_threshold.saturating_sub(config.index_tolerance)
}

/// Representation for a list that is not (or no longer) indexed.
fn unindexed(mut values: Vec<NodeId>) -> Repr {
    match values.len() {
        0 => Repr::Empty,
        1 => Repr::Single(values[0]),
        _ => {
            values.shrink_to_fit();
            Repr::Small(values)
        }
    }
}

impl ValueContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Container holding `values`, in the tier their count calls for.
    pub fn from_values(values: &[NodeId], config: &RepositoryConfig) -> Self {
        let repr = if values.len() > promote_above(config) {
            Repr::Indexed(Box::new(IndexedValues::new(values.to_vec())))
        } else {
            unindexed(values.to_vec())
        };
        Self { repr }
    }

    pub fn tier(&self) -> Tier {
        match self.repr {
            Repr::Empty => Tier::Empty,
            Repr::Single(_) => Tier::Single,
            Repr::Small(_) => Tier::Small,
            Repr::Indexed(_) => Tier::Indexed,
        }
    }

    /// Values in insertion order.
    pub fn values(&self) -> &[NodeId] {
        match &self.repr {
            Repr::Empty => &[],
            Repr::Single(value) => std::slice::from_ref(value),
            Repr::Small(values) => values,
            Repr::Indexed(indexed) => &indexed.values,
        }
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.repr, Repr::Empty)
    }

    pub fn contains(&self, value: NodeId) -> bool {
        match &self.repr {
            Repr::Indexed(indexed) => indexed.counts.contains_key(&value),
            _ => self.values().contains(&value),
        }
    }

    /// The sole value, `None` if empty.
    ///
    /// Fails with [`Error::Cardinality`] when more than one value is held;
    /// never picks the first.
    pub fn one_value(&self) -> Result<Option<NodeId>> {
        match self.values() {
            [] => Ok(None),
            [value] => Ok(Some(*value)),
            values => Err(Error::Cardinality { count: values.len() }),
        }
    }

    /// Like [`one_value`](Self::one_value) but an empty container is also a
    /// cardinality error.
    pub fn only_value(&self) -> Result<NodeId> {
        match self.values() {
            [value] => Ok(*value),
            values => Err(Error::Cardinality { count: values.len() }),
        }
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Append `value`.
    ///
    /// An [`Error::IndexConflict`] means a cached ID index no longer holds;
    /// the value is appended regardless and the index has been dropped.
    pub fn add_value(&mut self, value: NodeId, source: &dyn NodeSource) -> Result<()> {
        match &mut self.repr {
            Repr::Empty => self.repr = Repr::Single(value),
            Repr::Single(first) => self.repr = Repr::Small(vec![*first, value]),
            Repr::Small(values) => {
                values.push(value);
                self.promote_if_needed(source.config());
            }
            Repr::Indexed(indexed) => return indexed.push(value, source),
        }
        Ok(())
    }

    /// Append every value of `batch` in order.
    ///
    /// All values are appended even if index maintenance fails; the first
    /// failure is returned.
    pub fn add_values(&mut self, batch: &[NodeId], source: &dyn NodeSource) -> Result<()> {
        match &mut self.repr {
            Repr::Indexed(indexed) => {
                let mut first_error = None;
                for value in batch {
                    if let Err(err) = indexed.push(*value, source) {
                        first_error.get_or_insert(err);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
            _ => {
                let mut values = std::mem::take(&mut self.repr).into_vec();
                values.extend_from_slice(batch);
                self.repr = unindexed(values);
                self.promote_if_needed(source.config());
                Ok(())
            }
        }
    }

    /// Remove the first occurrence of `value`. Returns whether one was found.
    pub fn remove_value(&mut self, value: NodeId, source: &dyn NodeSource) -> Result<bool> {
        match &mut self.repr {
            Repr::Empty => Ok(false),
            Repr::Single(only) => {
                if *only != value {
                    return Ok(false);
                }
                self.repr = Repr::Empty;
                Ok(true)
            }
            Repr::Small(values) => {
                let Some(position) = values.iter().position(|v| *v == value) else {
                    return Ok(false);
                };
                values.remove(position);
                if values.len() == 1 {
                    self.repr = Repr::Single(values[0]);
                }
                Ok(true)
            }
            Repr::Indexed(indexed) => {
                let Some(position) = indexed.values.iter().position(|v| *v == value) else {
                    return Ok(false);
                };
                indexed.values.remove(position);
                let still_present = indexed.release(value);
                let maintained = indexed.cache.get_mut().value_removed(value, still_present, source);
                self.demote_if_needed(source.config());
                maintained.map(|()| true)
            }
        }
    }

    /// Replace the value at `offset`.
    pub fn set_value(&mut self, offset: usize, value: NodeId, source: &dyn NodeSource) -> Result<()> {
        let len = self.len();
        match &mut self.repr {
            _ if offset >= len => return Err(Error::OutOfBounds { offset, len }),
            Repr::Empty => {}
            Repr::Single(only) => *only = value,
            Repr::Small(values) => values[offset] = value,
            Repr::Indexed(indexed) => {
                let old = std::mem::replace(&mut indexed.values[offset], value);
                if old == value {
                    return Ok(());
                }
                let still_present = indexed.release(old);
                *indexed.counts.entry(value).or_insert(0) += 1;
                let cache = indexed.cache.get_mut();
                let removed = cache.value_removed(old, still_present, source);
                let added = cache.value_added(value, source);
                return removed.and(added);
            }
        }
        Ok(())
    }

    /// Independent copy with identical content. Indexes are not carried over;
    /// the copy rebuilds them on demand.
    pub fn copy(&self) -> Self {
        let repr = match &self.repr {
            Repr::Empty => Repr::Empty,
            Repr::Single(value) => Repr::Single(*value),
            Repr::Small(values) => Repr::Small(values.clone()),
            Repr::Indexed(indexed) => Repr::Indexed(Box::new(IndexedValues {
                values: indexed.values.clone(),
                counts: indexed.counts.clone(),
                cache: RwLock::new(IndexCache::new()),
            })),
        };
        Self { repr }
    }

    // ========================================================================
    // Keyed lookups
    // ========================================================================

    /// The unique value whose key under `spec` is `key`.
    ///
    /// Fails with [`Error::IndexConflict`] if two values share any key. The
    /// cache is bypassed when `source` does not cache indexes.
    pub fn value_by_id_index<K: IndexKey>(
        &self,
        spec: &IndexSpecification<K>,
        key: &K,
        source: &dyn NodeSource,
    ) -> Result<Option<NodeId>> {
        match &self.repr {
            Repr::Empty => Ok(None),
            Repr::Single(value) => Ok((spec.key_of(*value, source)? == *key).then_some(*value)),
            Repr::Small(values) => index::scan_id(values, spec, key, source),
            Repr::Indexed(indexed) if !source.caches_indexes() => {
                index::scan_id(&indexed.values, spec, key, source)
            }
            Repr::Indexed(indexed) => {
                let cache = indexed.cache.upgradable_read();
                if let Some(found) = cache.lookup_id(spec, key) {
                    return Ok(found);
                }
                let mut cache = RwLockUpgradableReadGuard::upgrade(cache);
                cache.build_id(spec, key, &indexed.values, source)
            }
        }
    }

    /// Every value whose key under `spec` is `key`, in insertion order for
    /// unindexed tiers.
    pub fn values_by_index<K: IndexKey>(
        &self,
        spec: &IndexSpecification<K>,
        key: &K,
        source: &dyn NodeSource,
    ) -> Result<Vec<NodeId>> {
        match &self.repr {
            Repr::Indexed(indexed) if source.caches_indexes() => {
                let cache = indexed.cache.upgradable_read();
                if let Some(found) = cache.lookup_all(spec, key) {
                    return Ok(found);
                }
                let mut cache = RwLockUpgradableReadGuard::upgrade(cache);
                cache.build_general(spec, key, &indexed.values, source)
            }
            _ => index::scan_all(self.values(), spec, key, source),
        }
    }

    /// Number of indexes currently cached (always 0 below the indexed tier).
    pub fn cached_index_count(&self) -> usize {
        match &self.repr {
            Repr::Indexed(indexed) => indexed.cache.read().len(),
            _ => 0,
        }
    }

    // ========================================================================
    // Tier transitions
    // ========================================================================

    fn promote_if_needed(&mut self, config: &RepositoryConfig) {
        let Repr::Small(values) = &mut self.repr else {
            return;
        };
        if values.len() > promote_above(config) {
            trace!(len = values.len(), "promoting value container to indexed tier");
            let values = std::mem::take(values);
            self.repr = Repr::Indexed(Box::new(IndexedValues::new(values)));
        }
    }

    fn demote_if_needed(&mut self, config: &RepositoryConfig) {
        let Repr::Indexed(indexed) = &mut self.repr else {
            return;
        };
        if indexed.values.len() < demote_below(config) {
            trace!(len = indexed.values.len(), "demoting value container from indexed tier");
            let values = std::mem::take(&mut indexed.values);
            self.repr = unindexed(values);
        }
    }
}

impl Repr {
    fn into_vec(self) -> Vec<NodeId> {
        match self {
            Repr::Empty => Vec::new(),
            Repr::Single(value) => vec![value],
            Repr::Small(values) => values,
            Repr::Indexed(indexed) => indexed.values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Repository;
    use crate::storage::GraphWrite;
    use proptest::prelude::*;

    fn small_repo() -> Repository {
        Repository::with_config(RepositoryConfig {
            index_threshold: 5,
            index_tolerance: 2,
            ..RepositoryConfig::default()
        })
        .unwrap()
    }

    fn ids(range: std::ops::Range<u64>) -> Vec<NodeId> {
        range.map(NodeId).collect()
    }

    #[test]
    fn test_tiers_follow_hysteresis() {
        let repo = small_repo();
        let mut c = ValueContainer::new();
        assert_eq!(c.tier(), Tier::Empty);
        c.add_value(NodeId(0), &repo).unwrap();
        assert_eq!(c.tier(), Tier::Single);
        c.add_values(&ids(1..7), &repo).unwrap();
        assert_eq!((c.len(), c.tier()), (7, Tier::Small));
        c.add_value(NodeId(7), &repo).unwrap();
        assert_eq!((c.len(), c.tier()), (8, Tier::Indexed));

        // Stays indexed until below threshold - tolerance.
        for v in [7, 6, 5, 4, 3] {
            assert!(c.remove_value(NodeId(v), &repo).unwrap());
            assert_eq!(c.tier(), Tier::Indexed, "len {}", c.len());
        }
        assert!(c.remove_value(NodeId(2), &repo).unwrap());
        assert_eq!((c.len(), c.tier()), (2, Tier::Small));
        assert!(c.remove_value(NodeId(1), &repo).unwrap());
        assert_eq!(c.tier(), Tier::Single);
        assert!(c.remove_value(NodeId(0), &repo).unwrap());
        assert_eq!(c.tier(), Tier::Empty);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let repo = small_repo();
        let mut c = ValueContainer::from_values(&ids(0..3), repo.config());
        assert!(!c.remove_value(NodeId(42), &repo).unwrap());
        assert_eq!(c.values(), &ids(0..3)[..]);
    }

    #[test]
    fn test_remove_first_occurrence_only() {
        let repo = small_repo();
        let mut c = ValueContainer::from_values(&[NodeId(1), NodeId(2), NodeId(1)], repo.config());
        c.remove_value(NodeId(1), &repo).unwrap();
        assert_eq!(c.values(), &[NodeId(2), NodeId(1)]);
    }

    #[test]
    fn test_set_value_bounds() {
        let repo = small_repo();
        let mut c = ValueContainer::from_values(&ids(0..2), repo.config());
        c.set_value(1, NodeId(9), &repo).unwrap();
        assert_eq!(c.values(), &[NodeId(0), NodeId(9)]);
        let err = c.set_value(2, NodeId(9), &repo).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { offset: 2, len: 2 }));
        let err = ValueContainer::new().set_value(0, NodeId(1), &repo).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { offset: 0, len: 0 }));
    }

    #[test]
    fn test_copy_shares_nothing() {
        let repo = small_repo();
        let original = ValueContainer::from_values(&ids(0..10), repo.config());
        assert_eq!(original.tier(), Tier::Indexed);
        let mut copy = original.copy();
        copy.remove_value(NodeId(0), &repo).unwrap();
        copy.add_value(NodeId(99), &repo).unwrap();
        assert_eq!(original.values(), &ids(0..10)[..]);
        assert!(original.contains(NodeId(0)));
        assert!(!copy.contains(NodeId(0)));
    }

    #[test]
    fn test_one_value_and_only_value() {
        let repo = small_repo();
        let empty = ValueContainer::new();
        assert_eq!(empty.one_value().unwrap(), None);
        assert!(matches!(empty.only_value(), Err(Error::Cardinality { count: 0 })));

        let single = ValueContainer::from_values(&[NodeId(3)], repo.config());
        assert_eq!(single.one_value().unwrap(), Some(NodeId(3)));
        assert_eq!(single.only_value().unwrap(), NodeId(3));

        let many = ValueContainer::from_values(&ids(0..9), repo.config());
        assert!(matches!(many.one_value(), Err(Error::Cardinality { count: 9 })));
        assert!(matches!(many.only_value(), Err(Error::Cardinality { count: 9 })));
    }

    #[test]
    fn test_id_lookup_below_threshold_checks_uniqueness() {
        let mut repo = small_repo();
        let a = repo.new_node("a", None, None, true);
        let b = repo.new_node("b", None, None, true);
        let a2 = repo.new_node("a", None, None, true);
        let spec = IndexSpecification::by_name();

        let c = ValueContainer::from_values(&[a, b], repo.config());
        assert_eq!(c.value_by_id_index(spec, &"b".to_string(), &repo).unwrap(), Some(b));
        assert_eq!(c.value_by_id_index(spec, &"z".to_string(), &repo).unwrap(), None);

        let c = ValueContainer::from_values(&[a, b, a2], repo.config());
        let err = c.value_by_id_index(spec, &"b".to_string(), &repo).unwrap_err();
        assert!(matches!(err, Error::IndexConflict { ref key } if key == "\"a\""));
        assert_eq!(c.values_by_index(spec, &"a".to_string(), &repo).unwrap(), vec![a, a2]);
    }

    #[test]
    fn test_failed_maintenance_evicts_every_index() {
        let mut repo = small_repo();
        let nodes: Vec<NodeId> = (0..10).map(|i| repo.new_node(format!("n{i}"), None, None, true)).collect();
        let spec = IndexSpecification::by_name();
        let missing = NodeId(999);

        let mut c = ValueContainer::from_values(&nodes, repo.config());
        let build = |c: &ValueContainer| {
            assert_eq!(c.values_by_index(spec, &"n2".to_string(), &repo).unwrap(), vec![nodes[2]]);
            assert_eq!(c.value_by_id_index(spec, &"n3".to_string(), &repo).unwrap(), Some(nodes[3]));
            assert_eq!(c.cached_index_count(), 2);
        };

        build(&c);
        assert!(matches!(c.add_value(missing, &repo), Err(Error::NotFound(_))));
        assert_eq!(c.len(), 11);
        assert_eq!(c.cached_index_count(), 0);
        assert!(c.remove_value(missing, &repo).unwrap());

        build(&c);
        assert!(matches!(c.set_value(0, missing, &repo), Err(Error::NotFound(_))));
        assert_eq!(c.cached_index_count(), 0);
        c.set_value(0, nodes[0], &repo).unwrap();

        build(&c);
        assert_eq!(c.values(), &nodes[..]);
    }

    fn strategy_len() -> impl Strategy<Value = usize> {
        0usize..24
    }

    proptest! {
        #[test]
        fn prop_insertion_order_survives_every_tier(n in strategy_len()) {
            let repo = small_repo();
            let mut c = ValueContainer::new();
            for (i, v) in ids(0..n as u64).into_iter().enumerate() {
                c.add_value(v, &repo).unwrap();
                prop_assert_eq!(c.values(), &ids(0..(i as u64 + 1))[..]);
            }
            prop_assert_eq!(c.len(), n);
        }

        #[test]
        fn prop_tier_is_not_observable(values in prop::collection::vec(0u64..6, 0..5)) {
            let repo = small_repo();
            let values: Vec<NodeId> = values.into_iter().map(NodeId).collect();

            let mut small = ValueContainer::new();
            small.add_values(&values, &repo).unwrap();

            // Pad past the promotion point, then trim the padding back off.
            let padding = ids(100..110);
            let mut indexed = ValueContainer::new();
            indexed.add_values(&padding, &repo).unwrap();
            prop_assert_eq!(indexed.tier(), Tier::Indexed);
            indexed.add_values(&values, &repo).unwrap();
            for p in &padding {
                indexed.remove_value(*p, &repo).unwrap();
            }

            prop_assert_eq!(small.values(), indexed.values());
            prop_assert_eq!(small.len(), indexed.len());
            match (small.one_value(), indexed.one_value()) {
                (Ok(a), Ok(b)) => prop_assert_eq!(a, b),
                (Err(Error::Cardinality { count: a }), Err(Error::Cardinality { count: b })) => prop_assert_eq!(a, b),
                other => prop_assert!(false, "diverged: {:?}", other),
            }
            for v in 0..6 {
                prop_assert_eq!(small.contains(NodeId(v)), indexed.contains(NodeId(v)));
            }
        }

        #[test]
        fn prop_cardinality_law(n in strategy_len()) {
            let repo = small_repo();
            let c = ValueContainer::from_values(&ids(0..n as u64), repo.config());
            match n {
                1 => prop_assert_eq!(c.only_value().unwrap(), NodeId(0)),
                _ => prop_assert!(matches!(c.only_value(), Err(Error::Cardinality { count }) if count == n), "expected Cardinality error for n = {}", n),
            }
        }
    }
}
