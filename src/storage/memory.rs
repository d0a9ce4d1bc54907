//! In-memory repository.
//!
//! The repository is the arena owning every committed node. Nodes refer to
//! each other through [`NodeId`] handles only, so cyclic graphs need no
//! reference counting.
//!
//! ## Concurrency
//!
//! - Structural mutation takes `&mut self`: one writer at a time.
//! - Reads and compile-state updates take `&self` and may run on any number
//!   of threads at once.
//! - A [`TxScope`] borrows the repository shared, so readers outside the
//!   transaction keep seeing committed state while it runs.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, trace, warn};

use super::{GraphWrite, NodeSource, RepositoryConfig};
use crate::model::{
    CompileStateSet, InstanceNode, NodeId, NodeKind, NodeRef, NodeState, Primitive, PropertyTable,
    SourceInformation,
};
use crate::traversal;
use crate::tx::{TransactionLog, TxMode, TxScope};
use crate::{Error, Result};

const ANONYMOUS_NAME_PREFIX: &str = "@_";
/// Width of `i32::MAX` in base 32.
const ANONYMOUS_PADDING_LENGTH: usize = 7;
const ANONYMOUS_REPLACEMENT: &str = "Anonymous_StripedId";

static NEXT_REPOSITORY: AtomicU64 = AtomicU64::new(1);

/// True for names produced by the anonymous naming sequence.
pub fn is_anonymous_instance_name(name: &str) -> bool {
    name.len() >= ANONYMOUS_NAME_PREFIX.len() + ANONYMOUS_PADDING_LENGTH && name.starts_with(ANONYMOUS_NAME_PREFIX)
}

/// Masks anonymous names so renderings stay stable across runs.
pub fn possibly_replace_anonymous_id(name: &str) -> &str {
    if is_anonymous_instance_name(name) { ANONYMOUS_REPLACEMENT } else { name }
}

fn anonymous_name(counter: u64) -> String {
    const DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";
    let mut digits = Vec::with_capacity(ANONYMOUS_PADDING_LENGTH);
    let mut n = counter;
    loop {
        digits.push(DIGITS[(n % 32) as usize]);
        n /= 32;
        if n == 0 {
            break;
        }
    }
    let mut name = String::with_capacity(ANONYMOUS_NAME_PREFIX.len() + digits.len().max(ANONYMOUS_PADDING_LENGTH));
    name.push_str(ANONYMOUS_NAME_PREFIX);
    for _ in digits.len()..ANONYMOUS_PADDING_LENGTH {
        name.push('0');
    }
    name.extend(digits.iter().rev().map(|&d| d as char));
    name
}

// ============================================================================
// Repository
// ============================================================================

/// Arena of instance nodes plus the registries around them.
pub struct Repository {
    instance: u64,
    config: RepositoryConfig,
    pub(crate) nodes: HashMap<NodeId, InstanceNode>,
    pub(crate) top_levels: BTreeMap<String, NodeId>,
    exclusion: HashSet<NodeId>,
    next_id: AtomicU64,
    next_anonymous_id: AtomicU64,
    next_tx_id: AtomicU64,
    cached_true: Option<NodeId>,
    cached_false: Option<NodeId>,
    string_cache: HashMap<String, NodeId>,
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository {
    pub fn new() -> Self {
        Self::build(RepositoryConfig::default())
    }

    pub fn with_config(config: RepositoryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: RepositoryConfig) -> Self {
        Self {
            instance: NEXT_REPOSITORY.fetch_add(1, Ordering::Relaxed),
            config,
            nodes: HashMap::new(),
            top_levels: BTreeMap::new(),
            exclusion: HashSet::new(),
            next_id: AtomicU64::new(0),
            next_anonymous_id: AtomicU64::new(0),
            next_tx_id: AtomicU64::new(1),
            cached_true: None,
            cached_false: None,
            string_cache: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub(crate) fn reserve_id(&self) -> NodeId {
        NodeId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // ========================================================================
    // Counters
    // ========================================================================

    /// The id the next created node will receive.
    pub fn id_counter(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    pub fn anonymous_id_counter(&self) -> u64 {
        self.next_anonymous_id.load(Ordering::Relaxed)
    }

    /// Restore both counters, e.g. after loading a serialized graph.
    ///
    /// Counters only move forward: a value below the current one could hand
    /// out an id (or anonymous name) that is already in use, including ids
    /// reserved by open transactions.
    pub fn set_counters(&self, id_counter: u64, anonymous_id_counter: u64) -> Result<()> {
        let current = self.id_counter();
        if id_counter < current {
            return Err(Error::ConstraintViolation(format!(
                "id counter {id_counter} is below {current} and would reuse node ids"
            )));
        }
        let current = self.anonymous_id_counter();
        if anonymous_id_counter < current {
            return Err(Error::ConstraintViolation(format!(
                "anonymous id counter {anonymous_id_counter} is below {current} and would reuse names"
            )));
        }
        self.next_id.fetch_max(id_counter, Ordering::Relaxed);
        self.next_anonymous_id.fetch_max(anonymous_id_counter, Ordering::Relaxed);
        Ok(())
    }

    /// Drop every node, registry and cache and reset the counters.
    ///
    /// Transactions opened before the call can no longer be used.
    pub fn clear(&mut self) {
        debug!(nodes = self.nodes.len(), "clearing repository");
        self.instance = NEXT_REPOSITORY.fetch_add(1, Ordering::Relaxed);
        self.nodes.clear();
        self.top_levels.clear();
        self.exclusion.clear();
        self.next_id.store(0, Ordering::Relaxed);
        self.next_anonymous_id.store(0, Ordering::Relaxed);
        self.cached_true = None;
        self.cached_false = None;
        self.string_cache.clear();
    }

    // ========================================================================
    // Top levels and exclusion
    // ========================================================================

    /// Registered top-level elements, ordered by name.
    pub fn top_levels(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.top_levels.values().copied()
    }

    pub fn set_exclusion_set(&mut self, excluded: impl IntoIterator<Item = NodeId>) {
        self.exclusion = excluded.into_iter().collect();
    }

    pub fn exclusion_set(&self) -> &HashSet<NodeId> {
        &self.exclusion
    }

    // ========================================================================
    // Primitives
    // ========================================================================

    /// The shared node for `value`; created on first use.
    pub fn new_boolean(&mut self, value: bool) -> Result<NodeId> {
        let cached = if value { self.cached_true } else { self.cached_false };
        if let Some(id) = cached {
            return Ok(id);
        }
        let id = self.new_primitive(Primitive::Boolean(value))?;
        if value {
            self.cached_true = Some(id);
        } else {
            self.cached_false = Some(id);
        }
        Ok(id)
    }

    pub fn new_integer(&mut self, value: i64) -> Result<NodeId> {
        self.new_primitive(Primitive::Integer(value))
    }

    pub fn new_float(&mut self, value: f64) -> Result<NodeId> {
        self.new_primitive(Primitive::Float(value))
    }

    /// A string node, shared with an earlier [`new_string_cached`](Self::new_string_cached)
    /// call for the same text if there was one.
    pub fn new_string(&mut self, value: &str) -> Result<NodeId> {
        match self.string_cache.get(value) {
            Some(&id) => Ok(id),
            None => self.new_primitive(Primitive::String(value.to_string())),
        }
    }

    /// A string node registered in the string cache.
    pub fn new_string_cached(&mut self, value: &str) -> Result<NodeId> {
        if let Some(&id) = self.string_cache.get(value) {
            return Ok(id);
        }
        let id = self.new_primitive(Primitive::String(value.to_string()))?;
        self.string_cache.insert(value.to_string(), id);
        Ok(id)
    }

    // ========================================================================
    // Compile state
    // ========================================================================

    fn committed(&self, id: NodeId) -> Result<&InstanceNode> {
        self.nodes.get(&id).ok_or_else(|| Error::NotFound(format!("node {id}")))
    }

    pub fn has_compile_state(&self, id: NodeId, state: CompileStateSet) -> Result<bool> {
        Ok(self.committed(id)?.state.compile_states.has(state))
    }

    pub fn compile_states(&self, id: NodeId) -> Result<CompileStateSet> {
        Ok(self.committed(id)?.state.compile_states.get())
    }

    pub fn add_compile_state(&self, id: NodeId, state: CompileStateSet) -> Result<()> {
        self.committed(id)?.state.compile_states.add(state);
        Ok(())
    }

    pub fn remove_compile_state(&self, id: NodeId, state: CompileStateSet) -> Result<()> {
        self.committed(id)?.state.compile_states.remove(state);
        Ok(())
    }

    pub fn add_compile_states(&self, id: NodeId, states: impl IntoIterator<Item = CompileStateSet>) -> Result<()> {
        self.committed(id)?.state.compile_states.add_states(states);
        Ok(())
    }

    pub fn remove_compile_states(&self, id: NodeId, states: impl IntoIterator<Item = CompileStateSet>) -> Result<()> {
        self.committed(id)?.state.compile_states.remove_states(states);
        Ok(())
    }

    /// Unconditional overwrite; see [`CompileStateTracker::set_from`](crate::model::CompileStateTracker::set_from).
    pub fn set_compile_states_from(&self, id: NodeId, snapshot: CompileStateSet) -> Result<()> {
        self.committed(id)?.state.compile_states.set_from(snapshot);
        Ok(())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn new_transaction(&self, mode: TxMode) -> TransactionLog {
        let id = self.next_tx_id.fetch_add(1, Ordering::Relaxed);
        TransactionLog::new(id, mode, self.instance)
    }

    /// A read/write view that routes mutations into `log`.
    pub fn in_transaction<'r>(&'r self, log: &'r mut TransactionLog) -> Result<TxScope<'r>> {
        log.check_usable(self.instance)?;
        Ok(TxScope::new(self, log))
    }

    /// Apply `log`: created nodes join the arena, shadowed states replace
    /// the live ones, staged top levels are registered.
    ///
    /// Top-level conflicts are checked before anything is applied.
    pub fn commit(&mut self, log: &mut TransactionLog) -> Result<()> {
        log.check_usable(self.instance)?;
        if !log.is_committable() {
            return Err(Error::TxError("Transaction is not committable".into()));
        }
        for (name, id) in &log.top_levels {
            if matches!(self.top_levels.get(name), Some(existing) if existing != id) {
                return Err(Error::ConstraintViolation(format!(
                    "A top level element already exists with the name \"{name}\""
                )));
            }
        }

        let created = log.new_nodes.len();
        let shadowed = log.shadows.len();
        self.nodes.extend(log.new_nodes.drain());
        for (id, state) in log.shadows.drain() {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.state = state;
            }
        }
        self.top_levels.append(&mut log.top_levels);
        log.mark_committed();
        debug!(tx = log.id().0, created, shadowed, "committed transaction");
        Ok(())
    }

    /// Discard `log`; no committed node changes.
    pub fn rollback(&self, log: &mut TransactionLog) -> Result<()> {
        log.check_usable(self.instance)?;
        log.rollback()
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Validate every top-level element with one shared done set.
    pub fn validate(&self) -> Result<()> {
        info!(top_levels = self.top_levels.len(), "starting repository validation");
        let mut done = HashSet::new();
        for id in self.top_levels() {
            traversal::validate(self, id, &mut done)?;
        }
        info!(validated = done.len(), "finished repository validation");
        Ok(())
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("nodes", &self.nodes.len())
            .field("top_levels", &self.top_levels.len())
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// NodeSource / GraphWrite
// ============================================================================

impl NodeSource for Repository {
    fn node_ref(&self, id: NodeId) -> Option<NodeRef<'_>> {
        self.nodes.get(&id).map(|node| NodeRef::new(node, &node.state, self))
    }

    fn top_level(&self, name: &str) -> Option<NodeId> {
        self.top_levels.get(name).copied()
    }

    fn is_excluded(&self, id: NodeId) -> bool {
        self.exclusion.contains(&id)
    }

    fn config(&self) -> &RepositoryConfig {
        &self.config
    }
}

impl GraphWrite for Repository {
    fn create_node(
        &mut self,
        name: String,
        classifier: Option<NodeId>,
        source: Option<SourceInformation>,
        persistent: bool,
        kind: NodeKind,
    ) -> NodeId {
        loop {
            let id = self.reserve_id();
            if let Entry::Vacant(slot) = self.nodes.entry(id) {
                slot.insert(InstanceNode::new(id, kind, persistent, NodeState::new(name, classifier, source)));
                return id;
            }
            warn!(%id, "skipping occupied node id");
        }
    }

    fn next_anonymous_name(&self) -> String {
        anonymous_name(self.next_anonymous_id.fetch_add(1, Ordering::Relaxed))
    }

    fn state_mut(&mut self, id: NodeId) -> Result<&mut NodeState> {
        self.nodes
            .get_mut(&id)
            .map(|node| &mut *node.state)
            .ok_or_else(|| Error::NotFound(format!("node {id}")))
    }

    fn update_table<R>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut PropertyTable, &dyn NodeSource) -> Result<R>,
    ) -> Result<R> {
        let mut table = std::mem::take(&mut self.state_mut(id)?.table);
        let result = f(&mut table, &*self);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.state.table = table;
        }
        result
    }

    fn get_or_add_top_level(&mut self, id: NodeId) -> Result<NodeId> {
        let name = self.get(id)?.name().to_string();
        let registered = *self.top_levels.entry(name).or_insert_with_key(|name| {
            trace!(%name, %id, "registered top level");
            id
        });
        Ok(registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PropertyPath;

    #[test]
    fn test_anonymous_names() {
        assert_eq!(anonymous_name(0), "@_0000000");
        assert_eq!(anonymous_name(33), "@_0000011");
        assert_eq!(anonymous_name(i32::MAX as u64), "@_1vvvvvv");
        assert_eq!(anonymous_name(1 << 35), "@_10000000");
        assert!(is_anonymous_instance_name("@_0000000"));
        assert!(!is_anonymous_instance_name("@_00"));
        assert!(!is_anonymous_instance_name("Class"));
        assert_eq!(possibly_replace_anonymous_id("@_000000a"), "Anonymous_StripedId");
        assert_eq!(possibly_replace_anonymous_id("Class"), "Class");
    }

    #[test]
    fn test_factory_assigns_unique_ids() {
        let mut repo = Repository::new();
        let a = repo.new_node("A", None, None, true);
        let b = repo.new_ephemeral_node("B", None, None);
        let anon = repo.new_anonymous_node(None, Some(a), true);
        assert_eq!((a, b, anon), (NodeId(0), NodeId(1), NodeId(2)));
        assert!(repo.get(a).unwrap().is_persistent());
        assert!(!repo.get(b).unwrap().is_persistent());
        assert_eq!(repo.get(anon).unwrap().name(), "@_0000000");
        assert_eq!(repo.id_counter(), 3);
        assert_eq!(repo.anonymous_id_counter(), 1);
    }

    #[test]
    fn test_top_level_conflict() {
        let mut repo = Repository::new();
        let a = repo.new_node("Class", None, None, true);
        let b = repo.new_node("Class", None, None, true);
        repo.add_top_level(a).unwrap();
        repo.add_top_level(a).unwrap();
        assert!(matches!(repo.add_top_level(b), Err(Error::ConstraintViolation(_))));
        assert_eq!(repo.get_or_add_top_level(b).unwrap(), a);
        assert_eq!(repo.top_level("Class"), Some(a));
        assert!(repo.is_top_level(a));
        assert!(!repo.is_top_level(b));
    }

    #[test]
    fn test_get_or_create_top_level_updates_source() {
        let mut repo = Repository::new();
        let first = repo.get_or_create_top_level("String", None).unwrap();
        let span = SourceInformation::spanning("m3.pure", 1, 1, 1, 6);
        let second = repo.get_or_create_top_level("String", Some(span.clone())).unwrap();
        assert_eq!(first, second);
        assert_eq!(repo.get(first).unwrap().source_information(), Some(&span));
    }

    #[test]
    fn test_primitive_caches() {
        let mut repo = Repository::new();
        let t1 = repo.new_boolean(true).unwrap();
        let t2 = repo.new_boolean(true).unwrap();
        let f = repo.new_boolean(false).unwrap();
        assert_eq!(t1, t2);
        assert_ne!(t1, f);

        let loose = repo.new_string("x").unwrap();
        let cached = repo.new_string_cached("x").unwrap();
        assert_ne!(loose, cached);
        assert_eq!(repo.new_string("x").unwrap(), cached);

        let node = repo.get(cached).unwrap();
        assert!(node.is_primitive());
        assert_eq!(node.name(), "x");
        let string_type = repo.top_level("String").unwrap();
        assert_eq!(node.classifier(), Some(string_type));
    }

    #[test]
    fn test_resolve_paths() {
        let mut repo = Repository::new();
        let root = repo.new_node("Root", None, None, true);
        repo.add_top_level(root).unwrap();
        let child = repo.new_node("child", None, None, true);
        let leaf = repo.new_node("leaf", None, None, true);
        repo.add_key_value(root, &"children".into(), child).unwrap();
        repo.add_key_value(child, &"children".into(), leaf).unwrap();

        let path = |parts: &[&str]| parts.iter().map(|p| p.to_string()).collect::<Vec<_>>();
        assert_eq!(repo.resolve(&path(&["Root"])).unwrap(), root);
        assert_eq!(
            repo.resolve(&path(&["Root", "children", "child", "children", "leaf"])).unwrap(),
            leaf
        );

        let err = repo.resolve(&[]).unwrap_err();
        assert_eq!(err.to_string(), "Cannot resolve empty path");
        let err = repo.resolve(&path(&["Root", "children"])).unwrap_err();
        assert_eq!(err.to_string(), "Invalid path: [Root, children]");
        let err = repo.resolve(&path(&["Root", "children", "nope"])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error resolving path [Root, children, nope]: 'nope' is unknown for the key 'children' in 'Root'"
        );
    }

    #[test]
    fn test_unknown_type_node_is_memoized() {
        let mut repo = Repository::new();
        let owner = repo.new_node("pkg", None, None, true);
        let key = PropertyPath::from("children");
        let first = repo.get_or_create_unknown_type_node(owner, &key, "Thing").unwrap();
        let second = repo.get_or_create_unknown_type_node(owner, &key, "Thing").unwrap();
        assert_eq!(first, second);
        assert_eq!(repo.get(owner).unwrap().values_for_meta_property_to_many("children"), &[first]);
        assert_eq!(repo.get(first).unwrap().classifier(), None);
    }

    #[test]
    fn test_compile_state_through_shared_reference() {
        let mut repo = Repository::new();
        let a = repo.new_node("A", None, None, true);
        let shared = &repo;
        shared.add_compile_state(a, CompileStateSet::PROCESSED).unwrap();
        assert!(shared.has_compile_state(a, CompileStateSet::PROCESSED).unwrap());
        shared.set_compile_states_from(a, CompileStateSet::VALIDATED).unwrap();
        assert_eq!(shared.compile_states(a).unwrap(), CompileStateSet::VALIDATED);
        assert!(matches!(shared.add_compile_state(NodeId(99), CompileStateSet::PROCESSED), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut repo = Repository::new();
        let a = repo.new_node("A", None, None, true);
        repo.add_top_level(a).unwrap();
        repo.new_anonymous_node(None, None, true);
        repo.clear();
        assert!(repo.is_empty());
        assert_eq!(repo.top_levels().count(), 0);
        assert_eq!((repo.id_counter(), repo.anonymous_id_counter()), (0, 0));
    }

    #[test]
    fn test_counters_never_move_backwards() {
        let mut repo = Repository::new();
        let a = repo.new_node("A", None, None, true);
        repo.new_anonymous_node(None, None, true);

        let err = repo.set_counters(0, 0).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)), "{err}");
        assert!(matches!(repo.set_counters(10, 0), Err(Error::ConstraintViolation(_))));
        assert_eq!((repo.id_counter(), repo.anonymous_id_counter()), (2, 1));

        let b = repo.new_node("B", None, None, true);
        assert_ne!(a, b);
        assert_eq!(repo.len(), 3);
        assert_eq!(repo.get(a).unwrap().name(), "A");

        repo.set_counters(10, 4).unwrap();
        assert_eq!(repo.new_node("C", None, None, true), NodeId(10));
        assert_eq!(repo.next_anonymous_name(), "@_0000004");
    }

    #[test]
    fn test_ids_reserved_by_an_open_transaction_are_not_reissued() {
        let mut repo = Repository::new();
        let mut log = repo.new_transaction(TxMode::Committable);
        let staged = repo.in_transaction(&mut log).unwrap().new_node("staged", None, None, true);
        assert!(repo.set_counters(staged.0, 0).is_err());

        let committed = repo.new_node("committed", None, None, true);
        assert_ne!(committed, staged);
        repo.commit(&mut log).unwrap();
        assert_eq!(repo.get(staged).unwrap().name(), "staged");
        assert_eq!(repo.get(committed).unwrap().name(), "committed");
    }
}
