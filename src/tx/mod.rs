//! Transaction management.
//!
//! A [`TransactionLog`] owns everything a transaction has done so far:
//! shadow copies of the nodes it wrote, the nodes it created, and the top
//! levels it registered. A [`TxScope`] pairs a log with the repository it
//! belongs to and is the view through which the transaction reads and
//! writes.
//!
//! ```
//! use metagraph::{GraphWrite, NodeSource, Repository, TxMode};
//!
//! let mut repo = Repository::new();
//! let node = repo.new_node("A", None, None, true);
//!
//! let mut log = repo.new_transaction(TxMode::Committable);
//! {
//!     let mut scope = repo.in_transaction(&mut log)?;
//!     scope.set_name(node, "B")?;
//!     assert_eq!(scope.get(node)?.name(), "B");
//!     assert_eq!(repo.get(node)?.name(), "A");
//! }
//! repo.commit(&mut log)?;
//! assert_eq!(repo.get(node)?.name(), "B");
//! # Ok::<(), metagraph::Error>(())
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::model::{CompileStateSet, InstanceNode, NodeId, NodeKind, NodeRef, NodeState, PropertyTable, SourceInformation};
use crate::storage::{GraphWrite, NodeSource, Repository, RepositoryConfig};
use crate::{Error, Result};

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMode {
    /// May be committed.
    Committable,
    /// Exploratory; can only be rolled back.
    Speculative,
}

/// Opaque transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Open,
    Committed,
    RolledBack,
}

// ============================================================================
// TransactionLog
// ============================================================================

/// The write set of one transaction.
///
/// Dropping an open log discards it.
pub struct TransactionLog {
    id: TxId,
    mode: TxMode,
    status: TxStatus,
    repository: u64,
    pub(crate) shadows: HashMap<NodeId, Box<NodeState>>,
    pub(crate) new_nodes: HashMap<NodeId, InstanceNode>,
    pub(crate) top_levels: BTreeMap<String, NodeId>,
}

impl TransactionLog {
    pub(crate) fn new(id: u64, mode: TxMode, repository: u64) -> Self {
        debug!(tx = id, ?mode, "opened transaction");
        Self {
            id: TxId(id),
            mode,
            status: TxStatus::Open,
            repository,
            shadows: HashMap::new(),
            new_nodes: HashMap::new(),
            top_levels: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn mode(&self) -> TxMode {
        self.mode
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == TxStatus::Open
    }

    pub fn is_committable(&self) -> bool {
        self.mode == TxMode::Committable
    }

    /// Whether the transaction holds a shadow copy of `id`.
    pub fn is_shadowed(&self, id: NodeId) -> bool {
        self.shadows.contains_key(&id)
    }

    /// Whether `id` was created inside the transaction.
    pub fn is_new(&self, id: NodeId) -> bool {
        self.new_nodes.contains_key(&id)
    }

    /// Number of pre-existing nodes written so far.
    pub fn write_set_len(&self) -> usize {
        self.shadows.len()
    }

    /// Discard every shadow, created node and staged top level.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        let discarded = self.shadows.len() + self.new_nodes.len();
        self.discard();
        self.status = TxStatus::RolledBack;
        debug!(tx = self.id.0, discarded, "rolled back transaction");
        Ok(())
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.status {
            TxStatus::Open => Ok(()),
            TxStatus::Committed => Err(Error::TxError(format!("transaction {} is already committed", self.id.0))),
            TxStatus::RolledBack => Err(Error::TxError(format!("transaction {} is already rolled back", self.id.0))),
        }
    }

    /// Open, and created by the repository with instance number `repository`.
    pub(crate) fn check_usable(&self, repository: u64) -> Result<()> {
        if self.repository != repository {
            return Err(Error::TxError(format!(
                "transaction {} is for a different repository",
                self.id.0
            )));
        }
        self.ensure_open()
    }

    pub(crate) fn mark_committed(&mut self) {
        self.status = TxStatus::Committed;
    }

    fn discard(&mut self) {
        self.shadows.clear();
        self.new_nodes.clear();
        self.top_levels.clear();
    }
}

impl Drop for TransactionLog {
    fn drop(&mut self) {
        if self.is_open() && !(self.shadows.is_empty() && self.new_nodes.is_empty()) {
            debug!(tx = self.id.0, "discarding open transaction");
        }
    }
}

impl std::fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLog")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("status", &self.status)
            .field("shadows", &self.shadows.len())
            .field("new_nodes", &self.new_nodes.len())
            .finish()
    }
}

// ============================================================================
// TxScope
// ============================================================================

/// A repository seen through an open transaction.
///
/// Reads return shadow copies where the transaction has them. Writes shadow
/// the node on first touch and never reach the repository before commit.
pub struct TxScope<'r> {
    repo: &'r Repository,
    log: &'r mut TransactionLog,
}

impl<'r> TxScope<'r> {
    pub(crate) fn new(repo: &'r Repository, log: &'r mut TransactionLog) -> Self {
        Self { repo, log }
    }

    pub fn id(&self) -> TxId {
        self.log.id()
    }

    pub fn repository(&self) -> &'r Repository {
        self.repo
    }

    // ------------------------------------------------------------------
    // Compile state (applied to the shadow)
    // ------------------------------------------------------------------

    pub fn add_compile_state(&mut self, id: NodeId, state: CompileStateSet) -> Result<()> {
        self.state_mut(id)?.compile_states.add(state);
        Ok(())
    }

    pub fn remove_compile_state(&mut self, id: NodeId, state: CompileStateSet) -> Result<()> {
        self.state_mut(id)?.compile_states.remove(state);
        Ok(())
    }

    pub fn set_compile_states_from(&mut self, id: NodeId, snapshot: CompileStateSet) -> Result<()> {
        self.state_mut(id)?.compile_states.set_from(snapshot);
        Ok(())
    }
}

impl NodeSource for TxScope<'_> {
    fn node_ref(&self, id: NodeId) -> Option<NodeRef<'_>> {
        if let Some(node) = self.log.new_nodes.get(&id) {
            return Some(NodeRef::new(node, &node.state, self));
        }
        let node = self.repo.nodes.get(&id)?;
        let state = match self.log.shadows.get(&id) {
            Some(shadow) => shadow,
            None => &node.state,
        };
        Some(NodeRef::new(node, state, self))
    }

    fn top_level(&self, name: &str) -> Option<NodeId> {
        self.log
            .top_levels
            .get(name)
            .copied()
            .or_else(|| self.repo.top_level(name))
    }

    fn is_excluded(&self, id: NodeId) -> bool {
        self.repo.is_excluded(id)
    }

    fn config(&self) -> &RepositoryConfig {
        self.repo.config()
    }

    /// Unwritten nodes are read from committed state, whose caches must only
    /// ever hold keys as seen outside any transaction.
    fn caches_indexes(&self) -> bool {
        false
    }
}

impl GraphWrite for TxScope<'_> {
    fn create_node(
        &mut self,
        name: String,
        classifier: Option<NodeId>,
        source: Option<SourceInformation>,
        persistent: bool,
        kind: NodeKind,
    ) -> NodeId {
        let id = self.repo.reserve_id();
        let node = InstanceNode::new(id, kind, persistent, NodeState::new(name, classifier, source));
        self.log.new_nodes.insert(id, node);
        id
    }

    fn next_anonymous_name(&self) -> String {
        self.repo.next_anonymous_name()
    }

    fn state_mut(&mut self, id: NodeId) -> Result<&mut NodeState> {
        if self.log.new_nodes.contains_key(&id) {
            return self
                .log
                .new_nodes
                .get_mut(&id)
                .map(|node| &mut *node.state)
                .ok_or_else(|| Error::NotFound(format!("node {id}")));
        }
        let node = self
            .repo
            .nodes
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
        let tx = self.log.id.0;
        let shadow = self.log.shadows.entry(id).or_insert_with(|| {
            trace!(tx, node = %id, "shadowing node");
            Box::new(node.state.copy())
        });
        Ok(&mut **shadow)
    }

    fn update_table<R>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut PropertyTable, &dyn NodeSource) -> Result<R>,
    ) -> Result<R> {
        let mut table = std::mem::take(&mut self.state_mut(id)?.table);
        let result = f(&mut table, &*self);
        if let Ok(state) = self.state_mut(id) {
            state.table = table;
        }
        result
    }

    fn get_or_add_top_level(&mut self, id: NodeId) -> Result<NodeId> {
        let name = self.get(id)?.name().to_string();
        if let Some(existing) = self.top_level(&name) {
            return Ok(existing);
        }
        trace!(tx = self.log.id.0, %name, %id, "staged top level");
        self.log.top_levels.insert(name, id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PropertyPath;

    #[test]
    fn test_shadow_is_created_once() {
        let mut repo = Repository::new();
        let a = repo.new_node("A", None, None, true);
        let x = repo.new_node("x", None, None, true);
        let mut log = repo.new_transaction(TxMode::Committable);
        {
            let mut scope = repo.in_transaction(&mut log).unwrap();
            scope.add_key_value(a, &PropertyPath::from("p"), x).unwrap();
            scope.add_key_value(a, &PropertyPath::from("p"), x).unwrap();
            assert_eq!(scope.get(a).unwrap().values_for_meta_property_to_many("p"), &[x, x]);
        }
        assert!(log.is_shadowed(a));
        assert!(!log.is_shadowed(x));
        assert_eq!(log.write_set_len(), 1);
        assert!(repo.get(a).unwrap().keys().next().is_none());
    }

    #[test]
    fn test_speculative_cannot_commit() {
        let mut repo = Repository::new();
        let mut log = repo.new_transaction(TxMode::Speculative);
        let err = repo.commit(&mut log).unwrap_err();
        assert_eq!(err.to_string(), "Transaction error: Transaction is not committable");
        assert!(log.is_open());
        repo.rollback(&mut log).unwrap();
        assert_eq!(log.status(), TxStatus::RolledBack);
    }

    #[test]
    fn test_finished_transaction_is_rejected() {
        let mut repo = Repository::new();
        let mut log = repo.new_transaction(TxMode::Committable);
        repo.commit(&mut log).unwrap();
        assert!(matches!(repo.commit(&mut log), Err(Error::TxError(_))));
        assert!(matches!(log.rollback(), Err(Error::TxError(_))));
        assert!(repo.in_transaction(&mut log).is_err());
    }

    #[test]
    fn test_log_is_bound_to_its_repository() {
        let repo = Repository::new();
        let other = Repository::new();
        let mut log = repo.new_transaction(TxMode::Committable);
        assert!(matches!(other.in_transaction(&mut log), Err(Error::TxError(_))));
    }

    #[test]
    fn test_ids_are_not_reused_after_rollback() {
        let mut repo = Repository::new();
        let mut log = repo.new_transaction(TxMode::Committable);
        let inside = {
            let mut scope = repo.in_transaction(&mut log).unwrap();
            scope.new_node("tmp", None, None, true)
        };
        assert!(log.is_new(inside));
        assert!(!repo.contains(inside));
        log.rollback().unwrap();
        let after = repo.new_node("kept", None, None, true);
        assert!(after.0 > inside.0);
    }

    #[test]
    fn test_compile_state_changes_are_isolated() {
        let mut repo = Repository::new();
        let a = repo.new_node("A", None, None, true);
        let mut log = repo.new_transaction(TxMode::Committable);
        {
            let mut scope = repo.in_transaction(&mut log).unwrap();
            scope.add_compile_state(a, CompileStateSet::PROCESSED).unwrap();
            assert!(scope.get(a).unwrap().has_compile_state(CompileStateSet::PROCESSED));
            assert!(!repo.has_compile_state(a, CompileStateSet::PROCESSED).unwrap());
        }
        repo.commit(&mut log).unwrap();
        assert!(repo.has_compile_state(a, CompileStateSet::PROCESSED).unwrap());
    }
}
