//! # Graph Storage Contracts
//!
//! Two traits separate reading from writing:
//!
//! | Trait | Object-safe | Implemented by |
//! |-------|-------------|----------------|
//! | [`NodeSource`] | yes | [`Repository`], [`TxScope`](crate::tx::TxScope) |
//! | [`GraphWrite`] | no | [`Repository`], [`TxScope`](crate::tx::TxScope) |
//!
//! Every read goes through a `NodeSource` view. Inside a transaction the
//! view is the transaction scope, which answers with shadow copies where
//! they exist; everywhere else it is the repository's committed state.
//!
//! Every structural mutation goes through [`GraphWrite::state_mut`] or
//! [`GraphWrite::update_table`], the write barrier that lets a transaction
//! shadow a node before its first change.

pub mod memory;
pub mod values;

use serde::{Deserialize, Serialize};

use crate::model::{NodeId, NodeKind, NodeRef, NodeState, Primitive, PropertyPath, PropertyTable, SourceInformation};
use crate::{Error, Result};

pub use memory::Repository;
pub use values::{Tier, ValueContainer};

// ============================================================================
// Repository configuration
// ============================================================================

/// Tuning knobs for a repository.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// let config = metagraph::RepositoryConfig::from_json(r#"{ "index_threshold": 64 }"#).unwrap();
/// assert_eq!(config.index_threshold, 64);
/// assert_eq!(config.index_tolerance, 8);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Size around which a value container switches to indexed storage.
    pub index_threshold: usize,
    /// Hysteresis band around `index_threshold`.
    pub index_tolerance: usize,
    /// Default depth cutoff for `print` and `print_without_debug`.
    pub max_print_depth: usize,
    /// Values listed in a "more than one result" error before the dump is omitted.
    pub max_dumped_values: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            index_threshold: 32,
            index_tolerance: 8,
            max_print_depth: 1,
            max_dumped_values: 100,
        }
    }
}

impl RepositoryConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.index_threshold == 0 {
            return Err(Error::Config("index_threshold must be positive".into()));
        }
        if self.index_tolerance >= self.index_threshold {
            return Err(Error::Config(format!(
                "index_tolerance ({}) must be smaller than index_threshold ({})",
                self.index_tolerance, self.index_threshold
            )));
        }
        Ok(())
    }
}

// ============================================================================
// NodeSource: the read contract
// ============================================================================

/// A readable view of the graph.
pub trait NodeSource {
    /// Handle on `id` as seen through this view.
    fn node_ref(&self, id: NodeId) -> Option<NodeRef<'_>>;

    /// The top-level element registered under `name`.
    fn top_level(&self, name: &str) -> Option<NodeId>;

    /// Whether `id` is in the repository's exclusion set.
    fn is_excluded(&self, id: NodeId) -> bool;

    fn config(&self) -> &RepositoryConfig;

    /// Whether indexed lookups through this view may build and read the
    /// index cache of the containers it returns. A view that answers
    /// `false` is served by scans and leaves every cache untouched.
    fn caches_indexes(&self) -> bool {
        true
    }

    /// Like [`node_ref`](Self::node_ref), failing with [`Error::NotFound`].
    fn get(&self, id: NodeId) -> Result<NodeRef<'_>> {
        self.node_ref(id).ok_or_else(|| Error::NotFound(format!("node {id}")))
    }

    /// Whether `id` is registered as a top-level element.
    fn is_top_level(&self, id: NodeId) -> bool {
        self.node_ref(id)
            .is_some_and(|node| self.top_level(node.name()) == Some(id))
    }

    /// Resolve `[top_level, key, name, key, name, ...]`.
    ///
    /// Each `(key, name)` pair selects the value of `key` named `name`.
    fn resolve(&self, path: &[String]) -> Result<NodeId> {
        let Some((first, rest)) = path.split_first() else {
            return Err(Error::Resolution("Cannot resolve empty path".into()));
        };
        if rest.len() % 2 != 0 {
            return Err(Error::Resolution(format!("Invalid path: [{}]", path.join(", "))));
        }
        let mut current = self.top_level(first).ok_or_else(|| {
            Error::Resolution(format!(
                "Error resolving path [{}]: '{first}' is not a top level element",
                path.join(", ")
            ))
        })?;
        for pair in rest.chunks_exact(2) {
            let (key, name) = (&pair[0], &pair[1]);
            let node = self.get(current)?;
            current = node.value_in_values_by_name(key, name)?.ok_or_else(|| {
                Error::Resolution(format!(
                    "Error resolving path [{}]: '{name}' is unknown for the key '{key}' in '{}'",
                    path.join(", "),
                    node.name()
                ))
            })?;
        }
        Ok(current)
    }
}

// ============================================================================
// GraphWrite: the mutation contract
// ============================================================================

/// A writable view of the graph.
///
/// Implementors provide node creation, the write barrier, and top-level
/// registration; everything else is expressed on top of those.
pub trait GraphWrite: NodeSource {
    /// The node factory. Assigns a fresh id that is never reused.
    fn create_node(
        &mut self,
        name: String,
        classifier: Option<NodeId>,
        source: Option<SourceInformation>,
        persistent: bool,
        kind: NodeKind,
    ) -> NodeId;

    /// Next name in the anonymous sequence.
    fn next_anonymous_name(&self) -> String;

    /// Write barrier: the mutable state of `id` in this view.
    fn state_mut(&mut self, id: NodeId) -> Result<&mut NodeState>;

    /// Run `f` on the property table of `id` after the write barrier.
    ///
    /// `f` also receives a read view of the graph so index maintenance can
    /// extract keys from value nodes. While `f` runs, the table of `id`
    /// itself appears empty through that view.
    fn update_table<R>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut PropertyTable, &dyn NodeSource) -> Result<R>,
    ) -> Result<R>;

    /// Register `id` as a top-level element unless one with the same name
    /// exists; returns whichever is registered afterwards.
    fn get_or_add_top_level(&mut self, id: NodeId) -> Result<NodeId>;

    // ------------------------------------------------------------------
    // Factory variants
    // ------------------------------------------------------------------

    fn new_node(
        &mut self,
        name: impl Into<String>,
        classifier: Option<NodeId>,
        source: Option<SourceInformation>,
        persistent: bool,
    ) -> NodeId {
        self.create_node(name.into(), classifier, source, persistent, NodeKind::Simple)
    }

    fn new_ephemeral_node(
        &mut self,
        name: impl Into<String>,
        classifier: Option<NodeId>,
        source: Option<SourceInformation>,
    ) -> NodeId {
        self.new_node(name, classifier, source, false)
    }

    fn new_anonymous_node(
        &mut self,
        source: Option<SourceInformation>,
        classifier: Option<NodeId>,
        persistent: bool,
    ) -> NodeId {
        let name = self.next_anonymous_name();
        self.create_node(name, classifier, source, persistent, NodeKind::Simple)
    }

    /// A node whose classifier is resolved later. Anonymous when `name` is `None`.
    fn new_unknown_type_node(
        &mut self,
        name: Option<&str>,
        source: Option<SourceInformation>,
        persistent: bool,
    ) -> NodeId {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.next_anonymous_name(),
        };
        self.create_node(name, None, source, persistent, NodeKind::Simple)
    }

    /// Uncached primitive node classified by the matching top-level type.
    fn new_primitive(&mut self, value: Primitive) -> Result<NodeId> {
        let classifier = self.get_or_create_top_level(value.type_name(), None)?;
        let name = value.literal();
        Ok(self.create_node(name, Some(classifier), None, true, NodeKind::Primitive(value)))
    }

    // ------------------------------------------------------------------
    // Top-level registry
    // ------------------------------------------------------------------

    /// Register `id` as a top-level element; a different element already
    /// registered under the same name is a constraint violation.
    fn add_top_level(&mut self, id: NodeId) -> Result<()> {
        let registered = self.get_or_add_top_level(id)?;
        if registered != id {
            let name = self.get(id)?.name();
            return Err(Error::ConstraintViolation(format!(
                "A top level element already exists with the name \"{name}\""
            )));
        }
        Ok(())
    }

    /// The top-level element `name`, created (unclassified) if absent.
    /// A supplied source replaces the element's current one.
    fn get_or_create_top_level(&mut self, name: &str, source: Option<SourceInformation>) -> Result<NodeId> {
        let id = match self.top_level(name) {
            Some(id) => id,
            None => {
                let created = self.create_node(name.to_string(), None, source.clone(), true, NodeKind::Simple);
                self.get_or_add_top_level(created)?
            }
        };
        if source.is_some() {
            self.set_source_information(id, source)?;
        }
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Node fields
    // ------------------------------------------------------------------

    fn set_name(&mut self, id: NodeId, name: impl Into<String>) -> Result<()> {
        self.state_mut(id)?.name = name.into();
        Ok(())
    }

    fn set_classifier(&mut self, id: NodeId, classifier: Option<NodeId>) -> Result<()> {
        self.state_mut(id)?.classifier = classifier;
        Ok(())
    }

    fn set_source_information(&mut self, id: NodeId, source: Option<SourceInformation>) -> Result<()> {
        self.state_mut(id)?.source = source;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    fn add_key_value(&mut self, id: NodeId, key: &PropertyPath, value: NodeId) -> Result<()> {
        self.update_table(id, |table, source| table.add_value(key, value, source))
    }

    fn add_key_values(&mut self, id: NodeId, key: &PropertyPath, values: &[NodeId]) -> Result<()> {
        self.update_table(id, |table, source| table.add_values(key, values, source))
    }

    fn set_key_values(&mut self, id: NodeId, key: &PropertyPath, values: &[NodeId]) -> Result<()> {
        self.update_table(id, |table, source| table.set_values(key, values, source))
    }

    fn add_key_with_empty_list(&mut self, id: NodeId, key: &PropertyPath) -> Result<()> {
        self.update_table(id, |table, _| {
            table.add_key_with_no_values(key);
            Ok(())
        })
    }

    /// Remove the first occurrence of `value` from property `name`.
    fn remove_value_for_meta_property_to_many(&mut self, id: NodeId, name: &str, value: NodeId) -> Result<bool> {
        self.update_table(id, |table, source| table.remove_value(name, value, source))
    }

    /// Replace the value at `offset` of property `name`.
    fn modify_value_for_to_many_meta_property(
        &mut self,
        id: NodeId,
        name: &str,
        offset: usize,
        value: NodeId,
    ) -> Result<()> {
        self.update_table(id, |table, source| table.modify_value(name, offset, value, source))
    }

    fn remove_property(&mut self, id: NodeId, name: &str) -> Result<bool> {
        self.update_table(id, |table, _| Ok(table.remove_key(name)))
    }

    fn bind_key_instance(&mut self, id: NodeId, key: &PropertyPath, instance: NodeId) -> Result<()> {
        self.update_table(id, |table, _| {
            table.bind_key_instance(key, instance);
            Ok(())
        })
    }

    /// The value of `key` named `child_name`, created as an unknown-type
    /// node and appended under `key` on first request.
    fn get_or_create_unknown_type_node(&mut self, id: NodeId, key: &PropertyPath, child_name: &str) -> Result<NodeId> {
        if let Some(existing) = self.get(id)?.value_in_values_by_name(key.name(), child_name)? {
            return Ok(existing);
        }
        let child = self.new_unknown_type_node(Some(child_name), None, true);
        self.add_key_value(id, key, child)?;
        Ok(child)
    }
}
