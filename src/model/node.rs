//! Instance nodes of the metamodel graph.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::compile_state::{CompileStateSet, CompileStateTracker};
use super::property_table::{PropertyPath, PropertyTable};
use super::source::SourceInformation;
use crate::index::{IndexKey, IndexSpecification};
use crate::storage::NodeSource;
use crate::traversal::{self, PrintMode};
use crate::{Error, Result};

/// Synthetic node identifier. Assigned once by the repository, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Literal payload of a primitive node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Primitive {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl Primitive {
    /// Name of the top-level type that classifies this literal.
    pub fn type_name(&self) -> &'static str {
        match self {
            Primitive::Boolean(_) => "Boolean",
            Primitive::Integer(_) => "Integer",
            Primitive::Float(_) => "Float",
            Primitive::String(_) => "String",
        }
    }

    /// Literal text, used as the node name.
    pub fn literal(&self) -> String {
        match self {
            Primitive::Boolean(b) => b.to_string(),
            Primitive::Integer(i) => i.to_string(),
            Primitive::Float(v) => v.to_string(),
            Primitive::String(s) => s.clone(),
        }
    }
}

/// The closed set of node kinds this core distinguishes.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// A structural node with properties.
    Simple,
    /// A literal leaf. Never expanded when printing, never traversed by validation.
    Primitive(Primitive),
}

/// The mutable part of a node.
///
/// This is the unit a transaction shadow-copies on first write and swaps in
/// on commit.
#[derive(Debug, Default)]
pub struct NodeState {
    pub(crate) name: String,
    pub(crate) classifier: Option<NodeId>,
    pub(crate) source: Option<SourceInformation>,
    pub(crate) table: PropertyTable,
    pub(crate) compile_states: CompileStateTracker,
}

impl NodeState {
    pub(crate) fn new(name: String, classifier: Option<NodeId>, source: Option<SourceInformation>) -> Self {
        Self {
            name,
            classifier,
            source,
            table: PropertyTable::default(),
            compile_states: CompileStateTracker::default(),
        }
    }

    /// Deep copy sharing no mutable storage with `self`.
    pub fn copy(&self) -> Self {
        Self {
            name: self.name.clone(),
            classifier: self.classifier,
            source: self.source.clone(),
            table: self.table.copy(),
            compile_states: self.compile_states.clone(),
        }
    }

    pub fn table(&self) -> &PropertyTable {
        &self.table
    }
}

/// A graph node as stored in the repository arena.
#[derive(Debug)]
pub struct InstanceNode {
    pub(crate) id: NodeId,
    pub(crate) persistent: bool,
    pub(crate) kind: NodeKind,
    pub(crate) state: Box<NodeState>,
}

impl InstanceNode {
    pub(crate) fn new(id: NodeId, kind: NodeKind, persistent: bool, state: NodeState) -> Self {
        Self { id, persistent, kind, state: Box::new(state) }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }
}

/// Read handle on a node, resolved through a particular view of the graph.
///
/// Inside a transaction the view is the transaction scope, so `state` is the
/// shadow copy when one exists; elsewhere it is the committed state.
#[derive(Clone, Copy)]
pub struct NodeRef<'g> {
    node: &'g InstanceNode,
    state: &'g NodeState,
    graph: &'g dyn NodeSource,
}

impl<'g> NodeRef<'g> {
    pub(crate) fn new(node: &'g InstanceNode, state: &'g NodeState, graph: &'g dyn NodeSource) -> Self {
        Self { node, state, graph }
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn name(&self) -> &'g str {
        &self.state.name
    }

    pub fn classifier(&self) -> Option<NodeId> {
        self.state.classifier
    }

    pub fn source_information(&self) -> Option<&'g SourceInformation> {
        self.state.source.as_ref()
    }

    pub fn is_persistent(&self) -> bool {
        self.node.persistent
    }

    pub fn kind(&self) -> &'g NodeKind {
        &self.node.kind
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self.node.kind, NodeKind::Primitive(_))
    }

    /// The view this handle was resolved through.
    pub fn graph(&self) -> &'g dyn NodeSource {
        self.graph
    }

    pub fn table(&self) -> &'g PropertyTable {
        &self.state.table
    }

    /// Resolve another node through the same view.
    pub fn resolve(&self, id: NodeId) -> Result<NodeRef<'g>> {
        self.graph.get(id)
    }

    pub fn classifier_ref(&self) -> Result<Option<NodeRef<'g>>> {
        self.state.classifier.map(|c| self.graph.get(c)).transpose()
    }

    // ------------------------------------------------------------------
    // Compile state
    // ------------------------------------------------------------------

    pub fn has_compile_state(&self, state: CompileStateSet) -> bool {
        self.state.compile_states.has(state)
    }

    pub fn compile_states(&self) -> CompileStateSet {
        self.state.compile_states.get()
    }

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    /// Property names in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &'g str> + use<'g> {
        self.state.table.keys()
    }

    pub fn real_key_by_name(&self, name: &str) -> Option<&'g PropertyPath> {
        self.state.table.real_key(name)
    }

    /// The property-definition node for `name`: the bound key instance if any,
    /// otherwise the real key resolved through the repository.
    pub fn key_by_name(&self, name: &str) -> Result<Option<NodeId>> {
        let Some(entry) = self.state.table.entry(name) else {
            return Ok(None);
        };
        if let Some(key) = entry.key_instance() {
            return Ok(Some(key));
        }
        match entry.real_key() {
            Some(path) => self.graph.resolve(path.segments()).map(Some),
            None => Ok(None),
        }
    }

    /// True if the property exists and holds at least one value.
    pub fn is_value_defined_for_key(&self, name: &str) -> bool {
        self.state.table.has_values_defined(name)
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    /// All values of a property in insertion order; empty if the property is absent.
    pub fn values_for_meta_property_to_many(&self, name: &str) -> &'g [NodeId] {
        self.state.table.values(name)
    }

    /// The sole value of a property, or `None` if it has no value.
    ///
    /// More than one value is an error that carries a rendering of this node
    /// and (up to a configured limit) of the conflicting values.
    pub fn value_for_meta_property_to_one(&self, name: &str) -> Result<Option<NodeId>> {
        let Some(container) = self.state.table.container(name) else {
            return Ok(None);
        };
        match container.one_value() {
            Err(Error::Cardinality { count }) => Err(self.one_value_error(name, count)),
            other => other,
        }
    }

    fn one_value_error(&self, name: &str, count: usize) -> Error {
        let mut rendering = String::with_capacity(128);
        match traversal::print_node(self.graph, self.id(), &mut rendering, "   ", PrintMode::Debug, 0) {
            Ok(()) => {}
            Err(_) => rendering = format!("   {self}"),
        }
        if count <= self.graph.config().max_dumped_values {
            rendering.push_str("\n\nValues:\n");
            for value in self.values_for_meta_property_to_many(name) {
                rendering.push('\n');
                if traversal::print_node(self.graph, *value, &mut rendering, "", PrintMode::Debug, 0).is_err() {
                    rendering.push_str(&value.to_string());
                }
            }
        }
        Error::OneValue { property: name.to_string(), count, rendering }
    }

    /// Lookup through the unique index `spec` over the values of `name`.
    pub fn value_in_values_by_id_index<K: IndexKey>(
        &self,
        name: &str,
        spec: &IndexSpecification<K>,
        key: &K,
    ) -> Result<Option<NodeId>> {
        let Some(container) = self.state.table.container(name) else {
            return Ok(None);
        };
        match container.value_by_id_index(spec, key, self.graph) {
            Err(Error::IndexConflict { key }) => {
                let location = self
                    .source_information()
                    .map(|s| format!(" ({})", s.message()))
                    .unwrap_or_default();
                Err(Error::InvalidIdIndex {
                    property: name.to_string(),
                    node: format!("{self}{location}"),
                    key,
                })
            }
            other => other,
        }
    }

    /// Lookup through the non-unique index `spec` over the values of `name`.
    pub fn values_in_values_by_index<K: IndexKey>(
        &self,
        name: &str,
        spec: &IndexSpecification<K>,
        key: &K,
    ) -> Result<Vec<NodeId>> {
        match self.state.table.container(name) {
            Some(container) => container.values_by_index(spec, key, self.graph),
            None => Ok(Vec::new()),
        }
    }

    /// The value of `name` whose own name is `child_name`.
    pub fn value_in_values_by_name(&self, name: &str, child_name: &str) -> Result<Option<NodeId>> {
        self.value_in_values_by_id_index(name, IndexSpecification::by_name(), &child_name.to_string())
    }

    // ------------------------------------------------------------------
    // Printing
    // ------------------------------------------------------------------

    /// Full rendering: synthetic ids and source suffixes, unbounded depth.
    pub fn print_full(&self, tab: &str) -> Result<String> {
        self.render(tab, PrintMode::Full, self.graph.config().max_print_depth)
    }

    /// Debug rendering bounded at `max_depth` (the configured default if `None`).
    pub fn print(&self, tab: &str, max_depth: Option<usize>) -> Result<String> {
        let depth = max_depth.unwrap_or(self.graph.config().max_print_depth);
        self.render(tab, PrintMode::Debug, depth)
    }

    /// Display rendering: no ids, no source suffixes, anonymous names masked.
    pub fn print_without_debug(&self, tab: &str, max_depth: Option<usize>) -> Result<String> {
        let depth = max_depth.unwrap_or(self.graph.config().max_print_depth);
        self.render(tab, PrintMode::Display, depth)
    }

    /// Write a rendering into any `fmt::Write` sink.
    pub fn write_to<W: fmt::Write>(&self, sink: &mut W, tab: &str, mode: PrintMode, max_depth: usize) -> Result<()> {
        traversal::print_node(self.graph, self.id(), sink, tab, mode, max_depth)
    }

    fn render(&self, tab: &str, mode: PrintMode, max_depth: usize) -> Result<String> {
        let mut out = String::new();
        self.write_to(&mut out, tab, mode, max_depth)?;
        Ok(out)
    }
}

impl fmt::Display for NodeRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) instanceOf ", self.name(), self.id())?;
        match self.classifier().and_then(|c| self.graph.node_ref(c)) {
            Some(classifier) => write!(f, "{}", classifier.name()),
            None => write!(f, "null"),
        }
    }
}

impl fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("classifier", &self.classifier())
            .finish()
    }
}
