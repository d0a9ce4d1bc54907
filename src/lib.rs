//! # metagraph: In-Memory Metamodel Graph Store
//!
//! The instance graph behind a modeling-language compiler: every class,
//! property, literal and expression is an [`InstanceNode`] whose properties
//! point at other nodes by [`NodeId`].
//!
//! ## Design Principles
//!
//! 1. **Arena, not pointers**: the [`Repository`] owns every node; references
//!    between nodes are ids resolved through a [`NodeSource`] view
//! 2. **Adaptive storage**: a [`ValueContainer`] picks its tier by size and
//!    keeps the same logical content in every tier
//! 3. **Copy-on-write transactions**: a [`TransactionLog`] shadows node state
//!    and swaps it in on commit; readers outside never see staged edits
//! 4. **No recursion over the graph**: printing and validation use explicit
//!    work lists, so cycles and deep graphs are safe
//!
//! ## Quick Start
//!
//! ```rust
//! use metagraph::{GraphWrite, NodeSource, PropertyPath, Repository};
//!
//! # fn example() -> metagraph::Result<()> {
//! let mut repo = Repository::new();
//! let class = repo.new_node("Class", None, None, true);
//! let a = repo.new_node("a", Some(class), None, true);
//! let b = repo.new_node("b", Some(class), None, true);
//! repo.add_key_value(a, &PropertyPath::from("next"), b)?;
//!
//! let node = repo.get(a)?;
//! assert_eq!(node.value_for_meta_property_to_one("next")?, Some(b));
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod index;
pub mod model;
pub mod storage;
pub mod traversal;
pub mod tx;

// ============================================================================
// Re-exports: Model
// ============================================================================

pub use model::{
    CompileStateSet, CompileStateTracker, InstanceNode, NodeId, NodeKind, NodeRef, NodeState, Primitive,
    PropertyEntry, PropertyPath, PropertyTable, SourceInformation,
};

// ============================================================================
// Re-exports: Storage
// ============================================================================

pub use storage::memory::{is_anonymous_instance_name, possibly_replace_anonymous_id};
pub use storage::{GraphWrite, NodeSource, Repository, RepositoryConfig, Tier, ValueContainer};

// ============================================================================
// Re-exports: Indexes, Transactions, Traversal
// ============================================================================

pub use index::{IndexCache, IndexKey, IndexSpecification};
pub use traversal::{PrintMode, print_node};
pub use tx::{TransactionLog, TxId, TxMode, TxScope, TxStatus};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Expected exactly one value, found {count}")]
    Cardinality { count: usize },

    #[error("More than one ({count}) result is returned for the key '{property}' in CoreInstance:\n\n{rendering}")]
    OneValue { property: String, count: usize, rendering: String },

    #[error("Index conflict: multiple values for id {key}")]
    IndexConflict { key: String },

    #[error("Invalid ID index for property '{property}' on {node}: multiple values for id {key}")]
    InvalidIdIndex { property: String, node: String, key: String },

    #[error("Offset {offset} out of bounds for {len} values")]
    OutOfBounds { offset: usize, len: usize },

    #[error("{info}{}", location_suffix(.location))]
    Validation { location: Option<SourceInformation>, info: String },

    #[error("{0}")]
    Resolution(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transaction error: {0}")]
    TxError(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Format error: {0}")]
    Fmt(#[from] std::fmt::Error),
}

fn location_suffix(location: &Option<SourceInformation>) -> String {
    match location {
        Some(location) => format!(" at {location}"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
