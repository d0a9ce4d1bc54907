//! # Metamodel Graph Model
//!
//! The node abstraction and everything attached to a single node: its
//! property table, source span and compile-state flags.
//!
//! Design rule: nodes never own each other. Every cross-reference
//! (classifier, property value, key instance) is a [`NodeId`] resolved
//! through a [`NodeSource`](crate::storage::NodeSource) view.

pub mod compile_state;
pub mod node;
pub mod property_table;
pub mod source;

pub use compile_state::{CompileStateSet, CompileStateTracker};
pub use node::{InstanceNode, NodeId, NodeKind, NodeRef, NodeState, Primitive};
pub use property_table::{PropertyEntry, PropertyPath, PropertyTable};
pub use source::SourceInformation;
