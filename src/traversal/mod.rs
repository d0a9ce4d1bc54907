//! Cycle-safe walks over the node graph.
//!
//! Property values routinely form cycles, so neither walk recurses: both
//! drive an explicit stack and detect revisits by node identity.

pub mod print;
pub mod validate;

pub use print::{PrintMode, print_node};
pub use validate::validate;
