//! Structural validation.
//!
//! Every node reachable from the root must have a classifier, and every
//! property key must have a real key and a classified key instance.

use std::collections::HashSet;

use crate::model::{NodeId, NodeRef, SourceInformation};
use crate::storage::NodeSource;
use crate::{Error, Result};

/// Validate everything reachable from `root`.
///
/// `done` carries visited nodes across calls, so validating several roots
/// with one set visits each resolved node once. A node found in `done`
/// without a classifier is checked again: its classifier may have been
/// resolved after it was first reached. Primitive values are not visited.
pub fn validate(source: &dyn NodeSource, root: NodeId, done: &mut HashSet<NodeId>) -> Result<()> {
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        let node = source.get(id)?;
        if !done.insert(id) && node.classifier().is_some() {
            continue;
        }

        if node.classifier().is_none() {
            let location = node
                .source_information()
                .cloned()
                .or_else(|| nearest_location(source, &stack));
            return Err(Error::Validation {
                location,
                info: format!("{} has not been defined!", node.name()),
            });
        }

        for key in node.keys() {
            check_key(node, key)?;
            for &child in node.values_for_meta_property_to_many(key) {
                let Some(child_ref) = source.node_ref(child) else {
                    return Err(Error::NotFound(format!("node {child} (value of '{key}' in '{}')", node.name())));
                };
                if child_ref.is_primitive() {
                    continue;
                }
                if !done.contains(&child) || child_ref.classifier().is_none() {
                    stack.push(child);
                }
            }
        }
    }
    Ok(())
}

/// Nearest span on the pending stack, searched from the top.
fn nearest_location(source: &dyn NodeSource, stack: &[NodeId]) -> Option<SourceInformation> {
    stack
        .iter()
        .rev()
        .filter_map(|id| source.node_ref(*id))
        .find_map(|node| node.source_information().cloned())
}

fn check_key(node: NodeRef<'_>, key: &str) -> Result<()> {
    if node.real_key_by_name(key).is_none() {
        return Err(Error::Validation {
            location: node.source_information().cloned(),
            info: format!("No real key can be found for '{key}' in\n{} ({node})", node.name()),
        });
    }
    let key_node = match node.key_by_name(key) {
        Ok(Some(id)) => node.graph().node_ref(id),
        _ => None,
    };
    match key_node {
        Some(key_node) if key_node.classifier().is_some() => Ok(()),
        other => {
            let key_name = other.map(|k| k.name()).unwrap_or(key);
            Err(Error::Validation {
                location: node.source_information().cloned(),
                info: format!("'{key_name}' used in '{}' has not been defined!", node.name()),
            })
        }
    }
}
