//! PropertyTable: the ordered property store on a node.

use std::fmt;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::node::NodeId;
use crate::storage::values::ValueContainer;
use crate::storage::NodeSource;
use crate::Result;

/// The real key of a property: a path of strings whose last segment is the
/// display name.
///
/// The same display name may denote different property definitions
/// depending on inheritance or association context; the path disambiguates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyPath(SmallVec<[String; 4]>);

impl PropertyPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Display name (last segment). Empty for an empty path.
    pub fn name(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or("")
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// More than a bare name.
    pub fn is_qualified(&self) -> bool {
        self.0.len() > 1
    }
}

impl From<&str> for PropertyPath {
    fn from(name: &str) -> Self {
        Self::new([name])
    }
}

impl<const N: usize> From<[&str; N]> for PropertyPath {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// One property of a node.
#[derive(Debug)]
pub struct PropertyEntry {
    name: String,
    real_key: Option<PropertyPath>,
    key_instance: Option<NodeId>,
    values: ValueContainer,
}

impl PropertyEntry {
    fn new(name: String, real_key: Option<PropertyPath>) -> Self {
        Self { name, real_key, key_instance: None, values: ValueContainer::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn real_key(&self) -> Option<&PropertyPath> {
        self.real_key.as_ref()
    }

    pub fn key_instance(&self) -> Option<NodeId> {
        self.key_instance
    }

    pub fn values(&self) -> &ValueContainer {
        &self.values
    }

    fn copy(&self) -> Self {
        Self {
            name: self.name.clone(),
            real_key: self.real_key.clone(),
            key_instance: self.key_instance,
            values: self.values.copy(),
        }
    }
}

/// Ordered mapping from property name to its entry.
///
/// Iteration follows insertion order; removing a property keeps the
/// relative order of the others.
#[derive(Debug, Default)]
pub struct PropertyTable {
    entries: Vec<PropertyEntry>,
    positions: HashMap<String, usize>,
}

impl PropertyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn entries(&self) -> &[PropertyEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&PropertyEntry> {
        self.positions.get(name).map(|&i| &self.entries[i])
    }

    pub fn container(&self, name: &str) -> Option<&ValueContainer> {
        self.entry(name).map(|e| &e.values)
    }

    pub fn values(&self, name: &str) -> &[NodeId] {
        self.container(name).map(ValueContainer::values).unwrap_or(&[])
    }

    pub fn real_key(&self, name: &str) -> Option<&PropertyPath> {
        self.entry(name).and_then(PropertyEntry::real_key)
    }

    pub fn has_values_defined(&self, name: &str) -> bool {
        self.container(name).is_some_and(|c| !c.is_empty())
    }

    /// Deep copy for transaction shadows.
    pub fn copy(&self) -> Self {
        Self {
            entries: self.entries.iter().map(PropertyEntry::copy).collect(),
            positions: self.positions.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Entry for `key`, created if absent. A qualified path is recorded as
    /// the real key the first time one is supplied; a bare name records none.
    fn entry_mut(&mut self, key: &PropertyPath) -> &mut PropertyEntry {
        let name = key.name();
        let index = match self.positions.get(name) {
            Some(&i) => i,
            None => {
                self.entries.push(PropertyEntry::new(name.to_string(), None));
                self.positions.insert(name.to_string(), self.entries.len() - 1);
                self.entries.len() - 1
            }
        };
        let entry = &mut self.entries[index];
        if entry.real_key.is_none() && key.is_qualified() {
            entry.real_key = Some(key.clone());
        }
        entry
    }

    fn existing_mut(&mut self, name: &str) -> Option<&mut PropertyEntry> {
        let index = *self.positions.get(name)?;
        Some(&mut self.entries[index])
    }

    pub fn add_value(&mut self, key: &PropertyPath, value: NodeId, source: &dyn NodeSource) -> Result<()> {
        self.entry_mut(key).values.add_value(value, source)
    }

    pub fn add_values(&mut self, key: &PropertyPath, values: &[NodeId], source: &dyn NodeSource) -> Result<()> {
        self.entry_mut(key).values.add_values(values, source)
    }

    /// Replace every value of `key`.
    pub fn set_values(&mut self, key: &PropertyPath, values: &[NodeId], source: &dyn NodeSource) -> Result<()> {
        let entry = self.entry_mut(key);
        entry.values = ValueContainer::from_values(values, source.config());
        Ok(())
    }

    pub fn add_key_with_no_values(&mut self, key: &PropertyPath) {
        self.entry_mut(key);
    }

    /// Removes the first occurrence of `value`. Returns whether one was found.
    pub fn remove_value(&mut self, name: &str, value: NodeId, source: &dyn NodeSource) -> Result<bool> {
        match self.existing_mut(name) {
            Some(entry) => entry.values.remove_value(value, source),
            None => Ok(false),
        }
    }

    pub fn modify_value(&mut self, name: &str, offset: usize, value: NodeId, source: &dyn NodeSource) -> Result<()> {
        match self.existing_mut(name) {
            Some(entry) => entry.values.set_value(offset, value, source),
            None => Err(crate::Error::OutOfBounds { offset, len: 0 }),
        }
    }

    pub fn remove_key(&mut self, name: &str) -> bool {
        let Some(index) = self.positions.remove(name) else {
            return false;
        };
        self.entries.remove(index);
        for position in self.positions.values_mut() {
            if *position > index {
                *position -= 1;
            }
        }
        true
    }

    /// Bind the property-definition node for `key`, creating the property if needed.
    pub fn bind_key_instance(&mut self, key: &PropertyPath, instance: NodeId) {
        self.entry_mut(key).key_instance = Some(instance);
    }
}
