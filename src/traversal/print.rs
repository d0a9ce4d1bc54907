//! Indented tree rendering of a node and what it references.
//!
//! ```text
//! Class_0 instance Class_0
//!     name_6(Property_5):
//!         Class_2 instance String_1
//! ```
//!
//! Each node is a header line `name instance classifier`, followed by one
//! block per property (sorted by name) listing the values in insertion
//! order, eight columns deeper. A value that cannot be expanded is printed
//! as a one-line stub instead.

use std::fmt;

use crate::model::{NodeId, NodeRef};
use crate::storage::memory::possibly_replace_anonymous_id;
use crate::storage::NodeSource;
use crate::Result;

const PROPERTY_INDENT: &str = "    ";
const VALUE_INDENT: &str = "        ";

/// Rendering fidelity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintMode {
    /// `name_id` plus source suffixes. Ignores depth and exclusion;
    /// only values already on the path are stubbed.
    Full,
    /// Source suffixes, anonymous names masked, bounded depth.
    Debug,
    /// No suffixes, anonymous names masked, bounded depth.
    Display,
}

impl PrintMode {
    fn with_source(self) -> bool {
        !matches!(self, PrintMode::Display)
    }
}

struct Frame<'g> {
    node: NodeRef<'g>,
    tab: String,
    keys: Vec<&'g str>,
    key: usize,
    value: usize,
}

impl<'g> Frame<'g> {
    fn new(node: NodeRef<'g>, tab: String) -> Self {
        let mut keys: Vec<&'g str> = node.keys().collect();
        keys.sort_unstable();
        Self { node, tab, keys, key: 0, value: 0 }
    }
}

/// Render `id` into `sink`.
///
/// `max_depth` bounds how many levels below the root are expanded in
/// [`PrintMode::Debug`] and [`PrintMode::Display`].
pub fn print_node<W: fmt::Write + ?Sized>(
    source: &dyn NodeSource,
    id: NodeId,
    sink: &mut W,
    tab: &str,
    mode: PrintMode,
    max_depth: usize,
) -> Result<()> {
    let root = source.get(id)?;
    sink.write_str(tab)?;
    write_header(sink, root, mode)?;
    if root.is_primitive() {
        return Ok(());
    }

    let mut frames = vec![Frame::new(root, tab.to_string())];
    while let Some(frame) = frames.last_mut() {
        let Some(&key) = frame.keys.get(frame.key) else {
            frames.pop();
            continue;
        };
        if frame.value == 0 {
            sink.write_char('\n')?;
            write_property(sink, frame.node, key, &frame.tab, mode)?;
        }
        let values = frame.node.values_for_meta_property_to_many(key);
        let Some(&value) = values.get(frame.value) else {
            frame.key += 1;
            frame.value = 0;
            continue;
        };
        frame.value += 1;
        let parent_tab = frame.tab.clone();
        let child_tab = format!("{parent_tab}{VALUE_INDENT}");

        sink.write_char('\n')?;
        let child = source.get(value)?;
        let on_path = frames.iter().any(|f| f.node.id() == value);
        let depth = frames.len();
        let stub = match mode {
            PrintMode::Full => on_path.then_some(Stub::Cycle),
            PrintMode::Debug | PrintMode::Display => {
                if source.is_excluded(value) || source.is_top_level(value) {
                    Some(Stub::Excluded)
                } else if on_path {
                    Some(Stub::Cycle)
                } else if depth > max_depth {
                    Some(Stub::TooDeep)
                } else {
                    None
                }
            }
        };

        match stub {
            Some(stub) => {
                let too_deep = stub != Stub::Excluded && depth > max_depth;
                write_stub(sink, child, &parent_tab, &child_tab, too_deep, mode, max_depth)?
            }
            None => {
                sink.write_str(&child_tab)?;
                write_header(sink, child, mode)?;
                if !child.is_primitive() {
                    frames.push(Frame::new(child, child_tab));
                }
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Stub {
    Cycle,
    Excluded,
    TooDeep,
}

/// `name instance classifier`; nothing after `instance ` when unclassified.
fn write_header<W: fmt::Write + ?Sized>(sink: &mut W, node: NodeRef<'_>, mode: PrintMode) -> Result<()> {
    write_name(sink, node, mode)?;
    sink.write_str(" instance ")?;
    if let Some(classifier) = node.classifier_ref()? {
        write_name(sink, classifier, mode)?;
    }
    Ok(())
}

fn write_property<W: fmt::Write + ?Sized>(
    sink: &mut W,
    owner: NodeRef<'_>,
    key: &str,
    tab: &str,
    mode: PrintMode,
) -> Result<()> {
    sink.write_str(tab)?;
    sink.write_str(PROPERTY_INDENT)?;
    let key_node = match owner.key_by_name(key) {
        Ok(Some(id)) => owner.graph().node_ref(id),
        _ => None,
    };
    match key_node {
        Some(key_node) => {
            write_name(sink, key_node, mode)?;
            sink.write_char('(')?;
            match key_node.classifier_ref()? {
                Some(classifier) => write_name(sink, classifier, mode)?,
                None => sink.write_str("null")?,
            }
            sink.write_str("):")?;
        }
        None => write!(sink, "{key}(null):")?,
    }
    Ok(())
}

fn write_stub<W: fmt::Write + ?Sized>(
    sink: &mut W,
    value: NodeRef<'_>,
    tab: &str,
    value_tab: &str,
    too_deep: bool,
    mode: PrintMode,
    max_depth: usize,
) -> Result<()> {
    sink.write_str(value_tab)?;
    write_name(sink, value, mode)?;
    sink.write_str(" instance ")?;
    let Some(classifier) = value.classifier_ref()? else {
        sink.write_str("null")?;
        return Ok(());
    };
    write_name(sink, classifier, mode)?;
    if mode == PrintMode::Full {
        write!(sink, "\n{tab}            [...]")?;
    } else if too_deep && value.keys().next().is_some() {
        write!(sink, "\n{tab}            [... >{max_depth}]")?;
    }
    Ok(())
}

fn write_name<W: fmt::Write + ?Sized>(sink: &mut W, node: NodeRef<'_>, mode: PrintMode) -> Result<()> {
    match mode {
        PrintMode::Full => write!(sink, "{}_{}", node.name(), node.id())?,
        PrintMode::Debug | PrintMode::Display => sink.write_str(possibly_replace_anonymous_id(node.name()))?,
    }
    if let Some(source) = node.source_information().filter(|_| mode.with_source()) {
        source.write_debug_suffix(sink)?;
    }
    Ok(())
}
