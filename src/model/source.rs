//! Source spans attached to nodes.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Location of a modeled element in its source text.
///
/// `line`/`column` is the main position (usually the element's name);
/// `start_*` and `end_*` bound the whole element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceInformation {
    pub source_id: Arc<str>,
    pub start_line: u32,
    pub start_column: u32,
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SourceInformation {
    pub fn new(
        source_id: impl Into<Arc<str>>,
        start_line: u32,
        start_column: u32,
        line: u32,
        column: u32,
        end_line: u32,
        end_column: u32,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            start_line,
            start_column,
            line,
            column,
            end_line,
            end_column,
        }
    }

    /// Span whose main position is its start.
    pub fn spanning(
        source_id: impl Into<Arc<str>>,
        start_line: u32,
        start_column: u32,
        end_line: u32,
        end_column: u32,
    ) -> Self {
        Self::new(source_id, start_line, start_column, start_line, start_column, end_line, end_column)
    }

    /// True if both spans share a source and `other`'s boundaries lie within
    /// (or on) this span's boundaries.
    pub fn subsumes(&self, other: &SourceInformation) -> bool {
        self.source_id == other.source_id
            && is_not_after(self.start_line, self.start_column, other.start_line, other.start_column)
            && is_not_before(self.end_line, self.end_column, other.end_line, other.end_column)
    }

    /// True if both spans share a source and overlap, boundaries included.
    pub fn intersects(&self, other: &SourceInformation) -> bool {
        self.source_id == other.source_id
            && is_not_after(self.start_line, self.start_column, other.end_line, other.end_column)
            && is_not_before(self.end_line, self.end_column, other.start_line, other.start_column)
    }

    /// Start ≤ main ≤ end, with 1-based lines and columns.
    ///
    /// `subsumes` and `intersects` are only meaningful on valid spans.
    pub fn is_valid(&self) -> bool {
        self.start_line >= 1
            && self.start_column >= 1
            && self.column >= 1
            && self.end_column >= 1
            && is_not_before(self.line, self.column, self.start_line, self.start_column)
            && is_not_before(self.end_line, self.end_column, self.line, self.column)
    }

    /// Compact human message: `src:3c4`, `src:3cc4-9` or `src:3c4-5c2`.
    pub fn message(&self) -> String {
        let mut out = String::with_capacity(self.source_id.len() + 16);
        self.write_message(&mut out).ok();
        out
    }

    pub fn write_message<W: fmt::Write + ?Sized>(&self, out: &mut W) -> fmt::Result {
        write!(out, "{}:", self.source_id)?;
        if self.start_line == self.end_line {
            if self.start_column == self.end_column {
                write!(out, "{}c{}", self.start_line, self.start_column)
            } else {
                write!(out, "{}cc{}-{}", self.start_line, self.start_column, self.end_column)
            }
        } else {
            write!(
                out,
                "{}c{}-{}c{}",
                self.start_line, self.start_column, self.end_line, self.end_column
            )
        }
    }

    /// `?[src:startLine,startCol,line,col,endLine,endCol]?`
    pub fn to_m4_string(&self) -> String {
        format!(
            "?[{}:{},{},{},{},{},{}]?",
            self.source_id,
            self.start_line,
            self.start_column,
            self.line,
            self.column,
            self.end_line,
            self.end_column
        )
    }

    /// Suffix used by debug printing: `(src:startLine,startCol,line,col,endLine,endCol)`.
    pub(crate) fn write_debug_suffix<W: fmt::Write + ?Sized>(&self, out: &mut W) -> fmt::Result {
        write!(
            out,
            "({}:{},{},{},{},{},{})",
            self.source_id,
            self.start_line,
            self.start_column,
            self.line,
            self.column,
            self.end_line,
            self.end_column
        )
    }
}

impl fmt::Display for SourceInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_message(f)
    }
}

impl Ord for SourceInformation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.source_id
            .cmp(&other.source_id)
            .then_with(|| compare_positions(self.line, self.column, other.line, other.column))
            .then_with(|| {
                compare_positions(self.start_line, self.start_column, other.start_line, other.start_column)
            })
            .then_with(|| compare_positions(self.end_line, self.end_column, other.end_line, other.end_column))
    }
}

impl PartialOrd for SourceInformation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Positions are assumed to be in the same source.
pub fn compare_positions(line1: u32, col1: u32, line2: u32, col2: u32) -> Ordering {
    line1.cmp(&line2).then(col1.cmp(&col2))
}

pub fn is_before(line1: u32, col1: u32, line2: u32, col2: u32) -> bool {
    compare_positions(line1, col1, line2, col2) == Ordering::Less
}

pub fn is_after(line1: u32, col1: u32, line2: u32, col2: u32) -> bool {
    compare_positions(line1, col1, line2, col2) == Ordering::Greater
}

pub fn is_not_before(line1: u32, col1: u32, line2: u32, col2: u32) -> bool {
    !is_before(line1, col1, line2, col2)
}

pub fn is_not_after(line1: u32, col1: u32, line2: u32, col2: u32) -> bool {
    !is_after(line1, col1, line2, col2)
}
