//! Source text with a line index.
//!
//! The lexer works on byte offsets; editors want 1-based line/column
//! positions. `SourceCode` keeps both views together so every span handed
//! to diagnostics can be highlighted without re-scanning the text.

use serde::Serialize;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;

/// Location of an AST node: byte range plus 1-based line/column of its start.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: u32,
    pub column: u32,
}

impl Span {
    pub fn new(start: usize, end: usize, line: u32, column: u32) -> Self {
        Self {
            start,
            end,
            line,
            column,
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Smallest span covering both `self` and `other`.
    pub fn to(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            line: self.line,
            column: self.column,
        }
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// Wrapper around source code that can be cheaply cloned.
#[derive(Clone)]
pub struct SourceCode {
    text: Rc<str>,
    /// Byte offset of the first character of every line.
    line_starts: Rc<[usize]>,
}

impl SourceCode {
    pub fn new(text: &str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(index, _)| index + 1))
            .collect();
        Self {
            text: text.into(),
            line_starts,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// 1-based (line, column) of a byte offset. Columns count characters.
    pub fn line_col(&self, offset: usize) -> (u32, u32) {
        let offset = offset.min(self.text.len());
        let line_index = match self.line_starts.binary_search(&offset) {
            Ok(index) => index,
            Err(index) => index - 1,
        };
        let line_start = self.line_starts[line_index];
        let column = self.text[line_start..offset].chars().count() + 1;
        (line_index as u32 + 1, column as u32)
    }

    /// Span for a byte range of this source.
    pub fn span(&self, range: Range<usize>) -> Span {
        let (line, column) = self.line_col(range.start);
        Span::new(range.start, range.end, line, column)
    }

    /// Zero-width span at the end of the text, used for "unexpected end" errors.
    pub fn end_span(&self) -> Span {
        self.span(self.text.len()..self.text.len())
    }
}

impl fmt::Debug for SourceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceCode({} bytes)", self.text.len())
    }
}
