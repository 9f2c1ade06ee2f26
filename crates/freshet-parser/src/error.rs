//! Parser error type
//!
//! Parse errors carry the source position (1-based line and column) and a
//! snippet of up to 50 characters around the offending span, with a caret
//! marking the exact spot.

use freshet_core::Span;
use std::fmt;

const SNIPPET_WIDTH: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
    pub snippet: String,
    /// Caret position within the snippet, in characters.
    pub caret: usize,
}

pub type ParseResult<T> = Result<T, ParseError>;

impl ParseError {
    pub fn new(source: &str, span: Span, message: impl Into<String>) -> Self {
        let (line, column) = span.line_col(source);
        let (snippet, caret) = snippet_around(source, span.start);
        Self {
            message: message.into(),
            line,
            column,
            snippet,
            caret,
        }
    }
}

fn snippet_around(source: &str, at: usize) -> (String, usize) {
    let at = at.min(source.len());
    let line_start = source[..at].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let line_end = source[at..]
        .find('\n')
        .map(|i| at + i)
        .unwrap_or(source.len());
    let line = &source[line_start..line_end];
    let col = at - line_start;

    // Clip the line to a window of SNIPPET_WIDTH characters around the caret.
    let chars: Vec<char> = line.chars().collect();
    let caret_char = line[..col].chars().count();
    let start = caret_char.saturating_sub(SNIPPET_WIDTH / 2);
    let end = (start + SNIPPET_WIDTH).min(chars.len());
    let snippet: String = chars[start..end].iter().collect();
    (snippet, caret_char - start)
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "parse error at line {}, column {}: {}",
            self.line, self.column, self.message
        )?;
        writeln!(f, "  {}", self.snippet)?;
        write!(f, "  {}^", " ".repeat(self.caret))
    }
}

impl std::error::Error for ParseError {}
