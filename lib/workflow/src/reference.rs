//! Reference syntax.
//!
//! Configuration text refers to other values with `<head.path>`:
//! - `<agent1.content>`: a block output, by normalized block name
//! - `<variable.apiKey>`: a workflow variable
//! - `<loop.index>`, `<parallel.currentItem>`: container context
//!
//! Path segments are keys separated by dots, optionally followed by `[n]`
//! array indices (`<api.data.items[0].id>`).
//!
//! This module also implements the editor contract for inserting a selected
//! tag at the cursor. Cursor positions there are counted in characters.

use crate::container::{LOOP_NAMESPACE, PARALLEL_NAMESPACE};
use crate::variable::VARIABLE_NAMESPACE;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opening delimiter of a reference.
pub const OPEN: char = '<';
/// Closing delimiter of a reference.
pub const CLOSE: char = '>';

/// What a reference starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceRoot {
    /// A block, by normalized name.
    Block(String),
    /// A workflow variable, by name.
    Variable(String),
    /// The nearest enclosing loop.
    Loop,
    /// The nearest enclosing parallel.
    Parallel,
}

/// One step of a reference path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, ".{key}"),
            Self::Index(index) => write!(f, "[{index}]"),
        }
    }
}

/// A parsed reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub root: ReferenceRoot,
    pub path: Vec<PathSegment>,
}

impl Reference {
    /// Parses the text between the delimiters.
    ///
    /// Returns `None` for text that cannot be a reference (whitespace, empty
    /// segments, unbalanced brackets, a bare namespace).
    #[must_use]
    pub fn parse(body: &str) -> Option<Self> {
        let mut segments = parse_segments(body)?.into_iter();
        let Some(PathSegment::Key(head)) = segments.next() else {
            return None;
        };

        let root = match head.as_str() {
            VARIABLE_NAMESPACE => match segments.next()? {
                PathSegment::Key(name) => ReferenceRoot::Variable(name),
                PathSegment::Index(_) => return None,
            },
            LOOP_NAMESPACE => ReferenceRoot::Loop,
            PARALLEL_NAMESPACE => ReferenceRoot::Parallel,
            _ => ReferenceRoot::Block(head),
        };

        let path: Vec<PathSegment> = segments.collect();
        if matches!(root, ReferenceRoot::Loop | ReferenceRoot::Parallel) && path.is_empty() {
            return None;
        }
        Some(Self { root, path })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.root {
            ReferenceRoot::Block(name) => write!(f, "{name}")?,
            ReferenceRoot::Variable(name) => write!(f, "{VARIABLE_NAMESPACE}.{name}")?,
            ReferenceRoot::Loop => f.write_str(LOOP_NAMESPACE)?,
            ReferenceRoot::Parallel => f.write_str(PARALLEL_NAMESPACE)?,
        }
        for segment in &self.path {
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

fn is_key_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn parse_segments(body: &str) -> Option<Vec<PathSegment>> {
    if body.is_empty() {
        return None;
    }
    let mut segments = Vec::new();
    for part in body.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(bracket) => part.split_at(bracket),
            None => (part, ""),
        };
        if key.is_empty() || !key.chars().all(is_key_char) {
            return None;
        }
        segments.push(PathSegment::Key(key.to_string()));

        while !rest.is_empty() {
            let inner = rest.strip_prefix('[')?;
            let close = inner.find(']')?;
            let index = inner[..close].parse().ok()?;
            segments.push(PathSegment::Index(index));
            rest = &inner[close + 1..];
        }
    }
    Some(segments)
}

/// A reference found in text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSpan {
    /// Byte offset of the opening delimiter.
    pub start: usize,
    /// Byte offset just past the closing delimiter.
    pub end: usize,
    pub reference: Reference,
}

/// Finds every well-formed reference in `text`, left to right.
///
/// Text between delimiters that does not parse (such as `a < b > c`) is left
/// alone.
#[must_use]
pub fn find_references(text: &str) -> Vec<ReferenceSpan> {
    let mut spans = Vec::new();
    let mut from = 0;
    while let Some(offset) = text[from..].find(OPEN) {
        let start = from + offset;
        let body_start = start + OPEN.len_utf8();
        let Some(length) = text[body_start..].find(CLOSE) else {
            break;
        };
        let body_end = body_start + length;
        match Reference::parse(&text[body_start..body_end]) {
            Some(reference) => {
                let end = body_end + CLOSE.len_utf8();
                spans.push(ReferenceSpan {
                    start,
                    end,
                    reference,
                });
                from = end;
            }
            None => from = body_start,
        }
    }
    spans
}

/// Result of inserting a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insertion {
    pub text: String,
    /// Cursor position after the inserted tag, in characters.
    pub cursor: usize,
}

/// Character position of the nearest unterminated `<` before `cursor`.
///
/// A `>` between that `<` and the cursor terminates it.
#[must_use]
pub fn open_delimiter_before(text: &str, cursor: usize) -> Option<usize> {
    let before: Vec<char> = text.chars().take(cursor).collect();
    let open = before.iter().rposition(|&c| c == OPEN)?;
    let terminated = before[open + 1..].contains(&CLOSE);
    (!terminated).then_some(open)
}

/// Returns true for text that could be the unfinished tail of a reference.
#[must_use]
pub fn is_partial_reference(text: &str) -> bool {
    text.chars()
        .all(|c| is_key_char(c) || matches!(c, '.' | '[' | ']'))
}

/// Inserts `tag` for a selection made at `cursor`.
///
/// Replaces everything from the nearest unterminated `<` up to the cursor.
/// When the text after the cursor already holds the rest of a reference
/// followed by `>`, that is replaced too. Returns `None` when there is no
/// opening delimiter to complete.
#[must_use]
pub fn insert_tag(text: &str, cursor: usize, tag: &str) -> Option<Insertion> {
    let chars: Vec<char> = text.chars().collect();
    let cursor = cursor.min(chars.len());
    let open = open_delimiter_before(text, cursor)?;

    let after: String = chars[cursor..].iter().collect();
    let replace_end = match after.find(CLOSE) {
        Some(close) if is_partial_reference(&after[..close]) => {
            cursor + after[..close].chars().count() + 1
        }
        _ => cursor,
    };

    let mut result: String = chars[..open].iter().collect();
    result.push(OPEN);
    result.push_str(tag);
    result.push(CLOSE);
    let new_cursor = open + tag.chars().count() + 2;
    result.extend(&chars[replace_end..]);

    Some(Insertion {
        text: result,
        cursor: new_cursor,
    })
}
