//! Edit primitives
//!
//! Positions, wire-level edit records and the origin tag that keeps local and
//! remote edits from echoing back and forth.

use ropey::Rope;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A zero-based line/column position. `ch` counts Unicode scalar values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub ch: usize,
}

impl Position {
    pub fn new(line: usize, ch: usize) -> Self {
        Self { line, ch }
    }
}

/// Identifies which side of the connection produced an edit.
///
/// Generated once per file when its document is created and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(Uuid);

impl SourceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A range replacement as exchanged with the file service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRecord {
    pub from: Position,
    pub to: Position,
    pub new_text: String,
    pub source_id: SourceId,
}

impl EditRecord {
    /// Apply this edit to a rope. Positions are clipped the same way a
    /// [`Document`](crate::Document) clips them.
    pub fn apply_to(&self, rope: &mut Rope) {
        let a = char_index(rope, self.from);
        let b = char_index(rope, self.to);
        let (start, end) = (a.min(b), a.max(b));
        rope.remove(start..end);
        rope.insert(start, &self.new_text);
    }
}

fn is_line_break(c: char) -> bool {
    matches!(
        c,
        '\n' | '\r' | '\u{000B}' | '\u{000C}' | '\u{0085}' | '\u{2028}' | '\u{2029}'
    )
}

/// Length of a line in chars, without its line ending.
pub(crate) fn line_len(rope: &Rope, line: usize) -> usize {
    let slice = rope.line(line);
    let n = slice.len_chars();
    if n == 0 {
        return 0;
    }
    let last = slice.char(n - 1);
    if last == '\n' && n >= 2 && slice.char(n - 2) == '\r' {
        n - 2
    } else if is_line_break(last) {
        n - 1
    } else {
        n
    }
}

/// Clamp a position to an existing line and to that line's text.
pub(crate) fn clip(rope: &Rope, pos: Position) -> Position {
    let line = pos.line.min(rope.len_lines().saturating_sub(1));
    Position::new(line, pos.ch.min(line_len(rope, line)))
}

/// Char index of a position after clipping.
pub(crate) fn char_index(rope: &Rope, pos: Position) -> usize {
    let pos = clip(rope, pos);
    rope.line_to_char(pos.line) + pos.ch
}

/// Where a local document mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Typed into an editor, or undo/redo.
    Local,
    /// Replayed from the file service. Carries the tag of the file the
    /// change was replayed into.
    Remote(SourceId),
    /// Part of a refactoring batch.
    Refactor,
}

/// Decide whether a local change must be sent to the file service.
///
/// Changes replayed from the service under the file's own tag are echoes and
/// stay local. Everything else, refactorings included, is forwarded.
pub fn should_forward_to_backend(origin: Origin, local: SourceId) -> bool {
    !matches!(origin, Origin::Remote(tag) if tag == local)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_echo_is_not_forwarded() {
        let local = SourceId::generate();
        assert!(!should_forward_to_backend(Origin::Remote(local), local));
    }

    #[test]
    fn test_local_and_refactor_are_forwarded() {
        let local = SourceId::generate();
        assert!(should_forward_to_backend(Origin::Local, local));
        assert!(should_forward_to_backend(Origin::Refactor, local));
    }

    #[test]
    fn test_foreign_remote_tag_is_forwarded() {
        let local = SourceId::generate();
        let other = SourceId::generate();
        assert_ne!(local, other);
        assert!(should_forward_to_backend(Origin::Remote(other), local));
    }

    #[test]
    fn test_edit_record_wire_format() {
        let edit = EditRecord {
            from: Position::new(0, 1),
            to: Position::new(2, 3),
            new_text: "x".to_string(),
            source_id: SourceId::generate(),
        };
        let json = serde_json::to_value(&edit).unwrap();
        assert_eq!(json["from"]["line"], 0);
        assert_eq!(json["to"]["ch"], 3);
        assert_eq!(json["newText"], "x");
        assert!(json["sourceId"].is_string());

        let back: EditRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, edit);
    }

    #[test]
    fn test_apply_clips_past_line_end() {
        let mut rope = Rope::from_str("ab\ncd");
        edit_at(Position::new(0, 5), "X").apply_to(&mut rope);
        assert_eq!(rope.to_string(), "abX\ncd");

        let mut rope = Rope::from_str("ab\r\ncd");
        edit_at(Position::new(0, 3), "X").apply_to(&mut rope);
        assert_eq!(rope.to_string(), "abX\r\ncd");

        let mut rope = Rope::from_str("ab\ncd");
        edit_at(Position::new(7, 9), "!").apply_to(&mut rope);
        assert_eq!(rope.to_string(), "ab\ncd!");
    }

    #[test]
    fn test_clip_ignores_line_endings() {
        let rope = Rope::from_str("abc\r\nde\u{2028}f");
        assert_eq!(line_len(&rope, 0), 3);
        assert_eq!(line_len(&rope, 1), 2);
        assert_eq!(line_len(&rope, 2), 1);
        assert_eq!(clip(&rope, Position::new(1, 9)), Position::new(1, 2));
        assert_eq!(char_index(&rope, Position::new(1, 9)), 7);
    }

    fn edit_at(at: Position, text: &str) -> EditRecord {
        EditRecord {
            from: at,
            to: at,
            new_text: text.to_string(),
            source_id: SourceId::generate(),
        }
    }
}
