//! Classification Cache
//!
//! Per-file source text kept alongside the editor documents so analysis can
//! map offsets to positions without touching the editor.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ropey::Rope;

use crate::edit::{EditRecord, Position};

/// Analysis-side mirror of open files.
pub trait ClassifierCache: Send + Sync {
    fn add_file(&self, file_path: &str, contents: &str);

    fn edit_file(&self, file_path: &str, edit: &EditRecord);

    fn set_contents(&self, file_path: &str, contents: &str);

    /// Convert a character offset into a line/column position.
    fn line_and_character_of_position(&self, file_path: &str, offset: usize) -> Option<Position>;
}

/// Rope-backed [`ClassifierCache`].
#[derive(Debug, Default)]
pub struct SourceCache {
    files: Mutex<HashMap<String, Rope>>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> MutexGuard<'_, HashMap<String, Rope>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current text for a file, if it was added.
    pub fn contents(&self, file_path: &str) -> Option<String> {
        self.files().get(file_path).map(|rope| rope.to_string())
    }

    pub fn contains(&self, file_path: &str) -> bool {
        self.files().contains_key(file_path)
    }
}

impl ClassifierCache for SourceCache {
    fn add_file(&self, file_path: &str, contents: &str) {
        self.files()
            .insert(file_path.to_string(), Rope::from_str(contents));
    }

    fn edit_file(&self, file_path: &str, edit: &EditRecord) {
        let mut files = self.files();
        let Some(rope) = files.get_mut(file_path) else {
            log::debug!("Ignoring edit for unknown file {}", file_path);
            return;
        };
        edit.apply_to(rope);
    }

    fn set_contents(&self, file_path: &str, contents: &str) {
        let mut files = self.files();
        match files.get_mut(file_path) {
            Some(rope) => *rope = Rope::from_str(contents),
            None => log::debug!("Ignoring contents for unknown file {}", file_path),
        }
    }

    fn line_and_character_of_position(&self, file_path: &str, offset: usize) -> Option<Position> {
        let files = self.files();
        let rope = files.get(file_path)?;
        let offset = offset.min(rope.len_chars());
        let line = rope.char_to_line(offset);
        Some(Position::new(line, offset - rope.line_to_char(line)))
    }
}
