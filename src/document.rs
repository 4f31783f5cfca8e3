//! Editor Document Model
//!
//! A rope-backed text buffer with cursors, undo history and linked views.
//!
//! Linked views share one buffer: text, history and change listeners are
//! common to all of them, while every view keeps its own cursor and its own
//! editor attachment. Unlinking a view gives it a private copy of the buffer.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use ropey::Rope;

use crate::edit::{self, Origin, Position};

static NEXT_VIEW_ID: AtomicU64 = AtomicU64::new(1);

fn next_view_id() -> u64 {
    NEXT_VIEW_ID.fetch_add(1, Ordering::SeqCst)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A change applied to a document, as seen by change listeners.
///
/// `from`/`to` are the replaced range in pre-change coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocChange {
    pub from: Position,
    pub to: Position,
    pub text: String,
    pub removed: String,
    pub origin: Origin,
}

pub type ChangeListener = Arc<dyn Fn(&DocChange) + Send + Sync>;

#[derive(Debug, Clone)]
struct HistoryEntry {
    start: usize,
    removed: String,
    inserted: String,
}

#[derive(Debug, Clone, Default)]
struct History {
    done: Vec<HistoryEntry>,
    undone: Vec<HistoryEntry>,
}

struct Buffer {
    text: Rope,
    mode: String,
    history: History,
    listeners: Vec<ChangeListener>,
    cursors: HashMap<u64, Position>,
}

impl Buffer {
    fn new(text: &str, mode: &str) -> Self {
        Self {
            text: Rope::from_str(text),
            mode: mode.to_string(),
            history: History::default(),
            listeners: Vec::new(),
            cursors: HashMap::new(),
        }
    }

    fn line_len(&self, line: usize) -> usize {
        edit::line_len(&self.text, line)
    }

    fn last_line(&self) -> usize {
        self.text.len_lines().saturating_sub(1)
    }

    fn clip(&self, pos: Position) -> Position {
        edit::clip(&self.text, pos)
    }

    fn index_of(&self, pos: Position) -> usize {
        edit::char_index(&self.text, pos)
    }

    fn pos_of(&self, index: usize) -> Position {
        let index = index.min(self.text.len_chars());
        let line = self.text.char_to_line(index);
        Position::new(line, index - self.text.line_to_char(line))
    }

    fn splice(&mut self, start: usize, end: usize, text: &str, origin: Origin) -> (DocChange, HistoryEntry) {
        let from = self.pos_of(start);
        let to = self.pos_of(end);
        let removed = self.text.slice(start..end).to_string();
        let inserted_len = text.chars().count();

        let cursors: Vec<(u64, usize)> = self
            .cursors
            .iter()
            .map(|(id, pos)| (*id, self.index_of(*pos)))
            .collect();

        self.text.remove(start..end);
        self.text.insert(start, text);

        for (id, index) in cursors {
            let mapped = if index < start {
                index
            } else if index <= end {
                start + inserted_len
            } else {
                index - (end - start) + inserted_len
            };
            let pos = self.pos_of(mapped);
            self.cursors.insert(id, pos);
        }

        let entry = HistoryEntry {
            start,
            removed: removed.clone(),
            inserted: text.to_string(),
        };
        let change = DocChange {
            from,
            to,
            text: text.to_string(),
            removed,
            origin,
        };
        (change, entry)
    }

    fn replace(&mut self, text: &str, from: Position, to: Position, origin: Origin) -> DocChange {
        let mut start = self.index_of(from);
        let mut end = self.index_of(to);
        if start > end {
            std::mem::swap(&mut start, &mut end);
        }
        let (change, entry) = self.splice(start, end, text, origin);
        self.history.done.push(entry);
        self.history.undone.clear();
        change
    }

    fn undo(&mut self) -> Option<DocChange> {
        let entry = self.history.done.pop()?;
        let end = entry.start + entry.inserted.chars().count();
        let (change, _) = self.splice(entry.start, end, &entry.removed, Origin::Local);
        self.history.undone.push(entry);
        Some(change)
    }

    fn redo(&mut self) -> Option<DocChange> {
        let entry = self.history.undone.pop()?;
        let end = entry.start + entry.removed.chars().count();
        let (change, _) = self.splice(entry.start, end, &entry.inserted, Origin::Local);
        self.history.done.push(entry);
        Some(change)
    }
}

struct DocInner {
    id: u64,
    file_path: Option<String>,
    buffer: Mutex<Arc<Mutex<Buffer>>>,
    links: Mutex<Vec<Document>>,
    editor: Mutex<Weak<()>>,
}

/// A handle onto a document view. Cloning the handle does not create a new view.
#[derive(Clone)]
pub struct Document {
    inner: Arc<DocInner>,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.inner.id)
            .field("file_path", &self.inner.file_path)
            .field("has_editor", &self.has_editor())
            .finish()
    }
}

impl Document {
    pub fn new(text: &str, mode: &str) -> Self {
        Self::build(None, Arc::new(Mutex::new(Buffer::new(text, mode))))
    }

    /// Create a document tagged with the file it mirrors.
    pub fn for_file(file_path: &str, text: &str, mode: &str) -> Self {
        Self::build(
            Some(file_path.to_string()),
            Arc::new(Mutex::new(Buffer::new(text, mode))),
        )
    }

    fn build(file_path: Option<String>, buffer: Arc<Mutex<Buffer>>) -> Self {
        let id = next_view_id();
        lock(&buffer).cursors.entry(id).or_default();
        Self {
            inner: Arc::new(DocInner {
                id,
                file_path,
                buffer: Mutex::new(buffer),
                links: Mutex::new(Vec::new()),
                editor: Mutex::new(Weak::new()),
            }),
        }
    }

    fn buffer(&self) -> Arc<Mutex<Buffer>> {
        lock(&self.inner.buffer).clone()
    }

    fn read<R>(&self, f: impl FnOnce(&Buffer) -> R) -> R {
        let buffer = self.buffer();
        let guard = lock(&buffer);
        f(&*guard)
    }

    pub fn file_path(&self) -> Option<&str> {
        self.inner.file_path.as_deref()
    }

    pub fn mode(&self) -> String {
        self.read(|buf| buf.mode.clone())
    }

    /// Full text of the document.
    pub fn value(&self) -> String {
        self.read(|buf| buf.text.to_string())
    }

    pub fn line_count(&self) -> usize {
        self.read(|buf| buf.text.len_lines())
    }

    pub fn last_line(&self) -> usize {
        self.read(|buf| buf.last_line())
    }

    /// Text of a line without its line ending.
    pub fn line(&self, line: usize) -> Option<String> {
        self.read(|buf| {
            if line > buf.last_line() {
                return None;
            }
            let len = buf.line_len(line);
            Some(buf.text.line(line).slice(..len).to_string())
        })
    }

    /// Text between two positions, after clipping.
    pub fn range(&self, from: Position, to: Position) -> String {
        self.read(|buf| {
            let a = buf.index_of(from);
            let b = buf.index_of(to);
            buf.text.slice(a.min(b)..a.max(b)).to_string()
        })
    }

    pub fn clip_pos(&self, pos: Position) -> Position {
        self.read(|buf| buf.clip(pos))
    }

    pub fn index_from_pos(&self, pos: Position) -> usize {
        self.read(|buf| buf.index_of(pos))
    }

    pub fn pos_from_index(&self, index: usize) -> Position {
        self.read(|buf| buf.pos_of(index))
    }

    pub fn cursor(&self) -> Position {
        self.read(|buf| buf.cursors.get(&self.inner.id).copied().unwrap_or_default())
    }

    pub fn set_cursor(&self, pos: Position) {
        let buffer = self.buffer();
        let mut buf = lock(&buffer);
        let pos = buf.clip(pos);
        buf.cursors.insert(self.inner.id, pos);
    }

    /// Replace the text between `from` and `to`, then notify change listeners.
    ///
    /// Positions are clipped to the document and swapped if reversed.
    pub fn replace_range(&self, text: &str, from: Position, to: Position, origin: Origin) {
        let buffer = self.buffer();
        let (change, listeners) = {
            let mut buf = lock(&buffer);
            let change = buf.replace(text, from, to, origin);
            (change, buf.listeners.clone())
        };
        notify(&listeners, &change);
    }

    /// Replace the whole text, as a single change.
    pub fn set_value(&self, text: &str, origin: Origin) {
        let end = self.read(|buf| {
            let last = buf.last_line();
            Position::new(last, buf.line_len(last))
        });
        self.replace_range(text, Position::default(), end, origin);
    }

    pub fn undo(&self) -> bool {
        self.step(Buffer::undo)
    }

    pub fn redo(&self) -> bool {
        self.step(Buffer::redo)
    }

    fn step(&self, f: fn(&mut Buffer) -> Option<DocChange>) -> bool {
        let buffer = self.buffer();
        let applied = {
            let mut buf = lock(&buffer);
            f(&mut *buf).map(|change| (change, buf.listeners.clone()))
        };
        match applied {
            Some((change, listeners)) => {
                notify(&listeners, &change);
                true
            }
            None => false,
        }
    }

    pub fn undo_depth(&self) -> usize {
        self.read(|buf| buf.history.done.len())
    }

    pub fn redo_depth(&self) -> usize {
        self.read(|buf| buf.history.undone.len())
    }

    /// Register a listener called after every change to this document or any
    /// view linked to it.
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(&DocChange) + Send + Sync + 'static,
    {
        let buffer = self.buffer();
        lock(&buffer).listeners.push(Arc::new(listener));
    }

    /// Create a new view sharing text and history with this one.
    pub fn linked_doc(&self) -> Document {
        let buffer = self.buffer();
        let cursor = self.cursor();
        let linked = Self::build(self.inner.file_path.clone(), buffer.clone());
        lock(&buffer).cursors.insert(linked.inner.id, cursor);
        lock(&self.inner.links).push(linked.clone());
        linked
    }

    pub fn linked_docs(&self) -> Vec<Document> {
        lock(&self.inner.links).clone()
    }

    /// Detach a linked view. The view keeps its text and history but no
    /// longer shares them. Returns false if `other` was not linked here.
    pub fn unlink_doc(&self, other: &Document) -> bool {
        let removed = {
            let mut links = lock(&self.inner.links);
            match links.iter().position(|doc| doc.same_view(other)) {
                Some(idx) => {
                    links.remove(idx);
                    true
                }
                None => false,
            }
        };
        if !removed {
            return false;
        }

        let shared = self.buffer();
        let detached = {
            let mut buf = lock(&shared);
            let cursor = buf.cursors.remove(&other.inner.id).unwrap_or_default();
            Buffer {
                text: buf.text.clone(),
                mode: buf.mode.clone(),
                history: buf.history.clone(),
                listeners: Vec::new(),
                cursors: HashMap::from([(other.inner.id, cursor)]),
            }
        };
        *lock(&other.inner.buffer) = Arc::new(Mutex::new(detached));
        true
    }

    /// True if both handles refer to the same view.
    pub fn same_view(&self, other: &Document) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// True if both views share text and history.
    pub fn shares_buffer_with(&self, other: &Document) -> bool {
        Arc::ptr_eq(&self.buffer(), &other.buffer())
    }

    /// Bind an editor surface to this view. The view counts as displayed for
    /// as long as the returned guard lives.
    pub fn attach_editor(&self) -> EditorSurface {
        let alive = Arc::new(());
        *lock(&self.inner.editor) = Arc::downgrade(&alive);
        EditorSurface {
            doc: self.clone(),
            _alive: alive,
        }
    }

    pub fn has_editor(&self) -> bool {
        lock(&self.inner.editor).strong_count() > 0
    }
}

fn notify(listeners: &[ChangeListener], change: &DocChange) {
    for listener in listeners {
        listener(change);
    }
}

/// An editor pane showing a document view. Dropping it closes the pane.
#[derive(Debug)]
pub struct EditorSurface {
    doc: Document,
    _alive: Arc<()>,
}

impl EditorSurface {
    pub fn doc(&self) -> &Document {
        &self.doc
    }
}
