//! Document Cache
//!
//! One canonical [`Document`] per file path, kept in sync with the file
//! service and the classification cache. Consumers get linked views so they
//! share undo history with every other pane showing the same file.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, OnceCell};

use crate::classifier::ClassifierCache;
use crate::config::ModeConfig;
use crate::document::Document;
use crate::edit::{should_forward_to_backend, EditRecord, Origin, Position, SourceId};
use crate::error::{DocCacheError, Result};
use crate::refactor::RefactoringsByFilePath;
use crate::service::{FileService, ServerEvent};

#[derive(Debug, Clone)]
struct CachedDoc {
    doc: Document,
    source_id: SourceId,
}

/// Registry of canonical documents keyed by file path.
///
/// Documents are created on first request and kept for the lifetime of the
/// cache. Concurrent first requests for one path share a single `open_file`.
pub struct DocCache {
    service: Arc<dyn FileService>,
    classifier: Arc<dyn ClassifierCache>,
    modes: ModeConfig,
    docs: Mutex<HashMap<String, Arc<OnceCell<CachedDoc>>>>,
}

impl DocCache {
    pub fn new(service: Arc<dyn FileService>, classifier: Arc<dyn ClassifierCache>) -> Self {
        Self {
            service,
            classifier,
            modes: ModeConfig::default(),
            docs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_modes(mut self, modes: ModeConfig) -> Self {
        self.modes = modes;
        self
    }

    /// Get a new view of the document for `file_path`, sharing history with
    /// the canonical document.
    ///
    /// Views whose editor surface has been closed are unlinked first. A view
    /// without an editor counts as closed, so attach one with
    /// [`Document::attach_editor`] before requesting another view of the same
    /// file.
    pub async fn get_linked_doc(&self, file_path: &str) -> Result<Document> {
        let doc = self.get_or_create_doc(file_path).await?;

        let stale: Vec<Document> = doc
            .linked_docs()
            .into_iter()
            .filter(|linked| !linked.has_editor())
            .collect();
        for linked in &stale {
            doc.unlink_doc(linked);
        }
        if !stale.is_empty() {
            log::debug!("Unlinked {} closed views of {}", stale.len(), file_path);
        }

        Ok(doc.linked_doc())
    }

    /// Get the canonical document for `file_path`, opening it if needed.
    ///
    /// Edits made through the returned handle are sent to the file service;
    /// editors should work on [`DocCache::get_linked_doc`] views instead.
    pub async fn get_or_create_doc(&self, file_path: &str) -> Result<Document> {
        let cell = {
            let mut docs = self.docs.lock().await;
            docs.entry(file_path.to_string()).or_default().clone()
        };
        let cached = cell.get_or_try_init(|| self.create_doc(file_path)).await?;
        Ok(cached.doc.clone())
    }

    /// Open several documents concurrently. Fails if any of them fails.
    pub async fn get_or_create_docs<'a, I>(&self, file_paths: I) -> Result<HashMap<String, Document>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let pending = file_paths.into_iter().map(|file_path| async move {
            let doc = self.get_or_create_doc(file_path).await?;
            Ok::<_, DocCacheError>((file_path.to_string(), doc))
        });
        let docs = futures::future::try_join_all(pending).await?;
        Ok(docs.into_iter().collect())
    }

    /// Apply refactorings to the affected documents.
    ///
    /// Every document is obtained before any change is made. Files are then
    /// processed in path order, changes within a file in list order. Spans are
    /// resolved against the classification cache as it stands when each change
    /// is applied, so callers must order changes so later spans stay valid.
    pub async fn apply_refactorings(&self, refactorings: &RefactoringsByFilePath) -> Result<()> {
        let docs = self
            .get_or_create_docs(refactorings.keys().map(String::as_str))
            .await?;

        for (file_path, changes) in refactorings {
            let Some(doc) = docs.get(file_path) else {
                continue;
            };
            for change in changes {
                let from = self.position_of(file_path, change.span.start)?;
                let to = self.position_of(file_path, change.span.end())?;
                doc.replace_range(&change.new_text, from, to, Origin::Refactor);
            }
            log::info!("Applied {} refactorings to {}", changes.len(), file_path);
        }
        Ok(())
    }

    fn position_of(&self, file_path: &str, offset: usize) -> Result<Position> {
        self.classifier
            .line_and_character_of_position(file_path, offset)
            .ok_or_else(|| DocCacheError::UnknownFile(file_path.to_string()))
    }

    /// The source id tagging edits made to `file_path`, once it is open.
    pub async fn source_id(&self, file_path: &str) -> Option<SourceId> {
        let docs = self.docs.lock().await;
        docs.get(file_path)?.get().map(|cached| cached.source_id)
    }

    pub async fn contains(&self, file_path: &str) -> bool {
        self.source_id(file_path).await.is_some()
    }

    /// Paths with a live document, sorted.
    pub async fn cached_paths(&self) -> Vec<String> {
        let docs = self.docs.lock().await;
        let mut paths: Vec<String> = docs
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    async fn create_doc(&self, file_path: &str) -> Result<CachedDoc> {
        // subscribe first so nothing sent while the file opens is missed
        let events = self.service.subscribe();
        let opened = self.service.open_file(file_path).await?;
        let source_id = SourceId::generate();

        self.classifier.add_file(file_path, &opened.contents);

        let mode = self.modes.mode_for(file_path);
        let doc = Document::for_file(file_path, &opened.contents, &mode);

        self.forward_local_changes(&doc, file_path, source_id);
        let sync = RemoteSync {
            file_path: file_path.to_string(),
            source_id,
            opened_version: opened.version,
            doc: doc.clone(),
            classifier: self.classifier.clone(),
        };
        follow_server_events(events, sync);

        log::debug!("Created {} document for {} ({})", mode, file_path, source_id);
        Ok(CachedDoc { doc, source_id })
    }

    /// Send local changes to the classification cache and the file service.
    fn forward_local_changes(&self, doc: &Document, file_path: &str, source_id: SourceId) {
        let service = self.service.clone();
        let classifier = self.classifier.clone();
        let file_path = file_path.to_string();

        doc.on_change(move |change| {
            if !should_forward_to_backend(change.origin, source_id) {
                return;
            }
            let edit = EditRecord {
                from: change.from,
                to: change.to,
                new_text: change.text.clone(),
                source_id,
            };
            classifier.edit_file(&file_path, &edit);
            service.edit_file(&file_path, edit);
        });
    }
}

/// Replay server notifications for one file into its document.
fn follow_server_events(mut events: broadcast::Receiver<ServerEvent>, sync: RemoteSync) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => sync.handle(&event),
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("{}: missed {} server events", sync.file_path, missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Applies server notifications for one file to its document.
pub(crate) struct RemoteSync {
    file_path: String,
    source_id: SourceId,
    /// Version of the contents the document was created from.
    opened_version: Option<u64>,
    doc: Document,
    classifier: Arc<dyn ClassifierCache>,
}

impl RemoteSync {
    pub(crate) fn handle(&self, event: &ServerEvent) {
        if event.file_path() != self.file_path {
            return;
        }
        if let (Some(seen), Some(opened)) = (event.version(), self.opened_version) {
            if seen <= opened {
                log::trace!("{}: skipping event for version {}", self.file_path, seen);
                return;
            }
        }
        match event {
            ServerEvent::DidEdit { edit, .. } => self.apply_remote_edit(edit),
            ServerEvent::SavedFileChangedOnDisk { contents, .. } => self.reload(contents),
        }
    }

    fn apply_remote_edit(&self, edit: &EditRecord) {
        // our own edit coming back
        if edit.source_id == self.source_id {
            return;
        }
        self.classifier.edit_file(&self.file_path, edit);
        self.doc.replace_range(
            &edit.new_text,
            edit.from,
            edit.to,
            Origin::Remote(self.source_id),
        );
    }

    fn reload(&self, contents: &str) {
        if self.doc.value() == contents {
            return;
        }
        self.classifier.set_contents(&self.file_path, contents);

        let views: Vec<Document> = std::iter::once(self.doc.clone())
            .chain(self.doc.linked_docs())
            .collect();
        let cursors: Vec<_> = views.iter().map(Document::cursor).collect();

        self.doc.set_value(contents, Origin::Remote(self.source_id));

        for (view, cursor) in views.iter().zip(cursors) {
            view.set_cursor(cursor);
        }
        log::debug!("Reloaded {} from disk", self.file_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::SourceCache;

    fn remote_sync(text: &str) -> (RemoteSync, Arc<SourceCache>) {
        let classifier = Arc::new(SourceCache::new());
        classifier.add_file("a.ts", text);
        let sync = RemoteSync {
            file_path: "a.ts".to_string(),
            source_id: SourceId::generate(),
            opened_version: Some(2),
            doc: Document::for_file("a.ts", text, "typescript"),
            classifier: classifier.clone(),
        };
        (sync, classifier)
    }

    fn did_edit(file_path: &str, source_id: SourceId, text: &str) -> ServerEvent {
        ServerEvent::DidEdit {
            file_path: file_path.to_string(),
            edit: EditRecord {
                from: Position::new(0, 0),
                to: Position::new(0, 0),
                new_text: text.to_string(),
                source_id,
            },
            version: None,
        }
    }

    #[test]
    fn test_foreign_edit_is_replayed_with_local_tag() {
        let (sync, classifier) = remote_sync("abc");
        let origins = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = origins.clone();
        sync.doc
            .on_change(move |change| sink.lock().unwrap().push(change.origin));

        sync.handle(&did_edit("a.ts", SourceId::generate(), "x"));

        assert_eq!(sync.doc.value(), "xabc");
        assert_eq!(classifier.contents("a.ts").as_deref(), Some("xabc"));
        assert_eq!(*origins.lock().unwrap(), vec![Origin::Remote(sync.source_id)]);
    }

    #[test]
    fn test_edit_past_line_end_keeps_classifier_in_step() {
        for (text, ch, expected) in [
            ("ab\ncd", 5, "abX\ncd"),
            ("ab\r\ncd", 3, "abX\r\ncd"),
            ("ab\r\ncd", 4, "abX\r\ncd"),
        ] {
            let (sync, classifier) = remote_sync(text);
            sync.handle(&ServerEvent::DidEdit {
                file_path: "a.ts".to_string(),
                edit: EditRecord {
                    from: Position::new(0, ch),
                    to: Position::new(0, ch),
                    new_text: "X".to_string(),
                    source_id: SourceId::generate(),
                },
                version: None,
            });

            assert_eq!(sync.doc.value(), expected);
            assert_eq!(classifier.contents("a.ts"), Some(sync.doc.value()));
        }
    }

    #[test]
    fn test_events_already_in_opened_contents_are_skipped() {
        let (sync, classifier) = remote_sync("abc");
        let stale = |version| ServerEvent::DidEdit {
            file_path: "a.ts".to_string(),
            edit: EditRecord {
                from: Position::new(0, 0),
                to: Position::new(0, 0),
                new_text: "x".to_string(),
                source_id: SourceId::generate(),
            },
            version: Some(version),
        };

        sync.handle(&stale(1));
        sync.handle(&stale(2));
        assert_eq!(sync.doc.value(), "abc");

        sync.handle(&stale(3));
        assert_eq!(sync.doc.value(), "xabc");
        assert_eq!(classifier.contents("a.ts").as_deref(), Some("xabc"));
    }

    #[test]
    fn test_own_edit_is_ignored() {
        let (sync, classifier) = remote_sync("abc");
        sync.handle(&did_edit("a.ts", sync.source_id, "x"));
        assert_eq!(sync.doc.value(), "abc");
        assert_eq!(classifier.contents("a.ts").as_deref(), Some("abc"));
    }

    #[test]
    fn test_other_files_are_ignored() {
        let (sync, _) = remote_sync("abc");
        sync.handle(&did_edit("b.ts", SourceId::generate(), "x"));
        sync.handle(&ServerEvent::SavedFileChangedOnDisk {
            file_path: "b.ts".to_string(),
            contents: "zzz".to_string(),
            version: None,
        });
        assert_eq!(sync.doc.value(), "abc");
    }

    #[test]
    fn test_reload_restores_every_view_cursor() {
        let (sync, classifier) = remote_sync("one\ntwo\nthree");
        let view = sync.doc.linked_doc();
        sync.doc.set_cursor(Position::new(1, 2));
        view.set_cursor(Position::new(2, 1));

        sync.handle(&ServerEvent::SavedFileChangedOnDisk {
            file_path: "a.ts".to_string(),
            contents: "ONE\nTWO\nTHREE\nFOUR".to_string(),
            version: None,
        });

        assert_eq!(sync.doc.value(), "ONE\nTWO\nTHREE\nFOUR");
        assert_eq!(
            classifier.contents("a.ts").as_deref(),
            Some("ONE\nTWO\nTHREE\nFOUR")
        );
        assert_eq!(sync.doc.cursor(), Position::new(1, 2));
        assert_eq!(view.cursor(), Position::new(2, 1));
    }
}
