//! File Service
//!
//! The backend side of document synchronization: serves file contents,
//! receives edits and pushes edit and disk-change events to every client.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use ropey::Rope;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::edit::EditRecord;
use crate::error::{DocCacheError, Result};

const EVENT_CAPACITY: usize = 256;

/// File contents as served by [`FileService::open_file`].
///
/// `version` counts the changes applied to the file. Services that track it
/// stamp every event with the version it produced, so a client can drop
/// events already reflected in the contents it opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFileResponse {
    pub contents: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// Notifications pushed by the file service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    DidEdit {
        file_path: String,
        edit: EditRecord,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    SavedFileChangedOnDisk {
        file_path: String,
        contents: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
    },
}

impl ServerEvent {
    pub fn file_path(&self) -> &str {
        match self {
            ServerEvent::DidEdit { file_path, .. } => file_path,
            ServerEvent::SavedFileChangedOnDisk { file_path, .. } => file_path,
        }
    }

    pub fn version(&self) -> Option<u64> {
        match self {
            ServerEvent::DidEdit { version, .. } => *version,
            ServerEvent::SavedFileChangedOnDisk { version, .. } => *version,
        }
    }
}

/// Backend contract consumed by the document cache.
#[async_trait]
pub trait FileService: Send + Sync {
    async fn open_file(&self, file_path: &str) -> Result<OpenFileResponse>;

    /// Send an edit. Fire-and-forget: failures are logged by the service.
    fn edit_file(&self, file_path: &str, edit: EditRecord);

    /// Subscribe to `didEdit` and `savedFileChangedOnDisk` notifications.
    ///
    /// Only events sent after the call are received.
    fn subscribe(&self) -> broadcast::Receiver<ServerEvent>;
}

/// Events from the file watcher
#[derive(Debug)]
enum WatcherEvent {
    FileChanged(PathBuf),
    WatcherError(notify::Error),
}

#[derive(Debug)]
struct WorkingCopy {
    disk_path: PathBuf,
    text: Rope,
    version: u64,
    dirty: bool,
}

/// A [`FileService`] serving files below a root directory.
///
/// Opened files get an in-memory working copy. Edits are applied to it and
/// echoed to all subscribers; [`LocalFileService::save_file`] writes it back.
/// Events are sent while the working copy is locked, so they reach
/// subscribers in version order.
pub struct LocalFileService {
    root: PathBuf,
    files: Mutex<HashMap<String, WorkingCopy>>,
    events: broadcast::Sender<ServerEvent>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl LocalFileService {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root).map_err(|source| DocCacheError::Open {
            path: root.display().to_string(),
            source,
        })?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            root,
            files: Mutex::new(HashMap::new()),
            events,
            watcher: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn files(&self) -> MutexGuard<'_, HashMap<String, WorkingCopy>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve a client path against the root, refusing anything outside it.
    pub fn resolve(&self, file_path: &str) -> Result<PathBuf> {
        let path = Path::new(file_path);
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(DocCacheError::OutsideRoot(file_path.to_string()));
        }
        if path.is_absolute() {
            if path.starts_with(&self.root) {
                Ok(path.to_path_buf())
            } else {
                Err(DocCacheError::OutsideRoot(file_path.to_string()))
            }
        } else {
            Ok(self.root.join(path))
        }
    }

    /// Current working copy of an open file.
    pub fn contents(&self, file_path: &str) -> Option<String> {
        self.files().get(file_path).map(|copy| copy.text.to_string())
    }

    fn snapshot(&self, file_path: &str) -> Option<OpenFileResponse> {
        self.files().get(file_path).map(|copy| OpenFileResponse {
            contents: copy.text.to_string(),
            version: Some(copy.version),
        })
    }

    pub fn is_dirty(&self, file_path: &str) -> bool {
        self.files().get(file_path).is_some_and(|copy| copy.dirty)
    }

    /// Write the working copy of an open file to disk.
    pub async fn save_file(&self, file_path: &str) -> Result<()> {
        let (disk_path, contents) = {
            let files = self.files();
            let copy = files
                .get(file_path)
                .ok_or_else(|| DocCacheError::NotOpen(file_path.to_string()))?;
            (copy.disk_path.clone(), copy.text.to_string())
        };

        tokio::fs::write(&disk_path, &contents)
            .await
            .map_err(|source| DocCacheError::Write {
                path: disk_path.clone(),
                source,
            })?;

        if let Some(copy) = self.files().get_mut(file_path) {
            if copy.text == contents.as_str() {
                copy.dirty = false;
            }
        }
        log::info!("Saved {}", disk_path.display());
        Ok(())
    }

    /// Reconcile an open file with what is on disk.
    ///
    /// Files with unsaved edits are left alone. Returns true when the working
    /// copy was replaced and `SavedFileChangedOnDisk` was sent.
    pub async fn disk_changed(&self, file_path: &str) -> Result<bool> {
        let disk_path = {
            let files = self.files();
            match files.get(file_path) {
                Some(copy) if copy.dirty => {
                    log::debug!("Ignoring disk change for unsaved {}", file_path);
                    return Ok(false);
                }
                Some(copy) => copy.disk_path.clone(),
                None => return Ok(false),
            }
        };

        let contents = tokio::fs::read_to_string(&disk_path)
            .await
            .map_err(|source| DocCacheError::Open {
                path: file_path.to_string(),
                source,
            })?;

        let mut files = self.files();
        let Some(copy) = files.get_mut(file_path) else {
            return Ok(false);
        };
        if copy.dirty || copy.text == contents.as_str() {
            return Ok(false);
        }
        copy.text = Rope::from_str(&contents);
        copy.version += 1;

        log::info!("{} changed on disk", file_path);
        self.broadcast(ServerEvent::SavedFileChangedOnDisk {
            file_path: file_path.to_string(),
            contents,
            version: Some(copy.version),
        });
        Ok(true)
    }

    fn open_paths_for(&self, disk_path: &Path) -> Vec<String> {
        self.files()
            .iter()
            .filter(|(_, copy)| copy.disk_path == disk_path)
            .map(|(file_path, _)| file_path.clone())
            .collect()
    }

    fn broadcast(&self, event: ServerEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    /// Watch the root directory and reconcile open files as they change.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_watching(self: &Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if let EventKind::Create(_) | EventKind::Modify(_) = event.kind {
                        for path in event.paths {
                            let _ = tx.send(WatcherEvent::FileChanged(path));
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(WatcherEvent::WatcherError(e));
                }
            },
            Config::default().with_poll_interval(Duration::from_secs(1)),
        )?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);

        let service = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(service) = service.upgrade() else {
                    break;
                };
                match event {
                    WatcherEvent::FileChanged(path) => {
                        for file_path in service.open_paths_for(&path) {
                            if let Err(e) = service.disk_changed(&file_path).await {
                                log::warn!("Failed to reload {}: {}", file_path, e);
                            }
                        }
                    }
                    WatcherEvent::WatcherError(e) => {
                        log::error!("File watcher error: {}", e);
                    }
                }
            }
        });

        log::info!("Watching {}", self.root.display());
        Ok(())
    }
}

#[async_trait]
impl FileService for LocalFileService {
    async fn open_file(&self, file_path: &str) -> Result<OpenFileResponse> {
        if let Some(opened) = self.snapshot(file_path) {
            return Ok(opened);
        }

        let disk_path = self.resolve(file_path)?;
        let contents = tokio::fs::read_to_string(&disk_path)
            .await
            .map_err(|source| DocCacheError::Open {
                path: file_path.to_string(),
                source,
            })?;

        let mut files = self.files();
        let copy = files
            .entry(file_path.to_string())
            .or_insert_with(|| WorkingCopy {
                disk_path,
                text: Rope::from_str(&contents),
                version: 0,
                dirty: false,
            });
        log::debug!("Opened {}", file_path);
        Ok(OpenFileResponse {
            contents: copy.text.to_string(),
            version: Some(copy.version),
        })
    }

    fn edit_file(&self, file_path: &str, edit: EditRecord) {
        let mut files = self.files();
        let Some(copy) = files.get_mut(file_path) else {
            log::warn!("Dropping edit for {}: file is not open", file_path);
            return;
        };
        edit.apply_to(&mut copy.text);
        copy.version += 1;
        copy.dirty = true;
        self.broadcast(ServerEvent::DidEdit {
            file_path: file_path.to_string(),
            edit,
            version: Some(copy.version),
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::{Position, SourceId};
    use tempfile::TempDir;

    fn edit(from: (usize, usize), to: (usize, usize), text: &str) -> EditRecord {
        EditRecord {
            from: Position::new(from.0, from.1),
            to: Position::new(to.0, to.1),
            new_text: text.to_string(),
            source_id: SourceId::generate(),
        }
    }

    fn service_with(files: &[(&str, &str)]) -> (TempDir, LocalFileService) {
        let dir = TempDir::new().expect("tempdir");
        for (name, contents) in files {
            std::fs::write(dir.path().join(name), contents).expect("write fixture");
        }
        let service = LocalFileService::new(dir.path()).expect("service");
        (dir, service)
    }

    #[tokio::test]
    async fn test_open_missing_file_fails() {
        let (_dir, service) = service_with(&[]);
        let err = service.open_file("missing.ts").await.unwrap_err();
        assert!(matches!(err, DocCacheError::Open { .. }));
    }

    #[tokio::test]
    async fn test_paths_outside_root_are_refused() {
        let (_dir, service) = service_with(&[]);
        assert!(matches!(
            service.open_file("../etc/passwd").await,
            Err(DocCacheError::OutsideRoot(_))
        ));
        assert!(matches!(
            service.open_file("/definitely/not/under/root.ts").await,
            Err(DocCacheError::OutsideRoot(_))
        ));
    }

    #[tokio::test]
    async fn test_edit_is_applied_and_echoed() {
        let (_dir, service) = service_with(&[("a.ts", "let a = 1;")]);
        let mut rx = service.subscribe();

        service.open_file("a.ts").await.expect("open");
        let record = edit((0, 4), (0, 5), "b");
        service.edit_file("a.ts", record.clone());

        assert_eq!(service.contents("a.ts").as_deref(), Some("let b = 1;"));
        assert!(service.is_dirty("a.ts"));
        assert_eq!(
            rx.recv().await.expect("event"),
            ServerEvent::DidEdit {
                file_path: "a.ts".to_string(),
                edit: record,
                version: Some(1),
            }
        );

        // a second open serves the working copy
        let reopened = service.open_file("a.ts").await.expect("reopen");
        assert_eq!(reopened.contents, "let b = 1;");
        assert_eq!(reopened.version, Some(1));
    }

    #[tokio::test]
    async fn test_edit_for_unopened_file_is_dropped() {
        let (_dir, service) = service_with(&[("a.ts", "x")]);
        let mut rx = service.subscribe();
        service.edit_file("a.ts", edit((0, 0), (0, 0), "y"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_save_writes_and_clears_dirty() {
        let (dir, service) = service_with(&[("a.ts", "abc")]);
        service.open_file("a.ts").await.expect("open");
        service.edit_file("a.ts", edit((0, 3), (0, 3), "d"));

        service.save_file("a.ts").await.expect("save");
        assert!(!service.is_dirty("a.ts"));
        let on_disk = std::fs::read_to_string(dir.path().join("a.ts")).expect("read");
        assert_eq!(on_disk, "abcd");

        assert!(matches!(
            service.save_file("b.ts").await,
            Err(DocCacheError::NotOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_disk_change_is_broadcast() {
        let (dir, service) = service_with(&[("a.ts", "old")]);
        service.open_file("a.ts").await.expect("open");
        let mut rx = service.subscribe();

        // unchanged file: nothing to report
        assert!(!service.disk_changed("a.ts").await.expect("reconcile"));

        std::fs::write(dir.path().join("a.ts"), "new").expect("write");
        assert!(service.disk_changed("a.ts").await.expect("reconcile"));
        assert_eq!(service.contents("a.ts").as_deref(), Some("new"));
        assert_eq!(
            rx.recv().await.expect("event"),
            ServerEvent::SavedFileChangedOnDisk {
                file_path: "a.ts".to_string(),
                contents: "new".to_string(),
                version: Some(1),
            }
        );
    }

    #[tokio::test]
    async fn test_disk_change_skips_unsaved_files() {
        let (dir, service) = service_with(&[("a.ts", "old")]);
        service.open_file("a.ts").await.expect("open");
        service.edit_file("a.ts", edit((0, 0), (0, 0), "x"));

        std::fs::write(dir.path().join("a.ts"), "new").expect("write");
        assert!(!service.disk_changed("a.ts").await.expect("reconcile"));
        assert_eq!(service.contents("a.ts").as_deref(), Some("xold"));
    }

    #[test]
    fn test_server_event_wire_format() {
        let event = ServerEvent::SavedFileChangedOnDisk {
            file_path: "a.ts".to_string(),
            contents: "x".to_string(),
            version: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "savedFileChangedOnDisk");
        assert_eq!(json["filePath"], "a.ts");
        assert!(json.get("version").is_none());
        assert_eq!(event.file_path(), "a.ts");

        let back: ServerEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
