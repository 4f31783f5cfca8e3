//! Document Cache
//!
//! Client-side document state for a code editor.
//!
//! This library provides:
//! - One canonical document per file, shared through linked views
//! - Edit propagation between documents and a file service, without echoes
//! - A mirror of file contents for source analysis
//! - Refactoring batches applied across files

pub mod cache;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod document;
pub mod edit;
pub mod error;
pub mod refactor;
pub mod service;

// Re-exports for clean public API
pub use cache::DocCache;
pub use classifier::{ClassifierCache, SourceCache};
pub use config::Config;
pub use document::{DocChange, Document, EditorSurface};
pub use edit::{should_forward_to_backend, EditRecord, Origin, Position, SourceId};
pub use error::DocCacheError;
pub use refactor::{Refactoring, RefactoringsByFilePath, TextSpan};
pub use service::{FileService, LocalFileService, OpenFileResponse, ServerEvent};
