//! Refactoring Batches
//!
//! Text replacements computed by analysis, grouped by file.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A character-offset span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSpan {
    pub start: usize,
    pub length: usize,
}

impl TextSpan {
    /// End offset, saturating at `usize::MAX`. Offsets past the end of the
    /// text are clipped when the span is resolved.
    pub fn end(&self) -> usize {
        self.start.saturating_add(self.length)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Refactoring {
    pub span: TextSpan,
    pub new_text: String,
}

/// Changes per file, applied in list order within a file.
pub type RefactoringsByFilePath = BTreeMap<String, Vec<Refactoring>>;

pub fn parse_refactorings(json: &str) -> Result<RefactoringsByFilePath> {
    Ok(serde_json::from_str(json)?)
}

pub async fn load_refactorings(path: &Path) -> anyhow::Result<RefactoringsByFilePath> {
    use anyhow::Context;

    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading refactorings from {:?}", path))?;
    Ok(parse_refactorings(&json)?)
}
