//! Configuration management for the document cache.
//!
//! Handles:
//! - Command-line argument parsing
//! - User-global and project TOML files
//! - Editing mode selection by file extension

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Name of the per-project configuration file, looked up in the root.
pub const PROJECT_CONFIG_FILE: &str = ".doc-cache.toml";

const DEFAULT_MODE: &str = "typescript";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Command-line arguments for the document cache
#[derive(Debug, Parser)]
#[command(name = "doc-cache")]
#[command(about = "Keep editor documents in sync with files on disk")]
#[command(version)]
pub struct Args {
    /// Directory served to the document cache
    #[arg(long, help = "Root directory (defaults to the current directory)")]
    pub root: Option<PathBuf>,

    /// Log level
    #[arg(long, help = "Log level (trace, debug, info, warn, error)")]
    pub log_level: Option<String>,

    /// Mode for files whose extension has no configured mode
    #[arg(long, help = "Default editing mode (e.g., 'typescript')")]
    pub default_mode: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Open files and log every change until interrupted
    Watch {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Apply a JSON refactoring map and save the touched files
    Refactor {
        refactorings: PathBuf,
        #[arg(long, help = "Apply without writing files back")]
        no_save: bool,
    },
}

/// Contents of a TOML configuration file
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub default_mode: Option<String>,
    pub log_level: Option<String>,
    #[serde(default)]
    pub modes: HashMap<String, String>,
}

impl FileConfig {
    /// Load a config file. A missing file yields `None`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let parsed = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config TOML: {}", path.display()))?;
        Ok(Some(parsed))
    }
}

/// Editing mode lookup by file extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeConfig {
    pub default_mode: String,
    pub by_extension: HashMap<String, String>,
}

impl Default for ModeConfig {
    fn default() -> Self {
        let by_extension = [
            ("ts", "typescript"),
            ("tsx", "typescript"),
            ("js", "javascript"),
            ("jsx", "javascript"),
            ("json", "javascript"),
            ("html", "htmlmixed"),
            ("css", "css"),
            ("md", "markdown"),
        ]
        .into_iter()
        .map(|(ext, mode)| (ext.to_string(), mode.to_string()))
        .collect();

        Self {
            default_mode: DEFAULT_MODE.to_string(),
            by_extension,
        }
    }
}

impl ModeConfig {
    pub fn mode_for(&self, file_path: &str) -> String {
        Path::new(file_path)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.by_extension.get(&ext.to_lowercase()))
            .unwrap_or(&self.default_mode)
            .clone()
    }

    fn merge(&mut self, file: &FileConfig) {
        if let Some(mode) = &file.default_mode {
            self.default_mode = mode.clone();
        }
        for (ext, mode) in &file.modes {
            self.by_extension
                .insert(ext.trim_start_matches('.').to_lowercase(), mode.clone());
        }
    }
}

/// Combined configuration from all sources
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory the file service serves
    pub root: PathBuf,
    pub log_level: String,
    pub modes: ModeConfig,
    pub command: Command,
    /// Project config file, when one was found
    pub project_config_path: Option<PathBuf>,
}

impl Config {
    /// Create configuration from command-line arguments
    pub fn from_args_and_env() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    /// Create configuration from explicit arguments, with the user-global
    /// config from the platform config directory.
    pub fn from_args(args: Args) -> Result<Self> {
        let user_config = dirs::config_dir().map(|dir| dir.join("doc-cache").join("config.toml"));
        Self::resolve(args, user_config.as_deref())
    }

    /// Layer user-global config, project config and CLI flags, in that order.
    pub fn resolve(args: Args, user_config: Option<&Path>) -> Result<Self> {
        let root = match args.root {
            Some(root) => root,
            None => std::env::current_dir().context("Could not determine current directory")?,
        };

        let mut modes = ModeConfig::default();
        let mut log_level = DEFAULT_LOG_LEVEL.to_string();

        if let Some(path) = user_config {
            if let Some(file) = FileConfig::load(path)? {
                log_level = file.log_level.clone().unwrap_or(log_level);
                modes.merge(&file);
            }
        }

        let project_path = root.join(PROJECT_CONFIG_FILE);
        let project = FileConfig::load(&project_path)?;
        if let Some(file) = &project {
            log_level = file.log_level.clone().unwrap_or(log_level);
            modes.merge(file);
        }

        if let Some(mode) = args.default_mode {
            modes.default_mode = mode;
        }
        if let Some(level) = args.log_level {
            log_level = level;
        }

        Ok(Config {
            root,
            log_level,
            modes,
            command: args.command,
            project_config_path: project.map(|_| project_path),
        })
    }

    pub fn has_project_config(&self) -> bool {
        self.project_config_path.is_some()
    }
}
