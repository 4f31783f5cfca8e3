use anyhow::{Context, Result};
use std::sync::Arc;

use crate::classifier::SourceCache;
use crate::config::{Command, Config};
use crate::document::EditorSurface;
use crate::refactor::load_refactorings;
use crate::service::LocalFileService;
use crate::DocCache;

/// Run the `doc-cache` command line.
pub async fn run() -> Result<()> {
    let config = Config::from_args_and_env()?;
    init_logging(&config.log_level);

    if let Some(path) = &config.project_config_path {
        log::info!("Using project config {}", path.display());
    }

    let service = Arc::new(
        LocalFileService::new(&config.root)
            .with_context(|| format!("Cannot serve {}", config.root.display()))?,
    );
    let cache = DocCache::new(service.clone(), Arc::new(SourceCache::new()))
        .with_modes(config.modes.clone());

    match &config.command {
        Command::Watch { files } => watch(&cache, &service, files).await,
        Command::Refactor {
            refactorings,
            no_save,
        } => {
            let refactorings = load_refactorings(refactorings).await?;
            cache.apply_refactorings(&refactorings).await?;
            if !no_save {
                for file_path in refactorings.keys() {
                    service.save_file(file_path).await?;
                }
            }
            Ok(())
        }
    }
}

fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

async fn watch(cache: &DocCache, service: &Arc<LocalFileService>, files: &[String]) -> Result<()> {
    service.start_watching()?;

    let mut editors: Vec<EditorSurface> = Vec::new();
    for file_path in files {
        let view = cache.get_linked_doc(file_path).await?;
        let label = file_path.clone();
        view.on_change(move |change| {
            log::info!(
                "{}: {:?} {}:{}-{}:{} ({} chars)",
                label,
                change.origin,
                change.from.line,
                change.from.ch,
                change.to.line,
                change.to.ch,
                change.text.chars().count()
            );
        });
        log::info!("{}: {} lines, mode {}", file_path, view.line_count(), view.mode());
        editors.push(view.attach_editor());
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Closing {} editors", editors.len());
    Ok(())
}
