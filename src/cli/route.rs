//! CLI route: single route table and run context. Dispatches to the pipeline, caches, and
//! progress log, then hands results to presentation.

use crate::cache::{DurableStore, SledCacheStore, TieredCache};
use crate::config::{ConfigLoader, CopylineConfig};
use crate::error::ApiError;
use crate::pipeline::{HttpStageWorker, PipelineOrchestrator};
use crate::progress::{spawn_stream_writer, ProgressLog, ProgressSink, SseSink};
use crate::types::{now_millis, GenerationRequest, PipelineProfile};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::parse::{CacheCommands, Commands, ProgressCommands};
use crate::cli::presentation::{
    format_cache_stats, format_pipeline_state, format_progress_events, format_prune_report,
};

/// Runtime context for CLI execution: workspace, resolved config, and storage locations.
/// Built from workspace path and optional config path using ConfigLoader only.
pub struct RunContext {
    config: CopylineConfig,
    workspace_root: PathBuf,
    cache_path: PathBuf,
    progress_path: PathBuf,
}

struct GenerateArgs<'a> {
    product: &'a str,
    content: Option<&'a str>,
    content_file: Option<&'a Path>,
    keywords: &'a [String],
    language: &'a str,
    profile: &'a str,
    launch_date: Option<NaiveDate>,
    stream: bool,
    format: &'a str,
}

impl RunContext {
    /// Create run context from workspace root and optional config path. Uses ConfigLoader only.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, ApiError> {
        let config = if let Some(ref cfg_path) = config_path {
            ConfigLoader::load_from_file(cfg_path)?
        } else {
            ConfigLoader::load(&workspace_root)?
        };
        config.ensure_valid()?;

        let cache_path = resolve_path(&workspace_root, &config.storage.cache_path);
        let progress_path = resolve_path(&workspace_root, &config.storage.progress_path);

        Ok(Self {
            config,
            workspace_root,
            cache_path,
            progress_path,
        })
    }

    pub fn config(&self) -> &CopylineConfig {
        &self.config
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Execute a command and return its rendered output.
    pub fn execute(&self, command: &Commands) -> Result<String, ApiError> {
        let started = Instant::now();
        let result = match command {
            Commands::Generate {
                product,
                content,
                content_file,
                keywords,
                language,
                profile,
                launch_date,
                no_stream,
                format,
            } => self.handle_generate(GenerateArgs {
                product,
                content: content.as_deref(),
                content_file: content_file.as_deref(),
                keywords,
                language,
                profile,
                launch_date: *launch_date,
                stream: !no_stream,
                format,
            }),
            Commands::Cache { command } => self.handle_cache(command),
            Commands::Progress { command } => self.handle_progress(command),
        };
        info!(
            command = command_name(command),
            ok = result.is_ok(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Command finished"
        );
        result
    }

    fn handle_generate(&self, args: GenerateArgs<'_>) -> Result<String, ApiError> {
        let content = match (args.content, args.content_file) {
            (Some(text), _) => text.to_string(),
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                ApiError::Validation(format!("Cannot read {}: {}", path.display(), e))
            })?,
            (None, None) => {
                return Err(ApiError::Validation(
                    "either --content or --content-file is required".to_string(),
                ))
            }
        };
        let profile: PipelineProfile = args.profile.parse()?;
        let request = GenerationRequest::builder(args.product, content)
            .keywords(args.keywords.iter().cloned())
            .language(args.language)
            .profile(profile)
            .launch_date(args.launch_date)
            .build()?;

        let runtime = new_runtime()?;
        let state = runtime.block_on(async {
            let cache = self.open_cache()?;
            let worker = Arc::new(HttpStageWorker::new(&self.config.worker)?);
            let orchestrator = Arc::new(PipelineOrchestrator::from_config(
                worker,
                Arc::clone(&cache),
                &self.config,
            ));

            let pruner_cancel = CancellationToken::new();
            let pruner = cache.spawn_pruner(pruner_cancel.clone());

            let mut sinks: Vec<Box<dyn ProgressSink>> = vec![Box::new(self.open_progress_log()?)];
            if args.stream {
                sinks.push(Box::new(SseSink::new(std::io::stdout())));
            }

            let (run, events) = orchestrator.start(request);
            let writer = spawn_stream_writer(events, sinks);
            let state = run.wait().await?;
            match writer.await {
                Ok(delivered) => info!(delivered, "Progress stream drained"),
                Err(err) => warn!(error = %err, "Progress stream writer panicked"),
            }

            pruner_cancel.cancel();
            if let Err(err) = pruner.await {
                warn!(error = %err, "Cache pruner did not shut down cleanly");
            }
            Ok::<_, ApiError>(state)
        })?;

        format_pipeline_state(&state, args.format)
    }

    fn handle_cache(&self, command: &CacheCommands) -> Result<String, ApiError> {
        let cache = self.open_cache()?;
        match command {
            CacheCommands::Stats { format } => format_cache_stats(&cache.stats(), format),
            CacheCommands::Prune => Ok(format_prune_report(&cache.prune())),
            CacheCommands::Clear => {
                let removed = cache.clear();
                Ok(format!("Cleared {} cache entries", removed))
            }
            CacheCommands::Invalidate { product } => {
                let removed = cache.invalidate_product(product);
                Ok(format!("Invalidated {} entries for {}", removed, product))
            }
        }
    }

    fn handle_progress(&self, command: &ProgressCommands) -> Result<String, ApiError> {
        let log = self.open_progress_log()?;
        match command {
            ProgressCommands::Replay {
                generation_key,
                after,
                format,
            } => {
                let events = log.read_events_after(generation_key, *after)?;
                format_progress_events(&events, format)
            }
            ProgressCommands::Prune { max_age_secs } => {
                let removed = log.prune_finished(max_age_secs.saturating_mul(1000), now_millis())?;
                log.flush()?;
                Ok(format!("Removed {} finished progress streams", removed))
            }
        }
    }

    /// Memory-only when the durable layer is disabled.
    fn open_cache(&self) -> Result<Arc<TieredCache>, ApiError> {
        let durable = if self.config.cache.durable_enabled {
            std::fs::create_dir_all(&self.cache_path)
                .map_err(|e| ApiError::StorageError(e.into()))?;
            let store: Arc<dyn DurableStore> = SledCacheStore::shared(&self.cache_path)?;
            Some(store)
        } else {
            None
        };
        Ok(Arc::new(TieredCache::new(&self.config.cache, durable)))
    }

    fn open_progress_log(&self) -> Result<ProgressLog, ApiError> {
        std::fs::create_dir_all(&self.progress_path)
            .map_err(|e| ApiError::StorageError(e.into()))?;
        Ok(ProgressLog::open(&self.progress_path)?)
    }
}

fn resolve_path(workspace_root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_root.join(path)
    }
}

fn new_runtime() -> Result<tokio::runtime::Runtime, ApiError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ApiError::Internal(format!("Failed to start async runtime: {}", e)))
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Generate { .. } => "generate",
        Commands::Cache { command } => match command {
            CacheCommands::Stats { .. } => "cache.stats",
            CacheCommands::Prune => "cache.prune",
            CacheCommands::Clear => "cache.clear",
            CacheCommands::Invalidate { .. } => "cache.invalidate",
        },
        Commands::Progress { command } => match command {
            ProgressCommands::Replay { .. } => "progress.replay",
            ProgressCommands::Prune { .. } => "progress.prune",
        },
    }
}
