//! Configuration System
//!
//! Hierarchical configuration: built-in defaults, then the user-level file, then workspace
//! files, then `COPYLINE__SECTION__KEY` environment variables. Every section has serde
//! defaults so partial files are valid.

use crate::error::ApiError;
use crate::logging::LoggingConfig;
use config::{Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod merge {
    pub mod merge_policy;
}
mod sources {
    pub mod global_file;
    pub mod workspace_file;
}

pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CopylineConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tiered cache sizing and lifetimes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// L1 capacity for whole-result entries
    pub result_capacity: usize,
    /// L1 capacity for per-stage entries
    pub stage_capacity: usize,
    pub result_ttl_secs: u64,
    pub stage_ttl_secs: u64,
    /// Lifetime of L2 entries
    pub durable_ttl_secs: u64,
    pub prune_interval_secs: u64,
    /// Back the in-process cache with the sled store
    pub durable_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            result_capacity: 50,
            stage_capacity: 200,
            result_ttl_secs: 30 * 60,
            stage_ttl_secs: 15 * 60,
            durable_ttl_secs: 24 * 60 * 60,
            prune_interval_secs: 5 * 60,
            durable_enabled: true,
        }
    }
}

impl CacheConfig {
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn stage_ttl(&self) -> Duration {
        Duration::from_secs(self.stage_ttl_secs)
    }

    pub fn durable_ttl(&self) -> Duration {
        Duration::from_secs(self.durable_ttl_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

/// Retry/recovery defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub concurrency: usize,
    /// Base retry delay; the error category's default applies when unset
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            concurrency: 3,
            initial_delay_ms: None,
            max_delay_ms: 30_000,
            jitter_ratio: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on stages of one parallel group running at once
    pub max_parallel_stages: usize,
    /// Capacity of the progress channel between a run and its stream writer
    pub progress_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_parallel_stages: 3,
            progress_buffer: 64,
        }
    }
}

/// On-disk locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub cache_path: PathBuf,
    pub progress_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            cache_path: data_dir.join("cache"),
            progress_path: data_dir.join("progress"),
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "copyline")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".copyline"))
}

/// HTTP stage worker endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            timeout_secs: 120,
            api_key: None,
        }
    }
}

impl WorkerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

impl CopylineConfig {
    /// Validate the entire configuration, collecting every violation.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.cache.result_capacity == 0 {
            errors.push(ValidationError::new(
                "cache.result_capacity",
                "must be greater than zero",
            ));
        }
        if self.cache.stage_capacity == 0 {
            errors.push(ValidationError::new(
                "cache.stage_capacity",
                "must be greater than zero",
            ));
        }
        if self.cache.prune_interval_secs == 0 {
            errors.push(ValidationError::new(
                "cache.prune_interval_secs",
                "must be greater than zero",
            ));
        }
        if self.recovery.concurrency == 0 {
            errors.push(ValidationError::new(
                "recovery.concurrency",
                "must be greater than zero",
            ));
        }
        if let Some(initial) = self.recovery.initial_delay_ms {
            if self.recovery.max_delay_ms < initial {
                errors.push(ValidationError::new(
                    "recovery.max_delay_ms",
                    format!(
                        "must be at least initial_delay_ms ({} < {})",
                        self.recovery.max_delay_ms, initial
                    ),
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.recovery.jitter_ratio) {
            errors.push(ValidationError::new(
                "recovery.jitter_ratio",
                format!("must be within [0, 1], got {}", self.recovery.jitter_ratio),
            ));
        }
        if self.pipeline.max_parallel_stages == 0 {
            errors.push(ValidationError::new(
                "pipeline.max_parallel_stages",
                "must be greater than zero",
            ));
        }
        if self.pipeline.progress_buffer == 0 {
            errors.push(ValidationError::new(
                "pipeline.progress_buffer",
                "must be greater than zero",
            ));
        }
        if self.storage.cache_path.as_os_str().is_empty() {
            errors.push(ValidationError::new("storage.cache_path", "cannot be empty"));
        }
        if self.storage.progress_path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.progress_path",
                "cannot be empty",
            ));
        }
        if self.worker.timeout_secs == 0 {
            errors.push(ValidationError::new(
                "worker.timeout_secs",
                "must be greater than zero",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and fold every violation into one `ApiError`.
    pub fn ensure_valid(&self) -> Result<(), ApiError> {
        self.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ApiError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                messages.join("\n")
            ))
        })
    }
}

/// Loads [`CopylineConfig`] from the layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults, then `~/.config/copyline/config.toml`, then `<workspace>/config/config.toml`
    /// and `<workspace>/config/{COPYLINE_ENV}.toml`, then `COPYLINE__*` env vars.
    pub fn load(workspace_root: &Path) -> Result<CopylineConfig, ApiError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = builder.add_source(env_source());
        let config: CopylineConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Loads one explicit file on top of the defaults; env vars still apply.
    pub fn load_from_file(path: &Path) -> Result<CopylineConfig, ApiError> {
        if !path.exists() {
            return Err(ApiError::ConfigError(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let config: CopylineConfig = merge::merge_policy::builder_with_defaults()?
            .add_source(File::from(path.to_path_buf()).required(true))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix("COPYLINE")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
