//! Merge rules: defaults, override order, conflict handling.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
///
/// Only values that must exist before any file is merged are set here; everything else
/// falls back to the serde defaults of each section.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("cache.durable_enabled", true)?
        .set_default("pipeline.max_parallel_stages", 3_i64)?
        .set_default("recovery.concurrency", 3_i64)
}
