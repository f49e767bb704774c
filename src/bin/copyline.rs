//! copyline CLI Binary
//!
//! Command-line front end for the copy generation pipeline.

use anyhow::Context;
use clap::Parser;
use copyline::cli::{Cli, RunContext};
use copyline::config::ConfigLoader;
use copyline::logging::{init_logging, LoggingConfig};
use std::process;
use tracing::{error, info};

fn main() {
    let cli = Cli::parse();

    let logging_config = match build_logging_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    info!("copyline starting");

    let context = match RunContext::new(cli.workspace.clone(), cli.config.clone()) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Error loading configuration: {}", e);
            eprintln!("{}", copyline::cli::map_error(&e));
            process::exit(1);
        }
    };

    match context.execute(&cli.command) {
        Ok(output) => {
            info!("Command completed successfully");
            println!("{}", output);
        }
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("{}", copyline::cli::map_error(&e));
            process::exit(1);
        }
    }
}

/// Build logging configuration from CLI args, environment, and config file.
///
/// Logging stays off unless `--verbose` is given. An explicit `--config` that cannot be
/// loaded is an error; a broken workspace config only falls back to defaults here and is
/// reported again by `RunContext::new`.
fn build_logging_config(cli: &Cli) -> anyhow::Result<LoggingConfig> {
    if !cli.verbose {
        return Ok(LoggingConfig {
            level: "off".to_string(),
            ..LoggingConfig::default()
        });
    }

    let mut config = match cli.config {
        Some(ref config_path) => {
            ConfigLoader::load_from_file(config_path)
                .with_context(|| format!("Failed to load {}", config_path.display()))?
                .logging
        }
        None => ConfigLoader::load(&cli.workspace)
            .map(|c| c.logging)
            .unwrap_or_default(),
    };

    // CLI arguments have the highest priority.
    if let Some(ref level) = cli.log_level {
        config.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        config.format = format.clone();
    }
    if let Some(ref output) = cli.log_output {
        config.output = output.clone();
    }
    if let Some(ref file) = cli.log_file {
        config.file = file.clone();
    } else if config.file.is_relative() {
        config.file = cli.workspace.join(&config.file);
    }

    Ok(config)
}
