//! CLI parse: clap types for copyline. No behavior; definitions only.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// copyline - staged marketing copy generation
#[derive(Parser)]
#[command(name = "copyline")]
#[command(about = "Generate multi-section marketing copy through a staged, cached pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline for one product and stream progress to stdout
    Generate {
        /// Product name
        #[arg(long)]
        product: String,
        /// Source content describing the product
        #[arg(long, conflicts_with = "content_file")]
        content: Option<String>,
        /// Read source content from a file
        #[arg(long)]
        content_file: Option<PathBuf>,
        /// Target keyword (repeatable)
        #[arg(long = "keyword")]
        keywords: Vec<String>,
        /// Output language
        #[arg(long, default_value = "en")]
        language: String,
        /// Pipeline profile (full, quick, grounded)
        #[arg(long, default_value = "full")]
        profile: String,
        /// Launch date (YYYY-MM-DD), forwarded by the grounded profile
        #[arg(long)]
        launch_date: Option<NaiveDate>,
        /// Suppress the SSE progress frames on stdout
        #[arg(long)]
        no_stream: bool,
        /// Final state format (json or text)
        #[arg(long, default_value = "json")]
        format: String,
    },
    /// Cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Recorded progress streams
    Progress {
        #[command(subcommand)]
        command: ProgressCommands,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Show hit/miss statistics for each cache layer
    Stats {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Remove expired entries
    Prune,
    /// Remove every entry
    Clear,
    /// Remove every entry for one product
    Invalidate {
        #[arg(long)]
        product: String,
    },
}

#[derive(Subcommand)]
pub enum ProgressCommands {
    /// Replay a recorded stream, optionally resuming after a sequence number
    Replay {
        /// Generation key (gen_...)
        generation_key: String,
        /// Only events with a higher sequence number
        #[arg(long, default_value_t = 0)]
        after: u64,
        /// Output format (sse or text)
        #[arg(long, default_value = "sse")]
        format: String,
    },
    /// Remove finished streams older than the given age
    Prune {
        /// Maximum age in seconds
        #[arg(long, default_value_t = 86_400)]
        max_age_secs: u64,
    },
}
