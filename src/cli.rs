//! CLI domain: parse, route, output, and presentation only.
//! No pipeline logic here; the route table dispatches to the orchestrator and caches.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{CacheCommands, Cli, Commands, ProgressCommands};
pub use presentation::{
    format_cache_stats, format_pipeline_state, format_progress_events, format_prune_report,
};
pub use route::RunContext;
