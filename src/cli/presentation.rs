//! Presentation: text and JSON renderings of run state, cache stats, and progress streams.

use crate::cache::{MemoryCacheStats, PruneReport, TieredCacheStats};
use crate::error::ApiError;
use crate::pipeline::{PipelineState, StageResult};
use crate::progress::{sse_frame, ProgressEvent};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use serde_json::json;

fn to_pretty_json(value: &impl serde::Serialize) -> Result<String, ApiError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| ApiError::Internal(format!("Failed to render JSON: {}", e)))
}

pub fn format_pipeline_state(state: &PipelineState, format: &str) -> Result<String, ApiError> {
    if format == "json" {
        return to_pretty_json(state);
    }

    let mut out = format!(
        "Generation {} ({}, profile {})\n  Status: {}\n  Latency: {} ms{}\n",
        state.generation_key,
        state.product_name,
        state.profile,
        state.status.as_str(),
        state.latency_ms,
        if state.from_cache { " (cached)" } else { "" },
    );
    if let Some(err) = &state.error {
        out.push_str(&format!("  Error: {}\n", err));
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Stage", "Status", "Source", "Retries", "Duration", "Detail"]);
    for stage in &state.stages {
        table.add_row(stage_row(stage));
    }
    out.push_str(&table.to_string());
    Ok(out)
}

fn stage_row(stage: &StageResult) -> Vec<String> {
    let source = if stage.from_cache { "cache" } else { "worker" };
    let duration = stage
        .duration()
        .map(|d| format!("{} ms", d.as_millis()))
        .unwrap_or_else(|| "-".to_string());
    let detail = match (&stage.error, &stage.skip_reason) {
        (Some(err), _) => format!("{}: {}", err.code, err.message),
        (None, Some(reason)) => reason.clone(),
        (None, None) => String::new(),
    };
    vec![
        stage.stage.to_string(),
        stage.status.as_str().to_string(),
        source.to_string(),
        stage.retry_count.to_string(),
        duration,
        detail,
    ]
}

fn layer_json(stats: &MemoryCacheStats) -> serde_json::Value {
    json!({
        "size": stats.size,
        "capacity": stats.capacity,
        "hits": stats.hits,
        "misses": stats.misses,
        "evictions": stats.evictions,
        "expirations": stats.expirations,
    })
}

pub fn format_cache_stats(stats: &TieredCacheStats, format: &str) -> Result<String, ApiError> {
    if format == "json" {
        let out = json!({
            "results": layer_json(&stats.results),
            "stages": layer_json(&stats.stages),
            "durable": stats.durable,
        });
        return to_pretty_json(&out);
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Layer", "Entries", "Capacity", "Hits", "Misses", "Evictions", "Expired"]);
    for (name, layer) in [("results", &stats.results), ("stages", &stats.stages)] {
        table.add_row(vec![
            name.to_string(),
            layer.size.to_string(),
            layer.capacity.to_string(),
            layer.hits.to_string(),
            layer.misses.to_string(),
            layer.evictions.to_string(),
            layer.expirations.to_string(),
        ]);
    }
    match &stats.durable {
        Some(durable) => table.add_row(vec![
            "durable".to_string(),
            durable.total_entries.to_string(),
            "-".to_string(),
            durable.total_hits.to_string(),
            "-".to_string(),
            "-".to_string(),
            durable.expired_entries.to_string(),
        ]),
        None => table.add_row(vec!["durable", "disabled", "-", "-", "-", "-", "-"]),
    };
    Ok(table.to_string())
}

pub fn format_prune_report(report: &PruneReport) -> String {
    format!(
        "Pruned {} expired entries (results: {}, stages: {}, durable: {})",
        report.total(),
        report.results,
        report.stages,
        report.durable
    )
}

/// `sse` reproduces the original frames; `text` prints one line per event.
pub fn format_progress_events(events: &[ProgressEvent], format: &str) -> Result<String, ApiError> {
    if events.is_empty() {
        return Ok("No progress events recorded.".to_string());
    }
    if format == "sse" {
        let frames = events.iter().map(sse_frame).collect::<Result<Vec<_>, _>>()?;
        return Ok(frames.concat().trim_end().to_string());
    }
    let lines: Vec<String> = events
        .iter()
        .map(|e| {
            format!(
                "#{:<4} {:>3}% {:<16} {:<22} {}",
                e.seq,
                e.percentage,
                e.kind.as_str(),
                e.stage.as_str(),
                e.message
            )
        })
        .collect();
    Ok(lines.join("\n"))
}
