use copyline::cache::{SledCacheStore, TieredCache};
use copyline::cli::{CacheCommands, Commands, ProgressCommands, RunContext};
use copyline::config::CacheConfig;
use copyline::fingerprint::Fingerprint;
use copyline::progress::{spawn_stream_writer, ProgressLog};
use copyline::types::{PipelineProfile, StageId};
use serde_json::json;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

use crate::integration::test_utils::{in_memory_cache, orchestrator, request, ScriptedWorker};

fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("config")).unwrap();
    fs::write(
        dir.path().join("config/config.toml"),
        "[storage]\ncache_path = \"state/cache\"\nprogress_path = \"state/progress\"\n",
    )
    .unwrap();
    dir
}

fn cache_command(command: CacheCommands) -> Commands {
    Commands::Cache { command }
}

#[test]
fn cache_commands_operate_on_workspace_store() {
    let dir = workspace();
    {
        let store = SledCacheStore::shared(dir.path().join("state/cache")).unwrap();
        let cache = TieredCache::new(&CacheConfig::default(), Some(store));
        let fingerprint = Fingerprint::of(&request(PipelineProfile::Full));
        cache.set_stage(&fingerprint, StageId::Faq, "Aurora Espresso Grinder", &json!(["q"]));
        cache.set_stage(&fingerprint, StageId::Chapters, "Other Product", &json!(["c"]));
    }

    let ctx = RunContext::new(dir.path().to_path_buf(), None).unwrap();
    let stats: serde_json::Value = serde_json::from_str(
        &ctx.execute(&cache_command(CacheCommands::Stats {
            format: "json".to_string(),
        }))
        .unwrap(),
    )
    .unwrap();
    assert_eq!(stats["durable"]["total_entries"], 2);

    let out = ctx
        .execute(&cache_command(CacheCommands::Invalidate {
            product: "aurora espresso grinder".to_string(),
        }))
        .unwrap();
    assert_eq!(out, "Invalidated 1 entries for aurora espresso grinder");

    let text = ctx
        .execute(&cache_command(CacheCommands::Stats {
            format: "text".to_string(),
        }))
        .unwrap();
    assert!(text.contains("durable"));

    let out = ctx.execute(&cache_command(CacheCommands::Clear)).unwrap();
    assert_eq!(out, "Cleared 1 cache entries");
}

#[test]
fn disabled_durable_layer_reports_disabled() {
    let dir = workspace();
    fs::write(dir.path().join("config/development.toml"), "[cache]\ndurable_enabled = false\n")
        .unwrap();
    let ctx = RunContext::new(dir.path().to_path_buf(), None).unwrap();
    assert!(!ctx.config().cache.durable_enabled);

    let text = ctx
        .execute(&cache_command(CacheCommands::Stats {
            format: "text".to_string(),
        }))
        .unwrap();
    assert!(text.contains("disabled"));
    assert!(!dir.path().join("state/cache").exists());
}

#[test]
fn progress_replay_resumes_after_sequence() {
    let dir = workspace();
    let generation_key = {
        let log = ProgressLog::open(dir.path().join("state/progress")).unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let orchestrator = Arc::new(orchestrator(
                Arc::new(ScriptedWorker::new()),
                in_memory_cache(),
            ));
            let (run, events) = orchestrator.start(request(PipelineProfile::Quick));
            spawn_stream_writer(events, vec![Box::new(log.clone())])
                .await
                .unwrap();
            run.wait().await.unwrap().generation_key
        })
    };

    let ctx = RunContext::new(dir.path().to_path_buf(), None).unwrap();
    let sse = ctx
        .execute(&Commands::Progress {
            command: ProgressCommands::Replay {
                generation_key: generation_key.clone(),
                after: 0,
                format: "sse".to_string(),
            },
        })
        .unwrap();
    assert!(sse.starts_with("event: initializing"));

    let text = ctx
        .execute(&Commands::Progress {
            command: ProgressCommands::Replay {
                generation_key,
                after: 1,
                format: "text".to_string(),
            },
        })
        .unwrap();
    assert!(text.starts_with("#2"));
    assert!(text.lines().last().unwrap().contains("100%"));
}
