use copyline::cache::{DurableStore, SledCacheStore, TieredCache};
use copyline::config::CacheConfig;
use copyline::error::StageError;
use copyline::pipeline::{PipelineOrchestrator, PipelineStatus, StageStatus};
use copyline::progress::ProgressKind;
use copyline::types::{GenerationRequest, PipelineProfile, StageId};
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::integration::test_utils::{in_memory_cache, orchestrator, request, ScriptedWorker};

#[tokio::test(start_paused = true)]
async fn parallel_stages_share_one_slot() {
    let worker = Arc::new(ScriptedWorker::new().with_delay(Duration::from_millis(100)));
    let state = orchestrator(worker.clone(), in_memory_cache())
        .run(&request(PipelineProfile::Full))
        .await;

    assert_eq!(state.status, PipelineStatus::Completed);
    // description, usp_extraction, keywords, {chapters, faq, case_studies},
    // grounding_aggregation, step_by_step: six 100ms slots instead of eight.
    assert!(state.latency_ms >= 600, "latency {}", state.latency_ms);
    assert!(state.latency_ms < 700, "latency {}", state.latency_ms);
    assert_eq!(worker.call_count(), 8);
}

#[tokio::test(start_paused = true)]
async fn parallel_group_is_capped() {
    let worker = Arc::new(ScriptedWorker::new().with_delay(Duration::from_millis(100)));
    let state = orchestrator(worker.clone(), in_memory_cache())
        .with_max_parallel_stages(1)
        .run(&request(PipelineProfile::Full))
        .await;

    assert_eq!(state.status, PipelineStatus::Completed);
    assert!(state.latency_ms >= 800, "latency {}", state.latency_ms);
}

#[tokio::test(start_paused = true)]
async fn dependencies_run_before_dependents() {
    let worker = Arc::new(ScriptedWorker::new());
    orchestrator(worker.clone(), in_memory_cache())
        .run(&request(PipelineProfile::Full))
        .await;

    let order = worker.invoked_stages();
    let position = |stage: StageId| order.iter().position(|s| *s == stage).unwrap();
    assert_eq!(order[0], StageId::Description);
    assert!(position(StageId::UspExtraction) < position(StageId::Chapters));
    assert!(position(StageId::Faq) < position(StageId::StepByStep));
    assert!(position(StageId::CaseStudies) < position(StageId::GroundingAggregation));

    let aggregation = worker
        .contexts()
        .into_iter()
        .find(|ctx| ctx.stage == StageId::GroundingAggregation)
        .unwrap();
    let deps: Vec<StageId> = aggregation.dependencies.keys().copied().collect();
    assert_eq!(
        deps,
        vec![
            StageId::Description,
            StageId::UspExtraction,
            StageId::Faq,
            StageId::CaseStudies
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn quick_profile_drops_step_by_step_and_grounding() {
    let worker = Arc::new(ScriptedWorker::new());
    let state = orchestrator(worker.clone(), in_memory_cache())
        .run(&request(PipelineProfile::Quick))
        .await;

    assert_eq!(state.status, PipelineStatus::Completed);
    assert_eq!(state.stages.len(), 7);
    assert!(state.stage(StageId::StepByStep).is_none());
    assert!(!worker.invoked_stages().contains(&StageId::StepByStep));
    assert!(worker.contexts().iter().all(|ctx| !ctx.use_grounding));
    assert_eq!(state.last_percentage, 100);
}

#[tokio::test(start_paused = true)]
async fn grounded_profile_forwards_launch_date_to_grounded_stages() {
    let launch = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
    let request = GenerationRequest::builder("Aurora Espresso Grinder", "Burr grinder.")
        .profile(PipelineProfile::Grounded)
        .launch_date(Some(launch))
        .build()
        .unwrap();
    let worker = Arc::new(ScriptedWorker::new());
    orchestrator(worker.clone(), in_memory_cache()).run(&request).await;

    for ctx in worker.contexts() {
        if ctx.spec.requires_grounding {
            assert!(ctx.use_grounding, "{} should be grounded", ctx.stage);
            assert_eq!(ctx.launch_date, Some(launch));
        } else {
            assert!(!ctx.use_grounding);
            assert_eq!(ctx.launch_date, None);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn abort_stops_scheduling_and_reports_error() {
    let worker = Arc::new(ScriptedWorker::new().with_delay(Duration::from_millis(100)));
    let orchestrator = Arc::new(orchestrator(worker.clone(), in_memory_cache()));
    let (run, mut events) = orchestrator.start(request(PipelineProfile::Full));

    let collector = tokio::spawn(async move {
        let mut collected = Vec::new();
        while let Some(event) = events.recv().await {
            collected.push(event);
        }
        collected
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    run.abort();
    let state = run.wait().await.unwrap();
    let collected = collector.await.unwrap();

    assert_eq!(state.status, PipelineStatus::Aborted);
    assert_eq!(state.stage(StageId::Description).unwrap().status, StageStatus::Completed);
    assert!(state
        .stages
        .iter()
        .filter(|s| s.stage != StageId::Description)
        .all(|s| s.status == StageStatus::Skipped));
    assert!(state.result.is_none());
    assert_eq!(collected.last().unwrap().kind, ProgressKind::Error);
    assert!(collected.last().unwrap().percentage < 100);
}

#[tokio::test(start_paused = true)]
async fn completed_run_is_served_from_result_cache() {
    let worker = Arc::new(ScriptedWorker::new());
    let orchestrator = Arc::new(orchestrator(worker.clone(), in_memory_cache()));

    let first = orchestrator.run(&request(PipelineProfile::Full)).await;
    assert_eq!(first.status, PipelineStatus::Completed);
    assert!(!first.from_cache);
    let calls = worker.call_count();

    let (run, mut events) = orchestrator.start(request(PipelineProfile::Full));
    let mut kinds = Vec::new();
    while let Some(event) = events.recv().await {
        kinds.push(event.kind);
    }
    let second = run.wait().await.unwrap();

    assert!(second.from_cache);
    assert_eq!(second.generation_key, first.generation_key);
    assert_eq!(second.result, first.result);
    assert!(second.stages.iter().all(|s| s.from_cache));
    assert_eq!(worker.call_count(), calls);
    assert_eq!(kinds.last(), Some(&ProgressKind::Complete));
    assert!(!kinds.contains(&ProgressKind::StageStarted));
}

#[tokio::test(start_paused = true)]
async fn partial_run_reuses_completed_stages() {
    let cache = in_memory_cache();
    let failing = Arc::new(
        ScriptedWorker::new().fail(StageId::CaseStudies, vec![StageError::validation("no sources")]),
    );
    let first = orchestrator(failing, Arc::clone(&cache))
        .run(&request(PipelineProfile::Full))
        .await;
    assert_eq!(first.status, PipelineStatus::Partial);

    let healthy = Arc::new(ScriptedWorker::new());
    let second = orchestrator(healthy.clone(), cache)
        .run(&request(PipelineProfile::Full))
        .await;

    assert_eq!(second.status, PipelineStatus::Completed);
    assert!(!second.from_cache);
    assert_eq!(
        healthy.invoked_stages(),
        vec![StageId::CaseStudies, StageId::GroundingAggregation]
    );
    assert!(second.stage(StageId::Description).unwrap().from_cache);
    assert!(!second.stage(StageId::CaseStudies).unwrap().from_cache);
}

#[tokio::test(start_paused = true)]
async fn profiles_do_not_share_cache_entries() {
    let cache = in_memory_cache();
    let worker = Arc::new(ScriptedWorker::new());
    let orchestrator = orchestrator(worker.clone(), cache);

    orchestrator.run(&request(PipelineProfile::Full)).await;
    let full_calls = worker.call_count();
    let quick = orchestrator.run(&request(PipelineProfile::Quick)).await;

    assert!(!quick.from_cache);
    assert_eq!(worker.call_count(), full_calls + 7);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_stage_waits_for_retry_after() {
    let worker = Arc::new(ScriptedWorker::new().fail(
        StageId::Faq,
        vec![StageError::rate_limited("429", Some(Duration::from_millis(5_000)))],
    ));
    let state = orchestrator(worker.clone(), in_memory_cache())
        .run(&request(PipelineProfile::Full))
        .await;

    assert_eq!(state.status, PipelineStatus::Completed);
    let faq = state.stage(StageId::Faq).unwrap();
    assert_eq!(faq.retry_count, 1);

    let calls = worker.call_instants(StageId::Faq);
    assert_eq!(calls.len(), 2);
    // The generic schedule here would retry after 10ms.
    assert!(calls[1] - calls[0] >= Duration::from_millis(5_000));
    assert!(state.latency_ms >= 5_000, "latency {}", state.latency_ms);
}

#[tokio::test]
async fn durable_layer_survives_a_fresh_cache() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn DurableStore> = SledCacheStore::shared(dir.path().join("cache")).unwrap();
    let config = CacheConfig::default();

    let first_cache = Arc::new(TieredCache::new(&config, Some(Arc::clone(&store))));
    let worker = Arc::new(ScriptedWorker::new());
    let first = PipelineOrchestrator::new(worker.clone(), first_cache)
        .run(&request(PipelineProfile::Full))
        .await;
    assert_eq!(first.status, PipelineStatus::Completed);

    let second_cache = Arc::new(TieredCache::new(&config, Some(store)));
    let second = PipelineOrchestrator::new(worker.clone(), second_cache)
        .run(&request(PipelineProfile::Full))
        .await;

    assert!(second.from_cache);
    assert_eq!(worker.call_count(), 8);
}
