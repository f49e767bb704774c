use copyline::cache::{DurableStore, SledCacheStore, TieredCache};
use copyline::config::CacheConfig;
use copyline::fingerprint::Fingerprint;
use copyline::pipeline::{GenerationResult, PipelineStatus};
use copyline::types::{PipelineProfile, StageId};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::integration::test_utils::request;

fn durable_store(dir: &TempDir) -> Arc<dyn DurableStore> {
    SledCacheStore::shared(dir.path().join("cache")).unwrap()
}

fn sample_result(fingerprint: &Fingerprint) -> GenerationResult {
    let mut sections = BTreeMap::new();
    sections.insert(StageId::Description, json!({ "text": "Grinds beans quietly." }));
    GenerationResult {
        generation_key: fingerprint.generation_key(),
        product_name: "Aurora Espresso Grinder".to_string(),
        status: PipelineStatus::Completed,
        sections,
    }
}

#[test]
fn durable_hit_is_promoted_to_memory() {
    let dir = TempDir::new().unwrap();
    let store = durable_store(&dir);
    let config = CacheConfig::default();
    let fingerprint = Fingerprint::of(&request(PipelineProfile::Full));

    let writer = TieredCache::new(&config, Some(Arc::clone(&store)));
    writer.set_result(&fingerprint, &sample_result(&fingerprint));

    let reader = TieredCache::new(&config, Some(store));
    assert_eq!(reader.stats().results.size, 0);
    let hit = reader.get_result(&fingerprint).unwrap();
    assert_eq!(hit, sample_result(&fingerprint));
    assert_eq!(reader.stats().results.size, 1);

    let durable = reader.stats().durable.unwrap();
    assert_eq!(durable.total_entries, 1);
    assert_eq!(durable.total_hits, 1);
}

#[test]
fn invalidate_product_matches_normalized_name() {
    let dir = TempDir::new().unwrap();
    let cache = TieredCache::new(&CacheConfig::default(), Some(durable_store(&dir)));
    let fingerprint = Fingerprint::of(&request(PipelineProfile::Full));

    cache.set_stage(&fingerprint, StageId::Faq, "Aurora Espresso Grinder", &json!(["q1"]));
    cache.set_stage(&fingerprint, StageId::Keywords, "Aurora Espresso Grinder", &json!(["k"]));
    cache.set_result(&fingerprint, &sample_result(&fingerprint));

    let removed = cache.invalidate_product("  AURORA espresso grinder ");
    assert!(removed >= 3, "removed {}", removed);
    assert!(cache.get_stage(&fingerprint, StageId::Faq).is_none());
    assert!(cache.get_result(&fingerprint).is_none());
    assert!(!cache.has(&fingerprint.generation_key()));
}

#[test]
fn delete_removes_key_from_both_layers() {
    let dir = TempDir::new().unwrap();
    let store = durable_store(&dir);
    let cache = TieredCache::new(&CacheConfig::default(), Some(Arc::clone(&store)));
    let fingerprint = Fingerprint::of(&request(PipelineProfile::Quick));
    let key = fingerprint.stage_key(StageId::Chapters);

    cache.set_stage(&fingerprint, StageId::Chapters, "Aurora", &json!({ "chapters": 4 }));
    assert!(cache.has(&key));
    assert!(store.has(&key).unwrap());

    assert!(cache.delete(&key));
    assert!(!cache.has(&key));
    assert!(!store.has(&key).unwrap());
    assert!(!cache.delete(&key));
}

#[tokio::test(start_paused = true)]
async fn memory_entries_expire_after_ttl() {
    let config = CacheConfig {
        stage_ttl_secs: 5,
        ..CacheConfig::default()
    };
    let cache = TieredCache::in_memory(&config);
    let fingerprint = Fingerprint::of(&request(PipelineProfile::Full));
    cache.set_stage(&fingerprint, StageId::Faq, "Aurora", &json!("faq"));

    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(cache.get_stage(&fingerprint, StageId::Faq).is_some());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(cache.get_stage(&fingerprint, StageId::Faq).is_none());
}

#[tokio::test(start_paused = true)]
async fn pruner_sweeps_expired_entries() {
    let config = CacheConfig {
        stage_ttl_secs: 1,
        prune_interval_secs: 10,
        ..CacheConfig::default()
    };
    let cache = Arc::new(TieredCache::in_memory(&config));
    let fingerprint = Fingerprint::of(&request(PipelineProfile::Full));
    cache.set_stage(&fingerprint, StageId::Faq, "Aurora", &json!("faq"));
    cache.set_stage(&fingerprint, StageId::Chapters, "Aurora", &json!("chapters"));

    let cancel = CancellationToken::new();
    let pruner = cache.spawn_pruner(cancel.clone());
    tokio::time::sleep(Duration::from_secs(11)).await;

    let stats = cache.stats();
    assert_eq!(stats.stages.size, 0);
    assert_eq!(stats.stages.expirations, 2);

    cancel.cancel();
    pruner.await.unwrap();
}

#[test]
fn lru_eviction_respects_capacity() {
    let config = CacheConfig {
        stage_capacity: 2,
        ..CacheConfig::default()
    };
    let cache = TieredCache::in_memory(&config);
    let fingerprint = Fingerprint::of(&request(PipelineProfile::Full));

    cache.set_stage(&fingerprint, StageId::Description, "Aurora", &json!(1));
    cache.set_stage(&fingerprint, StageId::Chapters, "Aurora", &json!(2));
    // Touch description so chapters becomes least recently used.
    assert!(cache.get_stage(&fingerprint, StageId::Description).is_some());
    cache.set_stage(&fingerprint, StageId::Faq, "Aurora", &json!(3));

    assert!(cache.get_stage(&fingerprint, StageId::Chapters).is_none());
    assert!(cache.get_stage(&fingerprint, StageId::Description).is_some());
    assert_eq!(cache.stats().stages.evictions, 1);
}
