//! Two-tier cache: in-process L1 in front of an optional durable L2.
//!
//! Reads fall through L1 to L2 and promote L2 hits into L1. Writes go to both layers.
//! Every L2 failure is logged and treated as a miss or a dropped write; the cache never
//! fails the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::durable::{DurableCacheStats, DurableEntry, DurableStore};
use crate::cache::memory::{MemoryCache, MemoryCacheStats};
use crate::config::CacheConfig;
use crate::fingerprint::{normalize_text, Fingerprint};
use crate::pipeline::state::GenerationResult;
use crate::types::{now_millis, StageId};

/// Stage payload as held in L1, tagged with its product for bulk invalidation.
#[derive(Debug, Clone)]
struct CachedStage {
    product_name: String,
    payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PruneReport {
    pub results: usize,
    pub stages: usize,
    pub durable: usize,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.results + self.stages + self.durable
    }
}

#[derive(Debug, Clone)]
pub struct TieredCacheStats {
    pub results: MemoryCacheStats,
    pub stages: MemoryCacheStats,
    pub durable: Option<DurableCacheStats>,
}

/// Result and stage cache shared by every pipeline run in the process.
///
/// Construct once and pass around as `Arc<TieredCache>`.
pub struct TieredCache {
    results: MemoryCache<GenerationResult>,
    stages: MemoryCache<CachedStage>,
    durable: Option<Arc<dyn DurableStore>>,
    durable_ttl: Duration,
    prune_interval: Duration,
}

impl TieredCache {
    pub fn new(config: &CacheConfig, durable: Option<Arc<dyn DurableStore>>) -> Self {
        Self {
            results: MemoryCache::new(config.result_capacity, config.result_ttl()),
            stages: MemoryCache::new(config.stage_capacity, config.stage_ttl()),
            durable,
            durable_ttl: config.durable_ttl(),
            prune_interval: config.prune_interval(),
        }
    }

    /// L1-only cache, used when no durable store is configured.
    pub fn in_memory(config: &CacheConfig) -> Self {
        Self::new(config, None)
    }

    pub fn has_durable_layer(&self) -> bool {
        self.durable.is_some()
    }

    pub fn get_result(&self, fingerprint: &Fingerprint) -> Option<GenerationResult> {
        let key = fingerprint.generation_key();
        if let Some(result) = self.results.get(&key) {
            debug!(cache_key = %key, layer = "l1", "Result cache hit");
            return Some(result);
        }

        let entry = self.durable_get(&key)?;
        match serde_json::from_value::<GenerationResult>(entry.value.clone()) {
            Ok(result) => {
                let ttl = self.results.default_ttl().min(entry.remaining(now_millis()));
                self.results.set(key.clone(), result.clone(), Some(ttl));
                debug!(cache_key = %key, layer = "l2", "Result cache hit, promoted to L1");
                Some(result)
            }
            Err(err) => {
                warn!(cache_key = %key, error = %err, "Discarding undecodable durable result");
                self.durable_delete(&key);
                None
            }
        }
    }

    pub fn set_result(&self, fingerprint: &Fingerprint, result: &GenerationResult) {
        let key = fingerprint.generation_key();
        self.results.set(key.clone(), result.clone(), None);
        match serde_json::to_value(result) {
            Ok(value) => self.durable_set(&key, value, &result.product_name),
            Err(err) => warn!(cache_key = %key, error = %err, "Failed to encode result for durable cache"),
        }
    }

    pub fn get_stage(&self, fingerprint: &Fingerprint, stage: StageId) -> Option<Value> {
        let key = fingerprint.stage_key(stage);
        if let Some(cached) = self.stages.get(&key) {
            debug!(cache_key = %key, layer = "l1", "Stage cache hit");
            return Some(cached.payload);
        }

        let entry = self.durable_get(&key)?;
        let ttl = self.stages.default_ttl().min(entry.remaining(now_millis()));
        self.stages.set(
            key.clone(),
            CachedStage {
                product_name: entry.product_name.clone(),
                payload: entry.value.clone(),
            },
            Some(ttl),
        );
        debug!(cache_key = %key, layer = "l2", "Stage cache hit, promoted to L1");
        Some(entry.value)
    }

    pub fn set_stage(
        &self,
        fingerprint: &Fingerprint,
        stage: StageId,
        product_name: &str,
        payload: &Value,
    ) {
        let key = fingerprint.stage_key(stage);
        self.stages.set(
            key.clone(),
            CachedStage {
                product_name: normalize_text(product_name),
                payload: payload.clone(),
            },
            None,
        );
        self.durable_set(&key, payload.clone(), product_name);
    }

    /// Presence check across both layers.
    pub fn has(&self, key: &str) -> bool {
        if self.results.has(key) || self.stages.has(key) {
            return true;
        }
        match &self.durable {
            Some(store) => store.has(key).unwrap_or_else(|err| {
                warn!(cache_key = %key, error = %err, "Durable cache lookup failed");
                false
            }),
            None => false,
        }
    }

    /// Deletes `key` from both layers. Returns true if any layer held it.
    pub fn delete(&self, key: &str) -> bool {
        let in_memory = self.results.delete(key) | self.stages.delete(key);
        self.durable_delete(key) || in_memory
    }

    /// Drops every cached result and stage for a product.
    pub fn invalidate_product(&self, product_name: &str) -> usize {
        let target = normalize_text(product_name);
        let mut removed = self
            .results
            .retain(|_, result| normalize_text(&result.product_name) != target);
        removed += self.stages.retain(|_, cached| cached.product_name != target);
        if let Some(store) = &self.durable {
            match store.invalidate_product(&target) {
                Ok(count) => removed += count,
                Err(err) => {
                    warn!(product = %target, error = %err, "Durable cache invalidation failed")
                }
            }
        }
        removed
    }

    pub fn clear(&self) -> usize {
        let mut removed = self.results.clear() + self.stages.clear();
        if let Some(store) = &self.durable {
            match store.clear() {
                Ok(count) => removed += count,
                Err(err) => warn!(error = %err, "Durable cache clear failed"),
            }
        }
        removed
    }

    /// Removes expired entries from every layer.
    pub fn prune(&self) -> PruneReport {
        let durable = match &self.durable {
            Some(store) => store.prune_expired().unwrap_or_else(|err| {
                warn!(error = %err, "Durable cache prune failed");
                0
            }),
            None => 0,
        };
        PruneReport {
            results: self.results.prune_expired(),
            stages: self.stages.prune_expired(),
            durable,
        }
    }

    pub fn stats(&self) -> TieredCacheStats {
        let durable = self.durable.as_ref().and_then(|store| match store.stats() {
            Ok(stats) => Some(stats),
            Err(err) => {
                warn!(error = %err, "Durable cache stats unavailable");
                None
            }
        });
        TieredCacheStats {
            results: self.results.stats(),
            stages: self.stages.stats(),
            durable,
        }
    }

    /// Starts the periodic expiry sweep. The task ends when `cancel` fires.
    pub fn spawn_pruner(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = self.prune_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = cache.prune();
                        if report.total() > 0 {
                            debug!(
                                results = report.results,
                                stages = report.stages,
                                durable = report.durable,
                                "Pruned expired cache entries"
                            );
                        }
                    }
                }
            }
            debug!("Cache pruner stopped");
        })
    }

    fn durable_get(&self, key: &str) -> Option<DurableEntry> {
        let store = self.durable.as_ref()?;
        match store.get(key) {
            Ok(Some(entry)) => {
                self.record_hit_async(store, key);
                Some(entry)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(cache_key = %key, error = %err, "Durable cache read failed");
                None
            }
        }
    }

    fn durable_set(&self, key: &str, value: Value, product_name: &str) {
        let Some(store) = &self.durable else {
            return;
        };
        let entry = DurableEntry::new(value, product_name, self.durable_ttl);
        if let Err(err) = store.set(key, &entry) {
            warn!(cache_key = %key, error = %err, "Durable cache write failed");
        }
    }

    fn durable_delete(&self, key: &str) -> bool {
        let Some(store) = &self.durable else {
            return false;
        };
        store.delete(key).unwrap_or_else(|err| {
            warn!(cache_key = %key, error = %err, "Durable cache delete failed");
            false
        })
    }

    /// Hit counting happens off the read path; failures only log.
    fn record_hit_async(&self, store: &Arc<dyn DurableStore>, key: &str) {
        let store = Arc::clone(store);
        let key = key.to_string();
        let record = move || {
            if let Err(err) = store.record_hit(&key) {
                warn!(cache_key = %key, error = %err, "Failed to record durable cache hit");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(record);
            }
            Err(_) => record(),
        }
    }
}
