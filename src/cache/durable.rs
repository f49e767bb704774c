//! L2 durable cache: a sled-backed key-value store with hit counting and expiry.
//!
//! Expiry is enforced at query time; expired entries stay on disk until
//! [`DurableStore::prune_expired`] removes them, so statistics can report them.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StorageError;
use crate::fingerprint::normalize_text;
use crate::types::now_millis;

const TREE_ENTRIES: &str = "cache_entries";

/// A durable cache record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableEntry {
    pub value: Value,
    /// Normalized product name, used for bulk invalidation.
    pub product_name: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    #[serde(default)]
    pub hit_count: u64,
}

impl DurableEntry {
    pub fn new(value: Value, product_name: &str, ttl: Duration) -> Self {
        let now = now_millis();
        Self {
            value,
            product_name: normalize_text(product_name),
            created_at_ms: now,
            expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
            hit_count: 0,
        }
    }

    pub fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }

    pub fn remaining(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expires_at_ms.saturating_sub(now_ms))
    }
}

/// Aggregate statistics over the durable layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurableCacheStats {
    pub total_entries: usize,
    pub total_hits: u64,
    pub expired_entries: usize,
    pub average_hits: f64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

/// Durable key-value store behind the L2 cache layer.
pub trait DurableStore: Send + Sync {
    /// Returns the entry only while it is live.
    fn get(&self, key: &str) -> Result<Option<DurableEntry>, StorageError>;

    fn set(&self, key: &str, entry: &DurableEntry) -> Result<(), StorageError>;

    fn has(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError>;

    fn record_hit(&self, key: &str) -> Result<(), StorageError>;

    fn prune_expired(&self) -> Result<usize, StorageError>;

    fn invalidate_product(&self, product_name: &str) -> Result<usize, StorageError>;

    fn clear(&self) -> Result<usize, StorageError>;

    fn stats(&self) -> Result<DurableCacheStats, StorageError>;
}

/// Sled-based implementation of [`DurableStore`]
#[derive(Clone)]
pub struct SledCacheStore {
    db: sled::Db,
    entries: sled::Tree,
}

impl SledCacheStore {
    /// Open (or create) a store at the given directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| {
            StorageError::Backend(format!("Failed to open sled database: {}", e))
        })?;
        Self::from_db(db)
    }

    pub fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let entries = db.open_tree(TREE_ENTRIES)?;
        Ok(Self { db, entries })
    }

    pub fn shared<P: AsRef<Path>>(path: P) -> Result<Arc<Self>, StorageError> {
        Ok(Arc::new(Self::open(path)?))
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn decode(raw: &[u8]) -> Result<DurableEntry, StorageError> {
        Ok(serde_json::from_slice(raw)?)
    }

    fn remove_where<F>(&self, mut doomed: F) -> Result<usize, StorageError>
    where
        F: FnMut(&DurableEntry) -> bool,
    {
        let mut keys = Vec::new();
        for item in self.entries.iter() {
            let (key, value) = item?;
            match Self::decode(&value) {
                Ok(entry) if doomed(&entry) => keys.push(key),
                Ok(_) => {}
                // Undecodable records can never be served; drop them with the sweep.
                Err(_) => keys.push(key),
            }
        }
        for key in &keys {
            self.entries.remove(key)?;
        }
        Ok(keys.len())
    }
}

impl DurableStore for SledCacheStore {
    fn get(&self, key: &str) -> Result<Option<DurableEntry>, StorageError> {
        let Some(raw) = self.entries.get(key.as_bytes())? else {
            return Ok(None);
        };
        let entry = Self::decode(&raw)?;
        if entry.is_live(now_millis()) {
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    fn set(&self, key: &str, entry: &DurableEntry) -> Result<(), StorageError> {
        let value = serde_json::to_vec(entry)?;
        self.entries.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.remove(key.as_bytes())?.is_some())
    }

    fn record_hit(&self, key: &str) -> Result<(), StorageError> {
        let mut decode_error = None;
        self.entries.update_and_fetch(key.as_bytes(), |current| {
            let raw = current?;
            match serde_json::from_slice::<DurableEntry>(raw) {
                Ok(mut entry) => {
                    entry.hit_count += 1;
                    serde_json::to_vec(&entry).ok().or_else(|| Some(raw.to_vec()))
                }
                Err(err) => {
                    decode_error = Some(err);
                    Some(raw.to_vec())
                }
            }
        })?;
        match decode_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn prune_expired(&self) -> Result<usize, StorageError> {
        let now = now_millis();
        self.remove_where(|entry| !entry.is_live(now))
    }

    fn invalidate_product(&self, product_name: &str) -> Result<usize, StorageError> {
        let target = normalize_text(product_name);
        self.remove_where(|entry| entry.product_name == target)
    }

    fn clear(&self) -> Result<usize, StorageError> {
        let count = self.entries.len();
        self.entries.clear()?;
        Ok(count)
    }

    fn stats(&self) -> Result<DurableCacheStats, StorageError> {
        let now = now_millis();
        let mut stats = DurableCacheStats::default();
        let mut oldest: Option<u64> = None;
        let mut newest: Option<u64> = None;

        for item in self.entries.iter() {
            let (_, value) = item?;
            let entry = Self::decode(&value)?;
            stats.total_entries += 1;
            stats.total_hits += entry.hit_count;
            if !entry.is_live(now) {
                stats.expired_entries += 1;
            }
            oldest = Some(oldest.map_or(entry.created_at_ms, |o| o.min(entry.created_at_ms)));
            newest = Some(newest.map_or(entry.created_at_ms, |n| n.max(entry.created_at_ms)));
        }

        if stats.total_entries > 0 {
            stats.average_hits = stats.total_hits as f64 / stats.total_entries as f64;
        }
        stats.oldest_entry = oldest.and_then(millis_to_datetime);
        stats.newest_entry = newest.and_then(millis_to_datetime);
        Ok(stats)
    }
}

fn millis_to_datetime(ms: u64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms as i64).single()
}
