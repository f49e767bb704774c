//! Durable sled-backed progress log, one event stream per generation key.
//!
//! Late or reconnecting clients replay a stream with [`ProgressLog::read_events_after`].

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::error::StorageError;
use crate::progress::event::{ProgressEvent, ProgressKind};
use crate::types::now_millis;

const TREE_EVENTS: &str = "progress_events";
const TREE_META: &str = "progress_meta";
const EVENT_KEY_PAD: usize = 20;

/// Summary of the latest stream recorded for a generation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMeta {
    pub last_seq: u64,
    pub last_kind: ProgressKind,
    pub last_percentage: u8,
    pub updated_at_ms: u64,
}

impl StreamMeta {
    pub fn is_finished(&self) -> bool {
        self.last_kind.is_terminal()
    }
}

#[derive(Clone)]
pub struct ProgressLog {
    db: Db,
    events: Tree,
    meta: Tree,
}

impl ProgressLog {
    pub fn new(db: Db) -> Result<Self, StorageError> {
        let events = db.open_tree(TREE_EVENTS).map_err(to_storage_io)?;
        let meta = db.open_tree(TREE_META).map_err(to_storage_io)?;
        Ok(Self { db, events, meta })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(to_storage_io)?;
        Self::new(db)
    }

    pub fn shared(db: Db) -> Result<Arc<Self>, StorageError> {
        Ok(Arc::new(Self::new(db)?))
    }

    /// Appends an event. The first event of a stream (`seq == 1`) replaces any earlier
    /// stream recorded under the same key.
    pub fn append_event(&self, event: &ProgressEvent) -> Result<(), StorageError> {
        if event.seq == 1 {
            self.delete_stream(&event.generation_key)?;
        }
        let key = encode_event_key(&event.generation_key, event.seq);
        let value = serde_json::to_vec(event).map_err(to_storage_data)?;
        self.events
            .insert(key.as_bytes(), value)
            .map_err(to_storage_io)?;

        let meta = StreamMeta {
            last_seq: event.seq,
            last_kind: event.kind,
            last_percentage: event.percentage,
            updated_at_ms: now_millis(),
        };
        let value = serde_json::to_vec(&meta).map_err(to_storage_data)?;
        self.meta
            .insert(event.generation_key.as_bytes(), value)
            .map_err(to_storage_io)?;
        Ok(())
    }

    pub fn get_meta(&self, generation_key: &str) -> Result<Option<StreamMeta>, StorageError> {
        let Some(raw) = self
            .meta
            .get(generation_key.as_bytes())
            .map_err(to_storage_io)?
        else {
            return Ok(None);
        };
        let parsed = serde_json::from_slice(&raw).map_err(to_storage_data)?;
        Ok(Some(parsed))
    }

    pub fn read_events(&self, generation_key: &str) -> Result<Vec<ProgressEvent>, StorageError> {
        self.read_events_after(generation_key, 0)
    }

    pub fn read_events_after(
        &self,
        generation_key: &str,
        after_seq: u64,
    ) -> Result<Vec<ProgressEvent>, StorageError> {
        let prefix = format!("{generation_key}:");
        let mut out = Vec::new();
        for result in self.events.scan_prefix(prefix.as_bytes()) {
            let (_, value) = result.map_err(to_storage_io)?;
            let parsed: ProgressEvent = serde_json::from_slice(&value).map_err(to_storage_data)?;
            if parsed.seq > after_seq {
                out.push(parsed);
            }
        }
        out.sort_by_key(|e| e.seq);
        Ok(out)
    }

    /// Removes finished streams last updated before `max_age_ms` ago.
    pub fn prune_finished(&self, max_age_ms: u64, now_ms: u64) -> Result<usize, StorageError> {
        let mut stale = Vec::new();
        for result in self.meta.iter() {
            let (key, value) = result.map_err(to_storage_io)?;
            let meta: StreamMeta = serde_json::from_slice(&value).map_err(to_storage_data)?;
            if meta.is_finished() && now_ms.saturating_sub(meta.updated_at_ms) > max_age_ms {
                stale.push(String::from_utf8_lossy(&key).into_owned());
            }
        }
        for generation_key in &stale {
            self.delete_stream(generation_key)?;
        }
        Ok(stale.len())
    }

    pub fn delete_stream(&self, generation_key: &str) -> Result<usize, StorageError> {
        self.meta
            .remove(generation_key.as_bytes())
            .map_err(to_storage_io)?;
        let prefix = format!("{generation_key}:");
        let keys: Vec<Vec<u8>> = self
            .events
            .scan_prefix(prefix.as_bytes())
            .filter_map(|r| r.ok().map(|(k, _)| k.to_vec()))
            .collect();
        for key in &keys {
            self.events.remove(key).map_err(to_storage_io)?;
        }
        Ok(keys.len())
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(to_storage_io)?;
        Ok(())
    }

    pub fn encode_event_key(generation_key: &str, seq: u64) -> String {
        encode_event_key(generation_key, seq)
    }
}

fn encode_event_key(generation_key: &str, seq: u64) -> String {
    format!("{generation_key}:{seq:0EVENT_KEY_PAD$}")
}

fn to_storage_io(err: sled::Error) -> StorageError {
    StorageError::IoError(io::Error::new(io::ErrorKind::Other, err.to_string()))
}

fn to_storage_data(err: serde_json::Error) -> StorageError {
    StorageError::IoError(io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
}
