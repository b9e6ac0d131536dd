//! In-process store implementing both store capabilities.
//!
//! Expiry follows the injected [`Clock`]: reads skip expired records and
//! every write sweeps them out, mirroring the native expiry of the stores it
//! stands in for. A single lock per map makes every batch and every upsert
//! indivisible.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::trace;

use super::{
    BatchStore, CounterDocument, DocumentSelector, DocumentStore, DocumentUpdate, IndexSpec, KvOp,
    KvReply,
};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    /// Milliseconds since the epoch; `None` never expires
    expires_at: Option<i64>,
}

impl Entry {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at.map_or(true, |at| at > now_ms)
    }
}

struct Inner {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
    documents: Mutex<HashMap<DocumentSelector, CounterDocument>>,
    indexes: Mutex<Vec<IndexSpec>>,
}

/// Shared in-memory key/value and document store. Clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.inner.entries.lock().len())
            .field("documents", &self.inner.documents.lock().len())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store whose expiry follows `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                entries: Mutex::new(HashMap::new()),
                documents: Mutex::new(HashMap::new()),
                indexes: Mutex::new(Vec::new()),
            }),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Live value stored under `key`.
    pub fn get(&self, key: &str) -> Option<i64> {
        let now_ms = self.now().timestamp_millis();
        self.inner
            .entries
            .lock()
            .get(key)
            .filter(|entry| entry.is_live(now_ms))
            .map(|entry| entry.value)
    }

    /// Remaining lifetime of `key` in milliseconds; `None` when absent or
    /// when the key never expires.
    pub fn ttl_millis(&self, key: &str) -> Option<i64> {
        let now_ms = self.now().timestamp_millis();
        self.inner
            .entries
            .lock()
            .get(key)
            .filter(|entry| entry.is_live(now_ms))
            .and_then(|entry| entry.expires_at)
            .map(|at| at - now_ms)
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now_ms = self.now().timestamp_millis();
        let mut keys: Vec<String> = self
            .inner
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.is_live(now_ms))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Live documents, in no particular order.
    pub fn documents(&self) -> Vec<CounterDocument> {
        let now = self.now();
        self.inner
            .documents
            .lock()
            .values()
            .filter(|doc| doc.expire_at > now)
            .cloned()
            .collect()
    }

    /// Indexes created so far.
    pub fn indexes(&self) -> Vec<IndexSpec> {
        self.inner.indexes.lock().clone()
    }

    fn apply(entries: &mut HashMap<String, Entry>, op: KvOp, now_ms: i64) -> KvReply {
        match op {
            KvOp::SetIfAbsent { key, value, ttl_ms } => {
                if entries.contains_key(&key) {
                    return KvReply::Nil;
                }
                entries.insert(
                    key,
                    Entry {
                        value,
                        expires_at: Some(now_ms + ttl_ms),
                    },
                );
                KvReply::Ok
            }
            KvOp::IncrBy { key, delta } => {
                let entry = entries.entry(key).or_insert(Entry {
                    value: 0,
                    expires_at: None,
                });
                entry.value += delta;
                KvReply::Integer(entry.value)
            }
            KvOp::Del { key } => KvReply::Integer(i64::from(entries.remove(&key).is_some())),
            KvOp::Get { key } => entries
                .get(&key)
                .map_or(KvReply::Nil, |entry| KvReply::Integer(entry.value)),
        }
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn exec(&self, ops: Vec<KvOp>) -> Result<Vec<KvReply>> {
        let now_ms = self.now().timestamp_millis();
        let mut entries = self.inner.entries.lock();
        entries.retain(|_, entry| entry.is_live(now_ms));
        trace!(commands = ops.len(), "Applying in-memory batch");

        Ok(ops
            .into_iter()
            .map(|op| Self::apply(&mut entries, op, now_ms))
            .collect())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_and_upsert(
        &self,
        selector: &DocumentSelector,
        update: &DocumentUpdate,
    ) -> Result<Option<CounterDocument>> {
        let now = self.now();
        let mut documents = self.inner.documents.lock();

        documents.retain(|_, doc| doc.expire_at > now);

        let doc = documents
            .entry(selector.clone())
            .and_modify(|doc| doc.value += update.inc)
            .or_insert_with(|| CounterDocument {
                namespace: selector.namespace.clone(),
                key: selector.key.clone(),
                ttl: selector.ttl,
                value: update.inc,
                expire_at: update.expire_at_on_insert,
            });

        Ok(Some(doc.clone()))
    }

    async fn find(&self, selector: &DocumentSelector) -> Result<Option<CounterDocument>> {
        let now = self.now();
        Ok(self
            .inner
            .documents
            .lock()
            .get(selector)
            .filter(|doc| doc.expire_at > now)
            .cloned())
    }

    async fn delete(&self, selector: &DocumentSelector) -> Result<bool> {
        let now = self.now();
        Ok(self
            .inner
            .documents
            .lock()
            .remove(selector)
            .is_some_and(|doc| doc.expire_at > now))
    }

    async fn create_index(&self, index: &IndexSpec) -> Result<()> {
        let mut indexes = self.inner.indexes.lock();
        if !indexes.iter().any(|existing| existing.name == index.name) {
            indexes.push(index.clone());
        }
        Ok(())
    }
}
