//! Store capabilities and the counter backends built on them.
//!
//! Two store shapes are supported:
//! - [`BatchStore`]: executes an ordered list of key/value commands as one
//!   indivisible transaction (Redis `MULTI`/`EXEC`).
//! - [`DocumentStore`]: atomic find-and-upsert on a single document.
//!
//! [`KeyValueBackend`] and [`DocumentBackend`] adapt them to the engine's
//! [`CounterBackend`](crate::quota::CounterBackend).

mod document;
mod keyvalue;
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use document::{DocumentBackend, DEFAULT_NAMESPACE, EXPIRE_INDEX, SELECTOR_INDEX};
pub use keyvalue::KeyValueBackend;
pub use memory::MemoryStore;

#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// A key/value command inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// `SET key value PX ttl_ms NX`
    SetIfAbsent { key: String, value: i64, ttl_ms: i64 },
    /// `INCRBY key delta`
    IncrBy { key: String, delta: i64 },
    /// `DEL key`
    Del { key: String },
    /// `GET key`
    Get { key: String },
}

/// Reply to one [`KvOp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvReply {
    /// Command applied (`SET` that wrote)
    Ok,
    /// Nothing there, or a conditional write that did not apply
    Nil,
    Integer(i64),
}

impl KvReply {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            KvReply::Integer(value) => Some(*value),
            _ => None,
        }
    }
}

/// A key/value store that can run a batch of commands atomically.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Execute `ops` as one transaction, returning one reply per op, in order.
    async fn exec(&self, ops: Vec<KvOp>) -> Result<Vec<KvReply>>;
}

/// Addresses one counter document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentSelector {
    pub namespace: String,
    pub key: String,
    /// Window length in milliseconds
    pub ttl: i64,
}

/// An upsert applied to a counter document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentUpdate {
    /// Added to `value`
    pub inc: i64,
    /// Written only when the document is inserted
    pub expire_at_on_insert: DateTime<Utc>,
}

/// Stored shape of a counter document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterDocument {
    pub namespace: String,
    pub key: String,
    pub ttl: i64,
    pub value: i64,
    pub expire_at: DateTime<Utc>,
}

impl CounterDocument {
    pub fn selector(&self) -> DocumentSelector {
        DocumentSelector {
            namespace: self.namespace.clone(),
            key: self.key.clone(),
            ttl: self.ttl,
        }
    }
}

/// An index a document store should maintain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    /// Indexed field names, in order
    pub fields: Vec<String>,
    pub unique: bool,
    pub sparse: bool,
    /// Documents expire this many seconds after the indexed timestamp
    pub expire_after_secs: Option<u64>,
    /// Build without blocking other operations
    pub background: bool,
}

/// A document store offering atomic per-document read-modify-write.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Atomically apply `update` to the document matched by `selector`,
    /// inserting it when absent, and return the document after the update.
    async fn find_and_upsert(
        &self,
        selector: &DocumentSelector,
        update: &DocumentUpdate,
    ) -> Result<Option<CounterDocument>>;

    /// Read a document, if present.
    async fn find(&self, selector: &DocumentSelector) -> Result<Option<CounterDocument>>;

    /// Delete a document; returns whether one was removed.
    async fn delete(&self, selector: &DocumentSelector) -> Result<bool>;

    /// Create an index if it does not already exist.
    async fn create_index(&self, index: &IndexSpec) -> Result<()>;
}
