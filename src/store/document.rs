//! Counter backend over a document store with atomic per-document upserts.

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{debug, info};

use super::{CounterDocument, DocumentSelector, DocumentStore, DocumentUpdate, IndexSpec};
use crate::error::{QuotaError, Result};
use crate::quota::{CounterBackend, CounterSlot};

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "quota";

/// Name of the index that expires documents at `expireAt`.
pub const EXPIRE_INDEX: &str = "expireAtTTL";
/// Name of the unique `(namespace, key, ttl)` index.
pub const SELECTOR_INDEX: &str = "namespaceKeyTtlUnique";

/// Keeps one document per counter, scoped by an explicit namespace field.
///
/// Each counter is updated by its own atomic upsert, so the counters of one
/// call are not applied as a single transaction; rollback compensates with a
/// negated upsert on each of them.
#[derive(Debug, Clone)]
pub struct DocumentBackend<D> {
    store: D,
    namespace: String,
}

impl<D: DocumentStore> DocumentBackend<D> {
    pub fn new(store: D, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The underlying store.
    pub fn store(&self) -> &D {
        &self.store
    }

    /// Install the indexes the backend relies on.
    pub async fn setup(&self, background: bool) -> Result<()> {
        let indexes = [
            IndexSpec {
                name: EXPIRE_INDEX.to_string(),
                fields: vec!["expireAt".to_string()],
                unique: false,
                sparse: true,
                expire_after_secs: Some(0),
                background,
            },
            IndexSpec {
                name: SELECTOR_INDEX.to_string(),
                fields: vec!["namespace".to_string(), "key".to_string(), "ttl".to_string()],
                unique: true,
                sparse: true,
                expire_after_secs: None,
                background,
            },
        ];

        for index in &indexes {
            self.store.create_index(index).await?;
        }

        info!(namespace = %self.namespace, "Document indexes installed");
        Ok(())
    }

    fn selector(&self, slot: &CounterSlot) -> DocumentSelector {
        DocumentSelector {
            namespace: self.namespace.clone(),
            key: slot.identifier.scoped_key(),
            ttl: slot.ttl_millis(),
        }
    }

    async fn upsert(&self, slot: &CounterSlot, inc: i64) -> Result<CounterDocument> {
        let selector = self.selector(slot);
        let update = DocumentUpdate {
            inc,
            expire_at_on_insert: slot.window_end(),
        };

        self.store
            .find_and_upsert(&selector, &update)
            .await?
            .ok_or(QuotaError::RecordMissing {
                namespace: selector.namespace,
                key: selector.key,
                ttl: selector.ttl,
            })
    }
}

#[async_trait]
impl<D: DocumentStore> CounterBackend for DocumentBackend<D> {
    /// If one upsert fails, upserts that already applied keep their count.
    async fn increment(&self, slots: &[CounterSlot]) -> Result<Vec<i64>> {
        let documents = try_join_all(slots.iter().map(|slot| self.upsert(slot, 1))).await?;
        Ok(documents.into_iter().map(|doc| doc.value).collect())
    }

    async fn rollback(&self, slots: &[CounterSlot]) -> Result<()> {
        // The insert-only expiry is the original window end, so a document
        // recreated here is already expired.
        try_join_all(slots.iter().map(|slot| self.upsert(slot, -1))).await?;
        Ok(())
    }

    async fn flush(&self, slots: &[CounterSlot]) -> Result<()> {
        let removed = try_join_all(slots.iter().map(|slot| {
            let selector = self.selector(slot);
            async move { self.store.delete(&selector).await }
        }))
        .await?;

        debug!(
            namespace = %self.namespace,
            removed = removed.iter().filter(|r| **r).count(),
            "Flushed counter documents"
        );
        Ok(())
    }

    async fn current(&self, slots: &[CounterSlot]) -> Result<Vec<i64>> {
        let documents = try_join_all(slots.iter().map(|slot| {
            let selector = self.selector(slot);
            async move { self.store.find(&selector).await }
        }))
        .await?;

        Ok(documents
            .into_iter()
            .map(|doc| doc.map_or(0, |doc| doc.value))
            .collect())
    }
}
