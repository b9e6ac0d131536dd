//! Counter backend over a batch-atomic key/value store.

use async_trait::async_trait;
use tracing::trace;

use super::{BatchStore, KvOp, KvReply};
use crate::error::{QuotaError, Result};
use crate::quota::{CounterBackend, CounterSlot};

/// Expiry given to a counter that a rollback has to recreate.
const ROLLBACK_TTL_MS: i64 = 1;

/// Runs every counter update of an engine call as a single transaction.
#[derive(Debug, Clone)]
pub struct KeyValueBackend<S> {
    store: S,
}

impl<S: BatchStore> KeyValueBackend<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run `ops`, checking the store answered every one of them.
    async fn exec(&self, ops: Vec<KvOp>) -> Result<Vec<KvReply>> {
        let expected = ops.len();
        trace!(commands = expected, "Executing batch");
        let replies = self.store.exec(ops).await?;
        if replies.len() != expected {
            return Err(QuotaError::Backend(format!(
                "batch of {} commands returned {} replies",
                expected,
                replies.len()
            )));
        }
        Ok(replies)
    }

    /// Every slot gets "create if absent" followed by `INCRBY delta`.
    fn create_then_add(
        slots: &[CounterSlot],
        delta: i64,
        ttl: impl Fn(&CounterSlot) -> i64,
    ) -> Vec<KvOp> {
        slots
            .iter()
            .flat_map(|slot| {
                let key = slot.identifier.to_string();
                [
                    KvOp::SetIfAbsent {
                        key: key.clone(),
                        value: 0,
                        ttl_ms: ttl(slot),
                    },
                    KvOp::IncrBy { key, delta },
                ]
            })
            .collect()
    }
}

#[async_trait]
impl<S: BatchStore> CounterBackend for KeyValueBackend<S> {
    async fn increment(&self, slots: &[CounterSlot]) -> Result<Vec<i64>> {
        let ops = Self::create_then_add(slots, 1, CounterSlot::ttl_millis);
        let replies = self.exec(ops).await?;

        // Replies alternate SET, INCRBY; keep the INCRBY results.
        replies
            .iter()
            .skip(1)
            .step_by(2)
            .zip(slots)
            .map(|(reply, slot)| {
                reply.as_integer().ok_or_else(|| {
                    QuotaError::Backend(format!(
                        "INCRBY {} returned {:?}",
                        slot.identifier, reply
                    ))
                })
            })
            .collect()
    }

    async fn rollback(&self, slots: &[CounterSlot]) -> Result<()> {
        // A counter that expired since the increment is recreated with an
        // immediate expiry so the decrement cannot leave a record behind.
        let ops = Self::create_then_add(slots, -1, |_| ROLLBACK_TTL_MS);
        self.exec(ops).await?;
        Ok(())
    }

    async fn flush(&self, slots: &[CounterSlot]) -> Result<()> {
        let ops = slots
            .iter()
            .map(|slot| KvOp::Del {
                key: slot.identifier.to_string(),
            })
            .collect();
        self.exec(ops).await?;
        Ok(())
    }

    async fn current(&self, slots: &[CounterSlot]) -> Result<Vec<i64>> {
        let ops = slots
            .iter()
            .map(|slot| KvOp::Get {
                key: slot.identifier.to_string(),
            })
            .collect();
        let replies = self.exec(ops).await?;

        replies
            .into_iter()
            .zip(slots)
            .map(|(reply, slot)| match reply {
                KvReply::Nil => Ok(0),
                KvReply::Integer(value) => Ok(value),
                other => Err(QuotaError::Backend(format!(
                    "GET {} returned {:?}",
                    slot.identifier, other
                ))),
            })
            .collect()
    }
}
