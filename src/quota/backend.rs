//! Counter backend trait for abstracting the key/value and document stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::identifier::WindowIdentifier;
use super::window::TimeUnit;
use crate::error::Result;

/// One window counter touched by an engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSlot {
    /// Where the counter lives
    pub identifier: WindowIdentifier,
    /// Window length of the owning rate
    pub unit: TimeUnit,
}

impl CounterSlot {
    pub fn new(identifier: WindowIdentifier, unit: TimeUnit) -> Self {
        Self { identifier, unit }
    }

    /// Expiry to set when the counter is created.
    pub fn ttl_millis(&self) -> i64 {
        self.unit.duration_millis()
    }

    /// End of the counter's window.
    pub fn window_end(&self) -> DateTime<Utc> {
        self.unit.window_end(self.identifier.window_start_at())
    }
}

/// Capability the grant engine needs from a store.
///
/// The grant algorithm is written once against this trait. Implementations
/// decide how much atomicity their store offers: the key/value binding
/// applies a whole call as one transaction, the document binding one
/// record at a time.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Create each counter at zero if absent (expiring after its TTL), add
    /// one, and return the post-increment values in slot order.
    ///
    /// On error, bindings without multi-record transactions may leave some
    /// of the counters incremented.
    async fn increment(&self, slots: &[CounterSlot]) -> Result<Vec<i64>>;

    /// Subtract one from each counter without extending the lifetime of a
    /// window that has already expired.
    async fn rollback(&self, slots: &[CounterSlot]) -> Result<()>;

    /// Delete each counter. Missing counters are ignored.
    async fn flush(&self, slots: &[CounterSlot]) -> Result<()>;

    /// Current value of each counter, zero when absent.
    async fn current(&self, slots: &[CounterSlot]) -> Result<Vec<i64>>;
}
