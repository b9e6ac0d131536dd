//! Core grant engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, trace, warn};

use super::backend::{CounterBackend, CounterSlot};
use super::identifier::WindowIdentifier;
use super::rate::{RateIdent, RateLimit};
use crate::clock::{Clock, SystemClock};
use crate::config::QuotaConfig;
use crate::error::{QuotaError, Result};

/// Result of evaluating a set of rates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    /// Every rate had room; the increments stay applied.
    Granted,
    /// `limit` was the first rate over its ceiling; nothing was kept.
    Exceeded {
        limit: RateLimit,
        next_available: DateTime<Utc>,
    },
}

impl GrantOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, GrantOutcome::Granted)
    }
}

/// Grants units of work against time-windowed counters in a shared store.
///
/// The engine holds only immutable configuration and can be shared freely
/// across tasks. All coordination happens in the backend.
pub struct Quota<B> {
    backend: B,
    /// Prefix of every counter identifier
    prefix: String,
    /// Rates evaluated on every call, ahead of per-call rates
    rates: Vec<RateLimit>,
    clock: Arc<dyn Clock>,
}

impl<B: CounterBackend> Quota<B> {
    /// Create an engine over `backend`.
    ///
    /// Fails with [`QuotaError::Config`] when the prefix could not be parsed
    /// back out of the identifiers it builds.
    pub fn new(backend: B, config: QuotaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            prefix: config.prefix,
            rates: config.rates,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The counter backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Prefix of every identifier this engine builds.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The default rates.
    pub fn rates(&self) -> &[RateLimit] {
        &self.rates
    }

    /// Identifier of the current window of `ident`.
    pub fn build_identifier(&self, ident: &RateIdent) -> WindowIdentifier {
        WindowIdentifier::build(&self.prefix, ident, self.clock.now())
    }

    /// Parse an identifier produced by [`Quota::build_identifier`].
    pub fn parse_identifier(&self, identifier: &str) -> Result<WindowIdentifier> {
        WindowIdentifier::parse(identifier)
    }

    /// Consume one unit of every default rate and every rate in `rates`.
    ///
    /// Either all counters keep their increment, or none do and the call fails
    /// with [`QuotaError::QuotaExceeded`].
    pub async fn grant(&self, rates: &[RateLimit]) -> Result<()> {
        match self.check(rates).await? {
            GrantOutcome::Granted => Ok(()),
            GrantOutcome::Exceeded {
                limit,
                next_available,
            } => Err(QuotaError::QuotaExceeded {
                limit,
                next_available,
            }),
        }
    }

    /// Like [`Quota::grant`], but returns a violation as a value.
    ///
    /// Rates are evaluated in order, defaults first. Evaluation stops at the
    /// first rate over its ceiling and only that rate is reported, even if a
    /// later one would reset sooner.
    pub async fn check(&self, rates: &[RateLimit]) -> Result<GrantOutcome> {
        let merged: Vec<&RateLimit> = self.rates.iter().chain(rates).collect();
        if merged.is_empty() {
            return Ok(GrantOutcome::Granted);
        }

        let now = self.clock.now();
        let slots: Vec<CounterSlot> = merged
            .iter()
            .map(|rate| {
                CounterSlot::new(
                    WindowIdentifier::build(&self.prefix, &rate.ident(), now),
                    rate.unit,
                )
            })
            .collect();

        trace!(prefix = %self.prefix, rates = slots.len(), "Granting");

        let values = self.backend.increment(&slots).await?;
        if values.len() != slots.len() {
            return Err(QuotaError::Backend(format!(
                "increment of {} counters returned {} values",
                slots.len(),
                values.len()
            )));
        }

        let violation = merged
            .iter()
            .zip(&slots)
            .zip(&values)
            .find(|((rate, _), value)| exceeds(**value, rate.limit));

        let Some(((rate, slot), value)) = violation else {
            debug!(prefix = %self.prefix, values = ?values, "Quota granted");
            return Ok(GrantOutcome::Granted);
        };

        let next_available = slot.window_end();
        debug!(
            identifier = %slot.identifier,
            value = value,
            limit = rate.limit,
            next_available = %next_available,
            "Quota exceeded, rolling back"
        );

        if let Err(e) = self.backend.rollback(&slots).await {
            error!(
                identifier = %slot.identifier,
                next_available = %next_available,
                error = %e,
                "Rollback failed after quota violation; counters may stay incremented"
            );
            return Err(e);
        }

        Ok(GrantOutcome::Exceeded {
            limit: (*rate).clone(),
            next_available,
        })
    }

    /// Grant `rates`, returning when the work may run: now if granted,
    /// otherwise the end of the violated window.
    pub async fn schedule(&self, rates: &[RateLimit]) -> Result<DateTime<Utc>> {
        match self.check(rates).await? {
            GrantOutcome::Granted => Ok(self.clock.now()),
            GrantOutcome::Exceeded {
                limit,
                next_available,
            } => {
                warn!(
                    key = %limit.key,
                    unit = %limit.unit,
                    next_available = %next_available,
                    "Scheduling past quota"
                );
                Ok(next_available)
            }
        }
    }

    /// Delete the current-window counters of `idents`, or of every default
    /// rate when `idents` is empty.
    pub async fn flush(&self, idents: &[RateIdent]) -> Result<()> {
        let slots = self.slots_for(idents);
        if slots.is_empty() {
            return Ok(());
        }

        self.backend.flush(&slots).await?;
        debug!(prefix = %self.prefix, counters = slots.len(), "Flushed counters");
        Ok(())
    }

    /// Current-window usage of `idents` (every default rate when empty),
    /// in order; zero for counters that do not exist.
    pub async fn usage(&self, idents: &[RateIdent]) -> Result<Vec<u64>> {
        let slots = self.slots_for(idents);
        if slots.is_empty() {
            return Ok(Vec::new());
        }

        let values = self.backend.current(&slots).await?;
        Ok(values.into_iter().map(|v| v.max(0) as u64).collect())
    }

    fn slots_for(&self, idents: &[RateIdent]) -> Vec<CounterSlot> {
        let now = self.clock.now();
        let defaults: Vec<RateIdent>;
        let idents: &[RateIdent] = if idents.is_empty() {
            defaults = self.rates.iter().map(RateLimit::ident).collect();
            &defaults
        } else {
            idents
        };

        idents
            .iter()
            .map(|ident| {
                CounterSlot::new(WindowIdentifier::build(&self.prefix, ident, now), ident.unit)
            })
            .collect()
    }
}

/// A post-increment counter value over the ceiling.
fn exceeds(value: i64, limit: u64) -> bool {
    value > 0 && value as u64 > limit
}

impl<B> std::fmt::Debug for Quota<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Quota")
            .field("prefix", &self.prefix)
            .field("rates", &self.rates)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::quota::TimeUnit;
    use crate::store::{DocumentBackend, KeyValueBackend, MemoryStore};
    use chrono::{Duration, TimeZone};
    use tokio_test::{assert_err, assert_ok};

    fn reference_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 14, 13, 45, 30).unwrap()
    }

    type MemoryQuota = Quota<KeyValueBackend<MemoryStore>>;

    fn fixture(rates: Vec<RateLimit>) -> (MemoryQuota, MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(reference_now()));
        let store = MemoryStore::with_clock(clock.clone());
        let quota = Quota::new(
            KeyValueBackend::new(store.clone()),
            QuotaConfig {
                rates,
                ..QuotaConfig::default()
            },
        )
        .unwrap()
        .with_clock(clock.clone());
        (quota, store, clock)
    }

    fn value_of(quota: &MemoryQuota, store: &MemoryStore, key: &str, unit: TimeUnit) -> Option<i64> {
        store.get(&quota.build_identifier(&RateIdent::new(key, unit)).to_string())
    }

    #[tokio::test]
    async fn test_grant_up_to_limit() {
        let (quota, _, _) = fixture(vec![RateLimit::new("foo", TimeUnit::Minute, 2)]);

        assert_ok!(quota.grant(&[]).await);
        assert_ok!(quota.grant(&[]).await);
        let err = assert_err!(quota.grant(&[]).await);
        assert!(err.is_quota_exceeded());
    }

    #[tokio::test]
    async fn test_exceeded_carries_limit_and_window_end() {
        let (quota, _, _) = fixture(vec![RateLimit::new("foo", TimeUnit::Month, 1)]);

        quota.grant(&[]).await.unwrap();
        match quota.grant(&[]).await.unwrap_err() {
            QuotaError::QuotaExceeded {
                limit,
                next_available,
            } => {
                assert_eq!(limit, RateLimit::new("foo", TimeUnit::Month, 1));
                assert_eq!(next_available, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_per_call_rates_add_to_defaults() {
        let (quota, _, _) = fixture(vec![RateLimit::new("foo", TimeUnit::Second, 2)]);

        let err = quota
            .grant(&[RateLimit::new("foo", TimeUnit::Minute, 0)])
            .await
            .unwrap_err();
        assert!(err.is_quota_exceeded());
    }

    #[tokio::test]
    async fn test_rollback_restores_counters() {
        let (quota, store, _) = fixture(Vec::new());
        let year = |limit| RateLimit::new("foo", TimeUnit::Year, limit);

        quota.grant(&[year(1)]).await.unwrap();
        assert_eq!(value_of(&quota, &store, "foo", TimeUnit::Year), Some(1));

        // The same counter listed twice: 2 then 3, the second is over
        let err = quota.grant(&[year(2), year(2)]).await.unwrap_err();
        assert!(err.is_quota_exceeded());
        assert_eq!(value_of(&quota, &store, "foo", TimeUnit::Year), Some(1));
    }

    #[tokio::test]
    async fn test_rollback_covers_rates_after_the_violation() {
        let (quota, store, _) = fixture(Vec::new());

        let err = quota
            .grant(&[
                RateLimit::new("tight", TimeUnit::Hour, 0),
                RateLimit::new("loose", TimeUnit::Hour, 10),
            ])
            .await
            .unwrap_err();
        assert!(err.is_quota_exceeded());

        assert_eq!(value_of(&quota, &store, "tight", TimeUnit::Hour), Some(0));
        assert_eq!(value_of(&quota, &store, "loose", TimeUnit::Hour), Some(0));
    }

    #[tokio::test]
    async fn test_first_violation_in_order_is_reported() {
        let (quota, _, _) = fixture(Vec::new());
        let day = RateLimit::new("d", TimeUnit::Day, 0);
        let minute = RateLimit::new("m", TimeUnit::Minute, 0);

        let outcome = quota.check(&[day.clone(), minute.clone()]).await.unwrap();
        assert_eq!(
            outcome,
            GrantOutcome::Exceeded {
                limit: day.clone(),
                next_available: Utc.with_ymd_and_hms(2024, 2, 15, 0, 0, 0).unwrap(),
            }
        );

        // Reversed: the minute window wins, not the earliest reset
        let outcome = quota.check(&[minute.clone(), day]).await.unwrap();
        assert_eq!(
            outcome,
            GrantOutcome::Exceeded {
                limit: minute,
                next_available: Utc.with_ymd_and_hms(2024, 2, 14, 13, 46, 0).unwrap(),
            }
        );
    }

    #[tokio::test]
    async fn test_only_violated_rates_are_reported() {
        let (quota, _, _) = fixture(Vec::new());
        let open = RateLimit::new("open", TimeUnit::Second, 5);
        let closed = RateLimit::new("closed", TimeUnit::Week, 0);

        let outcome = quota.check(&[open, closed.clone()]).await.unwrap();
        assert_eq!(
            outcome,
            GrantOutcome::Exceeded {
                limit: closed,
                next_available: Utc.with_ymd_and_hms(2024, 2, 18, 0, 0, 0).unwrap(),
            }
        );
    }

    #[tokio::test]
    async fn test_window_expiry_resets_quota() {
        let (quota, _, clock) = fixture(vec![RateLimit::new("foo", TimeUnit::Second, 1)]);

        quota.grant(&[]).await.unwrap();
        assert!(quota.grant(&[]).await.is_err());

        clock.advance(Duration::milliseconds(1001));
        assert_ok!(quota.grant(&[]).await);
    }

    #[tokio::test]
    async fn test_schedule_returns_now_then_next_window() {
        let (quota, _, clock) = fixture(Vec::new());
        let rate = RateLimit::new("foo", TimeUnit::Minute, 1);

        let first = quota.schedule(std::slice::from_ref(&rate)).await.unwrap();
        assert_eq!(first, clock.now());

        let second = quota.schedule(std::slice::from_ref(&rate)).await.unwrap();
        let minute_start = TimeUnit::Minute.window_start(clock.now());
        assert_eq!((second - minute_start).num_milliseconds(), 60_000);
    }

    #[tokio::test]
    async fn test_flush_removes_only_given_counters() {
        let (quota, store, _) = fixture(Vec::new());
        for key in ["foo0", "foo1", "foo2"] {
            quota.grant(&[RateLimit::new(key, TimeUnit::Year, 10)]).await.unwrap();
        }

        quota.flush(&[RateIdent::new("foo0", TimeUnit::Year)]).await.unwrap();
        quota.flush(&[RateIdent::new("foo2", TimeUnit::Year)]).await.unwrap();

        assert_eq!(value_of(&quota, &store, "foo0", TimeUnit::Year), None);
        assert_eq!(value_of(&quota, &store, "foo1", TimeUnit::Year), Some(1));
        assert_eq!(value_of(&quota, &store, "foo2", TimeUnit::Year), None);
    }

    #[tokio::test]
    async fn test_flush_without_idents_clears_defaults() {
        let (quota, store, _) = fixture(vec![
            RateLimit::new("a", TimeUnit::Hour, 5),
            RateLimit::new("b", TimeUnit::Day, 5),
        ]);
        quota.grant(&[RateLimit::new("extra", TimeUnit::Hour, 5)]).await.unwrap();

        quota.flush(&[]).await.unwrap();

        let extra = quota.build_identifier(&RateIdent::new("extra", TimeUnit::Hour));
        assert_eq!(store.keys(), vec![extra.to_string()]);
    }

    #[tokio::test]
    async fn test_flush_missing_counter_is_ok() {
        let (quota, _, _) = fixture(Vec::new());
        assert_ok!(quota.flush(&[RateIdent::new("never", TimeUnit::Day)]).await);
    }

    #[tokio::test]
    async fn test_usage() {
        let (quota, _, _) = fixture(vec![RateLimit::new("a", TimeUnit::Hour, 5)]);
        quota.grant(&[]).await.unwrap();
        quota.grant(&[]).await.unwrap();

        assert_eq!(quota.usage(&[]).await.unwrap(), vec![2]);
        assert_eq!(
            quota.usage(&[RateIdent::new("b", TimeUnit::Hour)]).await.unwrap(),
            vec![0]
        );
    }

    #[tokio::test]
    async fn test_counter_ttl_is_window_duration() {
        let (quota, store, _) = fixture(vec![RateLimit::new("a", TimeUnit::Hour, 5)]);
        quota.grant(&[]).await.unwrap();

        let key = quota.build_identifier(&RateIdent::new("a", TimeUnit::Hour)).to_string();
        assert_eq!(store.ttl_millis(&key), Some(3_600_000));
    }

    #[tokio::test]
    async fn test_no_rates_is_granted() {
        let (quota, store, _) = fixture(Vec::new());
        assert_ok!(quota.grant(&[]).await);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_build_and_parse_identifier() {
        let (quota, _, clock) = fixture(Vec::new());
        let ident = RateIdent::new("foo", TimeUnit::Minute);

        let built = quota.build_identifier(&ident);
        let parsed = quota.parse_identifier(&built.to_string()).unwrap();
        assert_eq!(parsed.prefix, "quota");
        assert_eq!(parsed.key, "foo");
        assert_eq!(parsed.window_start_at(), TimeUnit::Minute.window_start(clock.now()));
    }

    #[tokio::test]
    async fn test_document_backend_grant_and_rollback() {
        let clock = Arc::new(ManualClock::new(reference_now()));
        let store = MemoryStore::with_clock(clock.clone());
        let quota = Quota::new(
            DocumentBackend::new(store.clone(), "tenant-a"),
            QuotaConfig {
                rates: vec![RateLimit::new("foo", TimeUnit::Minute, 2)],
                ..QuotaConfig::default()
            },
        )
        .unwrap()
        .with_clock(clock.clone());

        quota.grant(&[]).await.unwrap();
        quota.grant(&[]).await.unwrap();
        let err = quota.grant(&[]).await.unwrap_err();
        assert_eq!(
            err.next_available(),
            Some(Utc.with_ymd_and_hms(2024, 2, 14, 13, 46, 0).unwrap())
        );

        let docs = store.documents();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].namespace, "tenant-a");
        assert_eq!(docs[0].ttl, 60_000);
        assert_eq!(docs[0].value, 2);
        assert_eq!(docs[0].expire_at, Utc.with_ymd_and_hms(2024, 2, 14, 13, 46, 0).unwrap());

        clock.advance(Duration::minutes(1));
        assert_ok!(quota.grant(&[]).await);
    }

    #[tokio::test]
    async fn test_namespaces_are_independent() {
        let clock = Arc::new(ManualClock::new(reference_now()));
        let store = MemoryStore::with_clock(clock.clone());
        let rate = RateLimit::new("foo", TimeUnit::Hour, 1);
        let a = Quota::new(DocumentBackend::new(store.clone(), "a"), QuotaConfig::default())
            .unwrap()
            .with_clock(clock.clone());
        let b = Quota::new(DocumentBackend::new(store.clone(), "b"), QuotaConfig::default())
            .unwrap()
            .with_clock(clock.clone());

        assert_ok!(a.grant(std::slice::from_ref(&rate)).await);
        assert_ok!(b.grant(std::slice::from_ref(&rate)).await);
        assert_err!(a.grant(std::slice::from_ref(&rate)).await);
    }

    #[tokio::test]
    async fn test_concurrent_grants_never_exceed_limit() {
        let (quota, store, _) = fixture(vec![RateLimit::new("shared", TimeUnit::Hour, 10)]);
        let quota = Arc::new(quota);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let quota = quota.clone();
                tokio::spawn(async move { quota.grant(&[]).await.is_ok() })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, 10);
        assert_eq!(value_of(&quota, &store, "shared", TimeUnit::Hour), Some(10));
    }

    #[test]
    fn test_prefix_must_parse_back() {
        for prefix in ["my-app", ""] {
            let config = QuotaConfig {
                prefix: prefix.to_string(),
                ..QuotaConfig::default()
            };
            let err = Quota::new(KeyValueBackend::new(MemoryStore::new()), config).unwrap_err();
            assert!(matches!(err, QuotaError::Config(_)), "{:?}", prefix);
        }

        let config = QuotaConfig {
            prefix: "my_app".to_string(),
            ..QuotaConfig::default()
        };
        let quota = Quota::new(KeyValueBackend::new(MemoryStore::new()), config).unwrap();
        let built = quota.build_identifier(&RateIdent::new("foo", TimeUnit::Minute));
        let parsed = quota.parse_identifier(&built.to_string()).unwrap();
        assert_eq!(parsed.prefix, "my_app");
    }

    #[test]
    fn test_exceeds_is_strict() {
        assert!(!exceeds(2, 2));
        assert!(exceeds(3, 2));
        assert!(exceeds(1, 0));
        assert!(!exceeds(0, 0));
        assert!(!exceeds(-1, 0));
    }
}
