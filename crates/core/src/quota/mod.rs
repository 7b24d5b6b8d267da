//! Per-rule capacity enforcement.
//!
//! [`QuotaGate`] turns a rule's daily/monthly caps into bounded counter increments
//! and hands them to a [`QuotaCounterStore`] as one all-or-nothing operation. The
//! store is the only place counters are read or written, so cap enforcement is as
//! strong as the store's atomicity: the gate never does read-then-write itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::quota::{PeriodKind, QuotaKey};
use crate::domain::rule::{RuleCaps, RuleId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QuotaStoreError {
    #[error("quota store unavailable: {0}")]
    Unavailable(String),
    #[error("quota counter `{key}` is corrupt: {detail}")]
    Corrupt { key: String, detail: String },
}

/// One counter bump. `bound = None` is a plain increment; otherwise the counter may
/// only be incremented while the result stays `<= bound`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterIncrement {
    pub key: QuotaKey,
    pub bound: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IncrementOutcome {
    /// Every increment was applied.
    Applied,
    /// Nothing was applied; `key` is the first counter whose bound would be exceeded.
    Rejected { key: QuotaKey },
}

#[async_trait]
pub trait QuotaCounterStore: Send + Sync {
    /// Applies all increments atomically, or none of them when any bound would be exceeded.
    async fn increment_within(
        &self,
        increments: &[CounterIncrement],
    ) -> Result<IncrementOutcome, QuotaStoreError>;

    /// Current value of a counter; zero when it was never created.
    async fn count(&self, key: &QuotaKey) -> Result<u64, QuotaStoreError>;
}

/// Single-node counter store. A single lock guards every counter, which serializes
/// reservations the same way a per-rule actor would.
#[derive(Default)]
pub struct InMemoryQuotaCounterStore {
    counters: Mutex<HashMap<QuotaKey, u64>>,
}

#[async_trait]
impl QuotaCounterStore for InMemoryQuotaCounterStore {
    async fn increment_within(
        &self,
        increments: &[CounterIncrement],
    ) -> Result<IncrementOutcome, QuotaStoreError> {
        let mut counters = self.counters.lock().await;

        for increment in increments {
            let current = counters.get(&increment.key).copied().unwrap_or(0);
            if matches!(increment.bound, Some(bound) if current + 1 > bound) {
                return Ok(IncrementOutcome::Rejected { key: increment.key.clone() });
            }
        }

        for increment in increments {
            *counters.entry(increment.key.clone()).or_insert(0) += 1;
        }
        Ok(IncrementOutcome::Applied)
    }

    async fn count(&self, key: &QuotaKey) -> Result<u64, QuotaStoreError> {
        Ok(self.counters.lock().await.get(key).copied().unwrap_or(0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Reservation {
    Reserved,
    CapExceeded { period: PeriodKind },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodUsage {
    pub period: PeriodKind,
    pub period_key: String,
    pub count: u64,
    pub cap: Option<i64>,
}

impl PeriodUsage {
    pub fn remaining(&self) -> Option<u64> {
        self.cap.map(|cap| u64::try_from(cap).unwrap_or(0).saturating_sub(self.count))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub rule_id: RuleId,
    pub daily: PeriodUsage,
    pub monthly: PeriodUsage,
}

#[derive(Clone)]
pub struct QuotaGate {
    store: Arc<dyn QuotaCounterStore>,
}

impl QuotaGate {
    pub fn new(store: Arc<dyn QuotaCounterStore>) -> Self {
        Self { store }
    }

    /// Reserves one unit of capacity on `rule_id` for the periods containing `now`.
    ///
    /// Both periods are always counted; only configured caps bound the increment.
    /// A stored cap of zero or less is treated as exhausted without touching counters.
    pub async fn try_reserve(
        &self,
        rule_id: &RuleId,
        caps: RuleCaps,
        now: DateTime<Utc>,
    ) -> Result<Reservation, QuotaStoreError> {
        let mut increments = Vec::with_capacity(2);

        for (period, cap) in [(PeriodKind::Daily, caps.daily), (PeriodKind::Monthly, caps.monthly)]
        {
            let bound = match cap {
                Some(cap) if cap <= 0 => {
                    warn!(
                        event_name = "quota.invalid_cap",
                        rule_id = %rule_id,
                        period = %period,
                        cap,
                        "stored cap is not positive; treating rule as exhausted"
                    );
                    return Ok(Reservation::CapExceeded { period });
                }
                Some(cap) => Some(cap as u64),
                None => None,
            };
            let key = QuotaKey::for_period(rule_id, period, now);
            increments.push(CounterIncrement { key, bound });
        }

        match self.store.increment_within(&increments).await? {
            IncrementOutcome::Applied => Ok(Reservation::Reserved),
            IncrementOutcome::Rejected { key } => Ok(Reservation::CapExceeded { period: key.kind }),
        }
    }

    pub async fn usage(
        &self,
        rule_id: &RuleId,
        caps: RuleCaps,
        now: DateTime<Utc>,
    ) -> Result<QuotaUsage, QuotaStoreError> {
        let daily_key = QuotaKey::for_period(rule_id, PeriodKind::Daily, now);
        let monthly_key = QuotaKey::for_period(rule_id, PeriodKind::Monthly, now);
        let daily_count = self.store.count(&daily_key).await?;
        let monthly_count = self.store.count(&monthly_key).await?;

        Ok(QuotaUsage {
            rule_id: rule_id.clone(),
            daily: PeriodUsage {
                period: PeriodKind::Daily,
                period_key: daily_key.period_key,
                count: daily_count,
                cap: caps.daily,
            },
            monthly: PeriodUsage {
                period: PeriodKind::Monthly,
                period_key: monthly_key.period_key,
                count: monthly_count,
                cap: caps.monthly,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};

    use super::{InMemoryQuotaCounterStore, QuotaCounterStore, QuotaGate, Reservation};
    use crate::clock::{Clock, ManualClock};
    use crate::domain::quota::{PeriodKind, QuotaKey};
    use crate::domain::rule::{RuleCaps, RuleId};

    fn gate() -> (QuotaGate, Arc<InMemoryQuotaCounterStore>) {
        let store = Arc::new(InMemoryQuotaCounterStore::default());
        (QuotaGate::new(store.clone()), store)
    }

    fn daily(cap: i64) -> RuleCaps {
        RuleCaps { daily: Some(cap), monthly: None }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_exceed_daily_cap() {
        let (gate, store) = gate();
        let rule = RuleId("r-concurrent".to_string());
        let now = Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).single().expect("timestamp");

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let gate = gate.clone();
                let rule = rule.clone();
                tokio::spawn(async move { gate.try_reserve(&rule, daily(5), now).await })
            })
            .collect();

        let mut reserved = 0;
        let mut exceeded = 0;
        for handle in handles {
            match handle.await.expect("task joined").expect("store healthy") {
                Reservation::Reserved => reserved += 1,
                Reservation::CapExceeded { period } => {
                    assert_eq!(period, PeriodKind::Daily);
                    exceeded += 1;
                }
            }
        }

        assert_eq!(reserved, 5);
        assert_eq!(exceeded, 15);
        let key = QuotaKey::for_period(&rule, PeriodKind::Daily, now);
        assert_eq!(store.count(&key).await.expect("count"), 5);
    }

    #[tokio::test]
    async fn exhausted_daily_cap_resets_on_next_day() {
        let (gate, _) = gate();
        let rule = RuleId("r-rollover".to_string());
        let day = Utc.with_ymd_and_hms(2026, 5, 4, 23, 59, 0).single().expect("timestamp");

        assert_eq!(gate.try_reserve(&rule, daily(1), day).await, Ok(Reservation::Reserved));
        assert_eq!(
            gate.try_reserve(&rule, daily(1), day).await,
            Ok(Reservation::CapExceeded { period: PeriodKind::Daily })
        );
        assert_eq!(
            gate.try_reserve(&rule, daily(1), day + Duration::minutes(2)).await,
            Ok(Reservation::Reserved)
        );
    }

    #[tokio::test]
    async fn exhausted_monthly_cap_resets_on_first_of_next_month() {
        let (gate, _) = gate();
        let rule = RuleId("r-month-end".to_string());
        let caps = RuleCaps { daily: None, monthly: Some(1) };
        let clock = ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 31, 8, 0, 0).single().expect("timestamp"),
        );

        assert_eq!(gate.try_reserve(&rule, caps, clock.now()).await, Ok(Reservation::Reserved));
        clock.advance(Duration::hours(15));
        assert_eq!(
            gate.try_reserve(&rule, caps, clock.now()).await,
            Ok(Reservation::CapExceeded { period: PeriodKind::Monthly })
        );

        clock.set(Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 1).single().expect("timestamp"));
        assert_eq!(gate.try_reserve(&rule, caps, clock.now()).await, Ok(Reservation::Reserved));

        let usage = gate.usage(&rule, caps, clock.now()).await.expect("usage");
        assert_eq!(usage.monthly.period_key, "2026-06");
        assert_eq!(usage.monthly.count, 1);
    }

    #[tokio::test]
    async fn monthly_rejection_rolls_back_daily_increment() {
        let (gate, store) = gate();
        let rule = RuleId("r-monthly".to_string());
        let caps = RuleCaps { daily: Some(10), monthly: Some(1) };
        let now = Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).single().expect("timestamp");

        assert_eq!(gate.try_reserve(&rule, caps, now).await, Ok(Reservation::Reserved));
        assert_eq!(
            gate.try_reserve(&rule, caps, now + Duration::days(1)).await,
            Ok(Reservation::CapExceeded { period: PeriodKind::Monthly })
        );

        let next_day = QuotaKey::for_period(&rule, PeriodKind::Daily, now + Duration::days(1));
        assert_eq!(store.count(&next_day).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn non_positive_stored_cap_is_always_exceeded() {
        let (gate, store) = gate();
        let rule = RuleId("r-broken".to_string());
        let now = Utc::now();

        assert_eq!(
            gate.try_reserve(&rule, daily(0), now).await,
            Ok(Reservation::CapExceeded { period: PeriodKind::Daily })
        );
        let key = QuotaKey::for_period(&rule, PeriodKind::Daily, now);
        assert_eq!(store.count(&key).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn unlimited_rule_is_counted_for_usage() {
        let (gate, _) = gate();
        let rule = RuleId("r-open".to_string());
        let now = Utc::now();

        for _ in 0..3 {
            assert_eq!(
                gate.try_reserve(&rule, RuleCaps::unlimited(), now).await,
                Ok(Reservation::Reserved)
            );
        }

        let usage = gate.usage(&rule, RuleCaps::unlimited(), now).await.expect("usage");
        assert_eq!(usage.daily.count, 3);
        assert_eq!(usage.monthly.count, 3);
        assert_eq!(usage.daily.remaining(), None);
    }
}
