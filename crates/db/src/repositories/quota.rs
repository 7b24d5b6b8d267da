use async_trait::async_trait;
use chrono::Utc;

use leadroute_core::domain::quota::QuotaKey;
use leadroute_core::quota::{
    CounterIncrement, IncrementOutcome, QuotaCounterStore, QuotaStoreError,
};

use crate::DbPool;

/// Creates the counter at 1 or bumps it, but only while it is below the bound.
/// Zero affected rows means the bound was reached.
const BOUNDED_INCREMENT: &str = "
    INSERT INTO quota_counter (rule_id, period_kind, period_key, count, updated_at)
    SELECT ?1, ?2, ?3, 1, ?4 WHERE ?5 >= 1
    ON CONFLICT(rule_id, period_kind, period_key) DO UPDATE SET
        count = quota_counter.count + 1,
        updated_at = excluded.updated_at
    WHERE quota_counter.count < ?5";

const UNBOUNDED_INCREMENT: &str = "
    INSERT INTO quota_counter (rule_id, period_kind, period_key, count, updated_at)
    VALUES (?1, ?2, ?3, 1, ?4)
    ON CONFLICT(rule_id, period_kind, period_key) DO UPDATE SET
        count = quota_counter.count + 1,
        updated_at = excluded.updated_at";

/// SQLite-backed counters. Each reservation runs in one transaction, so either every
/// period counter moves or none does, and the check-and-increment is one statement.
pub struct SqlQuotaCounterStore {
    pool: DbPool,
}

impl SqlQuotaCounterStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn unavailable(error: sqlx::Error) -> QuotaStoreError {
    QuotaStoreError::Unavailable(error.to_string())
}

#[async_trait]
impl QuotaCounterStore for SqlQuotaCounterStore {
    async fn increment_within(
        &self,
        increments: &[CounterIncrement],
    ) -> Result<IncrementOutcome, QuotaStoreError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        for increment in increments {
            let key = &increment.key;
            let result = match increment.bound {
                Some(bound) => {
                    let bound = i64::try_from(bound).unwrap_or(i64::MAX);
                    sqlx::query(BOUNDED_INCREMENT)
                        .bind(&key.rule_id.0)
                        .bind(key.kind.as_str())
                        .bind(&key.period_key)
                        .bind(&now)
                        .bind(bound)
                        .execute(&mut *tx)
                        .await
                }
                None => {
                    sqlx::query(UNBOUNDED_INCREMENT)
                        .bind(&key.rule_id.0)
                        .bind(key.kind.as_str())
                        .bind(&key.period_key)
                        .bind(&now)
                        .execute(&mut *tx)
                        .await
                }
            }
            .map_err(unavailable)?;

            if result.rows_affected() == 0 {
                tx.rollback().await.map_err(unavailable)?;
                return Ok(IncrementOutcome::Rejected { key: key.clone() });
            }
        }

        tx.commit().await.map_err(unavailable)?;
        Ok(IncrementOutcome::Applied)
    }

    async fn count(&self, key: &QuotaKey) -> Result<u64, QuotaStoreError> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM quota_counter
             WHERE rule_id = ? AND period_kind = ? AND period_key = ?",
        )
        .bind(&key.rule_id.0)
        .bind(key.kind.as_str())
        .bind(&key.period_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        match count {
            None => Ok(0),
            Some(value) => u64::try_from(value).map_err(|_| QuotaStoreError::Corrupt {
                key: key.to_string(),
                detail: format!("negative count {value}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use leadroute_core::domain::quota::{PeriodKind, QuotaKey};
    use leadroute_core::domain::rule::{RuleCaps, RuleId};
    use leadroute_core::quota::{
        CounterIncrement, IncrementOutcome, QuotaCounterStore, QuotaGate, Reservation,
    };

    use super::SqlQuotaCounterStore;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn key(rule: &str, kind: PeriodKind) -> QuotaKey {
        let at = Utc.with_ymd_and_hms(2026, 7, 9, 14, 0, 0).single().expect("timestamp");
        QuotaKey::for_period(&RuleId(rule.to_string()), kind, at)
    }

    #[tokio::test]
    async fn bounded_increment_stops_at_bound() {
        let store = SqlQuotaCounterStore::new(setup().await);
        let daily = key("rule-1", PeriodKind::Daily);
        let increment = [CounterIncrement { key: daily.clone(), bound: Some(2) }];

        assert_eq!(store.increment_within(&increment).await, Ok(IncrementOutcome::Applied));
        assert_eq!(store.increment_within(&increment).await, Ok(IncrementOutcome::Applied));
        assert_eq!(
            store.increment_within(&increment).await,
            Ok(IncrementOutcome::Rejected { key: daily.clone() })
        );
        assert_eq!(store.count(&daily).await, Ok(2));
    }

    #[tokio::test]
    async fn rejected_second_counter_rolls_back_first() {
        let store = SqlQuotaCounterStore::new(setup().await);
        let daily = key("rule-2", PeriodKind::Daily);
        let monthly = key("rule-2", PeriodKind::Monthly);

        let first = [
            CounterIncrement { key: daily.clone(), bound: None },
            CounterIncrement { key: monthly.clone(), bound: Some(1) },
        ];
        assert_eq!(store.increment_within(&first).await, Ok(IncrementOutcome::Applied));
        assert_eq!(
            store.increment_within(&first).await,
            Ok(IncrementOutcome::Rejected { key: monthly.clone() })
        );

        assert_eq!(store.count(&daily).await, Ok(1));
        assert_eq!(store.count(&monthly).await, Ok(1));
    }

    #[tokio::test]
    async fn missing_counter_reads_as_zero() {
        let store = SqlQuotaCounterStore::new(setup().await);
        assert_eq!(store.count(&key("rule-never", PeriodKind::Monthly)).await, Ok(0));
    }

    #[tokio::test]
    async fn gate_over_sql_store_enforces_daily_cap() {
        let gate = QuotaGate::new(Arc::new(SqlQuotaCounterStore::new(setup().await)));
        let rule = RuleId("rule-3".to_string());
        let caps = RuleCaps { daily: Some(3), monthly: Some(100) };
        let now = Utc.with_ymd_and_hms(2026, 7, 9, 14, 0, 0).single().expect("timestamp");

        let mut reserved = 0;
        for _ in 0..5 {
            if gate.try_reserve(&rule, caps, now).await.expect("store healthy")
                == Reservation::Reserved
            {
                reserved += 1;
            }
        }

        let usage = gate.usage(&rule, caps, now).await.expect("usage");
        assert_eq!(reserved, 3);
        assert_eq!(usage.daily.count, 3);
        assert_eq!(usage.monthly.count, 3);
        assert_eq!(usage.daily.remaining(), Some(0));
    }
}
