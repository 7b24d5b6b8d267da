use async_trait::async_trait;
use sqlx::Row;

use leadroute_core::domain::rule::{
    AssignmentRule, OrgId, RuleCaps, RuleId, UserId, WILDCARD_FUNNEL,
};
use leadroute_core::engine::{RuleStore, RuleStoreError};

use super::{parse_timestamp, RepositoryError, RuleRepository};
use crate::DbPool;

const RULE_COLUMNS: &str = "id, funnel_id, org_id, target_user_id, zip_patterns_json, priority,
                            daily_cap, monthly_cap, is_active, created_at, updated_at";

pub struct SqlRuleRepository {
    pool: DbPool,
}

impl SqlRuleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> Result<AssignmentRule, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let funnel_id: String =
        row.try_get("funnel_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let org_id: String =
        row.try_get("org_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let target_user_id: Option<String> =
        row.try_get("target_user_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let zip_patterns_json: String =
        row.try_get("zip_patterns_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let priority: i32 =
        row.try_get("priority").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let daily_cap: Option<i64> =
        row.try_get("daily_cap").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let monthly_cap: Option<i64> =
        row.try_get("monthly_cap").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let is_active: bool =
        row.try_get("is_active").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let zip_patterns: Vec<String> = serde_json::from_str(&zip_patterns_json).map_err(|e| {
        RepositoryError::Decode(format!("rule {id} has malformed zip_patterns_json: {e}"))
    })?;

    Ok(AssignmentRule {
        id: RuleId(id),
        funnel_id,
        org_id: OrgId(org_id),
        target_user_id: target_user_id.map(UserId),
        zip_patterns,
        priority,
        caps: RuleCaps { daily: daily_cap, monthly: monthly_cap },
        is_active,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

#[async_trait]
impl RuleRepository for SqlRuleRepository {
    async fn find_by_id(&self, id: &RuleId) -> Result<Option<AssignmentRule>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RULE_COLUMNS} FROM assignment_rule WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_rule(r)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, funnel_id: Option<&str>) -> Result<Vec<AssignmentRule>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = if let Some(funnel_id) = funnel_id {
            sqlx::query(&format!(
                "SELECT {RULE_COLUMNS} FROM assignment_rule
                 WHERE funnel_id = ?
                 ORDER BY priority ASC, created_at ASC, id ASC"
            ))
            .bind(funnel_id)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {RULE_COLUMNS} FROM assignment_rule
                 ORDER BY funnel_id ASC, priority ASC, created_at ASC, id ASC"
            ))
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter().map(row_to_rule).collect::<Result<Vec<_>, _>>()
    }

    async fn list_active_for_funnel(
        &self,
        funnel_id: &str,
    ) -> Result<Vec<AssignmentRule>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM assignment_rule
             WHERE is_active = 1 AND funnel_id IN (?, ?)"
        ))
        .bind(funnel_id)
        .bind(WILDCARD_FUNNEL)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_rule).collect::<Result<Vec<_>, _>>()
    }

    async fn save(&self, rule: AssignmentRule) -> Result<(), RepositoryError> {
        let zip_patterns_json = serde_json::to_string(&rule.zip_patterns)
            .map_err(|e| RepositoryError::Decode(e.to_string()))?;

        sqlx::query(
            "INSERT INTO assignment_rule (id, funnel_id, org_id, target_user_id, zip_patterns_json,
                                          priority, daily_cap, monthly_cap, is_active,
                                          created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 funnel_id = excluded.funnel_id,
                 org_id = excluded.org_id,
                 target_user_id = excluded.target_user_id,
                 zip_patterns_json = excluded.zip_patterns_json,
                 priority = excluded.priority,
                 daily_cap = excluded.daily_cap,
                 monthly_cap = excluded.monthly_cap,
                 is_active = excluded.is_active,
                 updated_at = excluded.updated_at",
        )
        .bind(&rule.id.0)
        .bind(&rule.funnel_id)
        .bind(&rule.org_id.0)
        .bind(rule.target_user_id.as_ref().map(|user| user.0.as_str()))
        .bind(&zip_patterns_json)
        .bind(rule.priority)
        .bind(rule.caps.daily)
        .bind(rule.caps.monthly)
        .bind(rule.is_active)
        .bind(rule.created_at.to_rfc3339())
        .bind(rule.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert(&self, rule: AssignmentRule) -> Result<bool, RepositoryError> {
        let zip_patterns_json = serde_json::to_string(&rule.zip_patterns)
            .map_err(|e| RepositoryError::Decode(e.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO assignment_rule (id, funnel_id, org_id, target_user_id, zip_patterns_json,
                                          priority, daily_cap, monthly_cap, is_active,
                                          created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&rule.id.0)
        .bind(&rule.funnel_id)
        .bind(&rule.org_id.0)
        .bind(rule.target_user_id.as_ref().map(|user| user.0.as_str()))
        .bind(&zip_patterns_json)
        .bind(rule.priority)
        .bind(rule.caps.daily)
        .bind(rule.caps.monthly)
        .bind(rule.is_active)
        .bind(rule.created_at.to_rfc3339())
        .bind(rule.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl RuleStore for SqlRuleRepository {
    async fn active_rules(&self, funnel_id: &str) -> Result<Vec<AssignmentRule>, RuleStoreError> {
        Ok(self.list_active_for_funnel(funnel_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use leadroute_core::domain::rule::{AssignmentRule, OrgId, RuleCaps, RuleId, UserId};
    use leadroute_core::engine::RuleStore;

    use super::SqlRuleRepository;
    use crate::repositories::{RepositoryError, RuleRepository};
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn sample_rule(id: &str, funnel: &str, active: bool) -> AssignmentRule {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().expect("timestamp");
        AssignmentRule {
            id: RuleId(id.to_string()),
            funnel_id: funnel.to_string(),
            org_id: OrgId("org-roofing-west".to_string()),
            target_user_id: Some(UserId("agent-7".to_string())),
            zip_patterns: vec!["902*".to_string(), "10001".to_string()],
            priority: 3,
            caps: RuleCaps { daily: Some(25), monthly: None },
            is_active: active,
            created_at: created,
            updated_at: created,
        }
    }

    #[tokio::test]
    async fn save_and_find_by_id() {
        let repo = SqlRuleRepository::new(setup().await);
        let rule = sample_rule("rule-1", "roofing", true);

        repo.save(rule.clone()).await.expect("save rule");
        let found = repo.find_by_id(&rule.id).await.expect("find rule");

        assert_eq!(found, Some(rule));
    }

    #[tokio::test]
    async fn save_updates_existing_rule_but_keeps_created_at() {
        let repo = SqlRuleRepository::new(setup().await);
        let original = sample_rule("rule-2", "roofing", true);
        repo.save(original.clone()).await.expect("save rule");

        let mut edited = original.clone();
        edited.priority = 1;
        edited.caps.daily = None;
        edited.created_at = original.created_at + Duration::days(10);
        edited.updated_at = original.updated_at + Duration::hours(2);
        repo.save(edited.clone()).await.expect("update rule");

        let found = repo.find_by_id(&original.id).await.expect("find").expect("rule exists");
        assert_eq!(found.priority, 1);
        assert_eq!(found.caps.daily, None);
        assert_eq!(found.created_at, original.created_at);
        assert_eq!(found.updated_at, edited.updated_at);
    }

    #[tokio::test]
    async fn insert_refuses_an_existing_id() {
        let repo = SqlRuleRepository::new(setup().await);
        let original = sample_rule("rule-taken", "roofing", true);
        assert!(repo.insert(original.clone()).await.expect("first insert"));

        let mut rival = sample_rule("rule-taken", "solar", true);
        rival.priority = 9;
        assert!(!repo.insert(rival).await.expect("second insert"));

        let found = repo.find_by_id(&original.id).await.expect("find").expect("rule exists");
        assert_eq!(found, original);
    }

    #[tokio::test]
    async fn active_rules_include_wildcard_funnel_and_skip_inactive() {
        let repo = SqlRuleRepository::new(setup().await);
        repo.save(sample_rule("rule-roofing", "roofing", true)).await.expect("save");
        repo.save(sample_rule("rule-any", "*", true)).await.expect("save");
        repo.save(sample_rule("rule-paused", "roofing", false)).await.expect("save");
        repo.save(sample_rule("rule-solar", "solar", true)).await.expect("save");

        let mut ids: Vec<String> = repo
            .active_rules("roofing")
            .await
            .expect("active rules")
            .into_iter()
            .map(|rule| rule.id.0)
            .collect();
        ids.sort();

        assert_eq!(ids, vec!["rule-any".to_string(), "rule-roofing".to_string()]);
    }

    #[tokio::test]
    async fn list_filters_by_exact_funnel() {
        let repo = SqlRuleRepository::new(setup().await);
        repo.save(sample_rule("rule-a", "roofing", true)).await.expect("save");
        repo.save(sample_rule("rule-b", "*", true)).await.expect("save");

        assert_eq!(repo.list(Some("roofing")).await.expect("list").len(), 1);
        assert_eq!(repo.list(None).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn malformed_zip_pattern_json_is_a_decode_error() {
        let pool = setup().await;
        sqlx::query(
            "INSERT INTO assignment_rule (id, funnel_id, org_id, zip_patterns_json, priority,
                                          is_active, created_at, updated_at)
             VALUES ('rule-bad', 'roofing', 'org', 'not-json', 1, 1,
                     '2026-03-01T08:00:00+00:00', '2026-03-01T08:00:00+00:00')",
        )
        .execute(&pool)
        .await
        .expect("insert raw row");

        let repo = SqlRuleRepository::new(pool);
        let error = repo.find_by_id(&RuleId("rule-bad".to_string())).await;

        assert!(matches!(error, Err(RepositoryError::Decode(ref message)) if message.contains("rule-bad")));
    }
}
