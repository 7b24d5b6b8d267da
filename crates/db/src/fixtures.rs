use chrono::{DateTime, TimeZone, Utc};
use tracing::info;

use leadroute_core::domain::rule::{AssignmentRule, OrgId, RuleCaps, RuleId, UserId};

use crate::connection::DbPool;
use crate::repositories::{RepositoryError, RuleRepository, SqlRuleRepository};

struct SeedRuleContract {
    id: &'static str,
    funnel_id: &'static str,
    org_id: &'static str,
    target_user_id: Option<&'static str>,
    zip_patterns: &'static [&'static str],
    priority: i32,
    daily_cap: Option<i64>,
    monthly_cap: Option<i64>,
    description: &'static str,
}

/// Demo routing table covering exact, prefix, any-ZIP and wildcard-funnel rules.
const SEED_RULES: &[SeedRuleContract] = &[
    SeedRuleContract {
        id: "demo-roofing-beverly-hills",
        funnel_id: "roofing",
        org_id: "org-summit-roofing",
        target_user_id: Some("user-dana"),
        zip_patterns: &["90210", "90211"],
        priority: 1,
        daily_cap: Some(5),
        monthly_cap: Some(100),
        description: "Exact ZIPs for a dedicated roofing rep",
    },
    SeedRuleContract {
        id: "demo-roofing-la-metro",
        funnel_id: "roofing",
        org_id: "org-westside-exteriors",
        target_user_id: None,
        zip_patterns: &["900*", "902*"],
        priority: 1,
        daily_cap: Some(20),
        monthly_cap: None,
        description: "LA metro prefixes, same priority as the exact rule",
    },
    SeedRuleContract {
        id: "demo-roofing-statewide",
        funnel_id: "roofing",
        org_id: "org-golden-state-roofing",
        target_user_id: None,
        zip_patterns: &["9*"],
        priority: 5,
        daily_cap: None,
        monthly_cap: Some(1_000),
        description: "Broad fallback for west-coast roofing leads",
    },
    SeedRuleContract {
        id: "demo-solar-phoenix",
        funnel_id: "solar",
        org_id: "org-desert-sun",
        target_user_id: Some("user-ravi"),
        zip_patterns: &["850*", "852*"],
        priority: 2,
        daily_cap: Some(10),
        monthly_cap: Some(150),
        description: "Phoenix-area solar installer",
    },
    SeedRuleContract {
        id: "demo-catch-all",
        funnel_id: "*",
        org_id: "org-lead-exchange",
        target_user_id: None,
        zip_patterns: &[],
        priority: 100,
        daily_cap: None,
        monthly_cap: None,
        description: "Last-resort buyer for every funnel and ZIP",
    },
];

/// Deterministic demo rules for local runs and CLI smoke checks.
pub struct DemoRuleSet;

impl DemoRuleSet {
    /// Upserts every demo rule. Running it twice leaves the same rows.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let repo = SqlRuleRepository::new(pool.clone());
        let seeded_at = seed_timestamp();

        for contract in SEED_RULES {
            repo.save(contract.to_rule(seeded_at)).await?;
        }

        let rules_seeded = SEED_RULES
            .iter()
            .map(|rule| RuleSeedInfo {
                rule_id: rule.id,
                funnel_id: rule.funnel_id,
                description: rule.description,
            })
            .collect::<Vec<_>>();

        info!(
            event_name = "db.fixtures.demo_rules_loaded",
            rules = rules_seeded.len(),
            "demo routing rules loaded"
        );
        Ok(SeedResult { rules_seeded })
    }

    /// Checks that every demo rule exists, is active and still carries its seeded caps.
    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let repo = SqlRuleRepository::new(pool.clone());
        let mut checks = Vec::with_capacity(SEED_RULES.len());

        for contract in SEED_RULES {
            let present = match repo.find_by_id(&RuleId(contract.id.to_string())).await? {
                Some(rule) => {
                    rule.is_active
                        && rule.funnel_id == contract.funnel_id
                        && rule.caps.daily == contract.daily_cap
                        && rule.caps.monthly == contract.monthly_cap
                }
                None => false,
            };
            checks.push((contract.id, present));
        }

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }

    /// Removes the demo rules and any counters they accumulated.
    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;

        for contract in SEED_RULES {
            sqlx::query("DELETE FROM quota_counter WHERE rule_id = ?")
                .bind(contract.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM assignment_rule WHERE id = ?")
                .bind(contract.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

impl SeedRuleContract {
    fn to_rule(&self, seeded_at: DateTime<Utc>) -> AssignmentRule {
        AssignmentRule {
            id: RuleId(self.id.to_string()),
            funnel_id: self.funnel_id.to_string(),
            org_id: OrgId(self.org_id.to_string()),
            target_user_id: self.target_user_id.map(|user| UserId(user.to_string())),
            zip_patterns: self.zip_patterns.iter().map(|p| p.to_string()).collect(),
            priority: self.priority,
            caps: RuleCaps { daily: self.daily_cap, monthly: self.monthly_cap },
            is_active: true,
            created_at: seeded_at,
            updated_at: seeded_at,
        }
    }
}

fn seed_timestamp() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now)
}

#[derive(Debug)]
pub struct SeedResult {
    pub rules_seeded: Vec<RuleSeedInfo>,
}

#[derive(Debug)]
pub struct RuleSeedInfo {
    pub rule_id: &'static str,
    pub funnel_id: &'static str,
    pub description: &'static str,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}

#[cfg(test)]
mod tests {
    use leadroute_core::domain::rule::RuleId;
    use leadroute_core::matching::find_candidates;

    use super::*;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect to test database");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    #[tokio::test]
    async fn verify_seed_contract_and_idempotency() {
        let pool = setup().await;

        let first = DemoRuleSet::load(&pool).await.expect("load seed fixtures");
        let first_verification = DemoRuleSet::verify(&pool).await.expect("verify seed fixtures");
        assert!(first_verification.all_present);
        assert_eq!(first.rules_seeded.len(), SEED_RULES.len());

        DemoRuleSet::load(&pool).await.expect("reload seed fixtures");
        let second_verification = DemoRuleSet::verify(&pool).await.expect("re-verify seed");
        assert_eq!(first_verification.checks, second_verification.checks);

        let rule_count: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM assignment_rule")
            .fetch_one(&pool)
            .await
            .expect("count rules");
        assert_eq!(rule_count, SEED_RULES.len() as i64);
    }

    #[tokio::test]
    async fn seeded_table_prefers_exact_zip_rule() {
        let pool = setup().await;
        DemoRuleSet::load(&pool).await.expect("load seed fixtures");

        let rules = SqlRuleRepository::new(pool)
            .list_active_for_funnel("roofing")
            .await
            .expect("active rules");
        let ids: Vec<&str> = find_candidates("roofing", "90210", &rules)
            .into_iter()
            .map(|rule| rule.id.0.as_str())
            .collect();

        assert_eq!(
            ids,
            vec![
                "demo-roofing-beverly-hills",
                "demo-roofing-la-metro",
                "demo-roofing-statewide",
                "demo-catch-all",
            ]
        );
    }

    #[tokio::test]
    async fn clean_removes_seeded_rules() {
        let pool = setup().await;
        DemoRuleSet::load(&pool).await.expect("load seed fixtures");
        DemoRuleSet::clean(&pool).await.expect("clean seed fixtures");

        let verification = DemoRuleSet::verify(&pool).await.expect("verify");
        assert!(!verification.all_present);
        let repo = SqlRuleRepository::new(pool);
        assert!(repo
            .find_by_id(&RuleId("demo-catch-all".to_string()))
            .await
            .expect("find")
            .is_none());
    }
}
