use leadroute_db::fixtures::RuleSeedInfo;
use leadroute_db::DemoRuleSet;

use crate::commands::{build_runtime, load_config, open_migrated_pool, CommandResult, StepFailure};

pub fn run() -> CommandResult {
    let config = match load_config("seed") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match build_runtime("seed") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_migrated_pool(&config).await?;

        let seed_result = DemoRuleSet::load(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;
        let verification = DemoRuleSet::verify(&pool)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

        let run_result: Result<Vec<RuleSeedInfo>, StepFailure> = if verification.all_present {
            Ok(seed_result.rules_seeded)
        } else {
            Err(("seed_verification", verification_message(&verification.checks), 6u8))
        };

        pool.close().await;
        run_result
    });

    match result {
        Ok(rules) => CommandResult::success("seed", render_rules(&rules)),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

fn render_rules(rules: &[RuleSeedInfo]) -> String {
    let lines: Vec<String> = rules
        .iter()
        .map(|rule| format!("  - {} [{}]: {}", rule.rule_id, rule.funnel_id, rule.description))
        .collect();
    format!("demo routing rules loaded ({}):\n{}", rules.len(), lines.join("\n"))
}

fn verification_message(checks: &[(&'static str, bool)]) -> String {
    let failed = checks
        .iter()
        .filter_map(|(rule_id, present)| (!present).then_some(*rule_id))
        .collect::<Vec<_>>();
    if failed.is_empty() {
        "Some demo rules failed to load".to_string()
    } else {
        format!("Seed verification failed for rules: {}", failed.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::verification_message;

    #[test]
    fn verification_message_names_missing_rules() {
        let checks = [
            ("demo-roofing-beverly-hills", true),
            ("demo-solar-phoenix", false),
            ("demo-catch-all", false),
        ];

        assert_eq!(
            verification_message(&checks),
            "Seed verification failed for rules: demo-solar-phoenix, demo-catch-all"
        );
    }

    #[test]
    fn verification_message_falls_back_when_every_check_passed() {
        let checks = [("demo-catch-all", true)];
        assert_eq!(verification_message(&checks), "Some demo rules failed to load");
    }
}
