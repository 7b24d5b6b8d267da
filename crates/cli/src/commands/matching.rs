use leadroute_core::domain::rule::WILDCARD_FUNNEL;
use leadroute_core::matching::explain;
use leadroute_db::repositories::{RuleRepository, SqlRuleRepository};

use crate::commands::{build_runtime, load_config, open_migrated_pool, CommandResult, StepFailure};

/// Runs the matcher against every stored rule for the funnel, inactive ones included.
pub fn run(funnel_id: &str, zip: &str) -> CommandResult {
    let funnel_id = funnel_id.trim();
    if funnel_id.is_empty() {
        return CommandResult::failure("match", "invalid_input", "--funnel must not be blank", 2);
    }
    let zip = zip.trim();

    let config = match load_config("match") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match build_runtime("match") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_migrated_pool(&config).await?;
        let repo = SqlRuleRepository::new(pool.clone());

        let mut rules = repo
            .list(Some(funnel_id))
            .await
            .map_err(|error| ("rule_lookup", error.to_string(), 6u8))?;
        if funnel_id != WILDCARD_FUNNEL {
            rules.extend(
                repo.list(Some(WILDCARD_FUNNEL))
                    .await
                    .map_err(|error| ("rule_lookup", error.to_string(), 6u8))?,
            );
        }

        pool.close().await;
        Ok::<_, StepFailure>(explain(funnel_id, zip, &rules))
    });

    let report = match result {
        Ok(report) => report,
        Err((error_class, message, exit_code)) => {
            return CommandResult::failure("match", error_class, message, exit_code);
        }
    };

    let message = match &report.selected {
        Some(rule_id) => format!(
            "{} candidate(s) for funnel `{funnel_id}` zip `{zip}`; first choice `{rule_id}`",
            report.candidates.len()
        ),
        None => format!("no rule matches funnel `{funnel_id}` zip `{zip}`"),
    };

    match serde_json::to_value(&report) {
        Ok(data) => CommandResult::success_with_data("match", message, Some(data)),
        Err(error) => CommandResult::failure("match", "serialization", error.to_string(), 7),
    }
}
