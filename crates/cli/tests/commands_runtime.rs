use std::env;
use std::sync::{Mutex, OnceLock};

use leadroute_cli::commands::{config, doctor, matching, migrate, seed};
use serde_json::Value;
use tempfile::TempDir;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("LEADROUTE_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("LEADROUTE_DATABASE_URL", "postgres://localhost/leads")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn seed_lists_demo_rules_and_is_idempotent() {
    let dir = TempDir::new().expect("temp dir");
    let url = file_database_url(&dir);

    with_env(&[("LEADROUTE_DATABASE_URL", url.as_str())], || {
        let first = seed::run();
        assert_eq!(first.exit_code, 0, "expected first seed invocation success");
        let first_payload = parse_payload(&first.output);
        assert_eq!(first_payload["command"], "seed");
        assert_eq!(first_payload["status"], "ok");

        let message = first_payload["message"].as_str().unwrap_or("");
        assert!(message.contains("  - demo-roofing-beverly-hills [roofing]"));
        assert!(message.contains("  - demo-catch-all [*]: Last-resort buyer for every funnel and ZIP"));

        let second = seed::run();
        assert_eq!(second.exit_code, 0, "expected second seed invocation success");
        assert_eq!(first_payload["message"], parse_payload(&second.output)["message"]);
    });
}

#[test]
fn match_reports_ranked_candidates_from_seeded_rules() {
    let dir = TempDir::new().expect("temp dir");
    let url = file_database_url(&dir);

    with_env(&[("LEADROUTE_DATABASE_URL", url.as_str())], || {
        assert_eq!(seed::run().exit_code, 0);

        let result = matching::run("roofing", "90210");
        assert_eq!(result.exit_code, 0);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "match");
        assert_eq!(payload["data"]["selected"], "demo-roofing-beverly-hills");
        assert_eq!(
            payload["data"]["candidates"],
            serde_json::json!([
                "demo-roofing-beverly-hills",
                "demo-roofing-la-metro",
                "demo-roofing-statewide",
                "demo-catch-all"
            ])
        );
    });
}

#[test]
fn match_falls_back_to_wildcard_funnel_rule() {
    let dir = TempDir::new().expect("temp dir");
    let url = file_database_url(&dir);

    with_env(&[("LEADROUTE_DATABASE_URL", url.as_str())], || {
        assert_eq!(seed::run().exit_code, 0);

        let payload = parse_payload(&matching::run("plumbing", "10001").output);
        assert_eq!(payload["data"]["selected"], "demo-catch-all");
        assert_eq!(payload["data"]["candidates"].as_array().map(Vec::len), Some(1));
    });
}

#[test]
fn match_without_rules_reports_no_selection() {
    with_env(&[("LEADROUTE_DATABASE_URL", "sqlite::memory:")], || {
        let result = matching::run("solar", "85004");
        assert_eq!(result.exit_code, 0);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["data"]["selected"], Value::Null);
        assert!(payload["message"].as_str().unwrap_or("").starts_with("no rule matches"));
    });
}

#[test]
fn match_rejects_blank_funnel() {
    with_env(&[("LEADROUTE_DATABASE_URL", "sqlite::memory:")], || {
        let result = matching::run("  ", "90210");
        assert_eq!(result.exit_code, 2);
        assert_eq!(parse_payload(&result.output)["error_class"], "invalid_input");
    });
}

#[test]
fn doctor_passes_after_migrate() {
    let dir = TempDir::new().expect("temp dir");
    let url = file_database_url(&dir);

    with_env(&[("LEADROUTE_DATABASE_URL", url.as_str())], || {
        assert_eq!(migrate::run().exit_code, 0);

        let result = doctor::run(true);
        assert_eq!(result.exit_code, 0, "doctor output: {}", result.output);

        let report = parse_payload(&result.output);
        assert_eq!(report["overall_status"], "pass");
        let names: Vec<&str> = report["checks"]
            .as_array()
            .expect("checks")
            .iter()
            .filter_map(|check| check["name"].as_str())
            .collect();
        assert_eq!(
            names,
            vec!["config_validation", "event_transport", "database_connectivity", "schema_migrations"]
        );
    });
}

#[test]
fn doctor_flags_unmigrated_database() {
    let dir = TempDir::new().expect("temp dir");
    let url = file_database_url(&dir);

    with_env(&[("LEADROUTE_DATABASE_URL", url.as_str())], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 1);

        let report = parse_payload(&result.output);
        assert_eq!(report["overall_status"], "fail");
        assert_eq!(report["checks"][3]["status"], "fail");
    });
}

#[test]
fn config_attributes_env_sources_and_redacts_secret() {
    with_env(
        &[
            ("LEADROUTE_DATABASE_URL", "sqlite::memory:"),
            ("LEADROUTE_EVENTS_WEBHOOK_URL", "https://hooks.example.test/leads"),
            ("LEADROUTE_EVENTS_SIGNING_SECRET", "whsec-top-secret-value"),
        ],
        || {
            let output = config::run();

            assert!(output.contains(
                "- database.url = sqlite::memory: (source: env (LEADROUTE_DATABASE_URL))"
            ));
            assert!(output.contains("- events.signing_secret = whsec-*** (source: env"));
            assert!(!output.contains("top-secret-value"));
            assert!(output.contains("- server.port = 8080 (source: default)"));
        },
    );
}

fn file_database_url(dir: &TempDir) -> String {
    format!("sqlite://{}?mode=rwc", dir.path().join("leadroute.db").display())
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "LEADROUTE_DATABASE_URL",
        "LEADROUTE_DATABASE_MAX_CONNECTIONS",
        "LEADROUTE_DATABASE_TIMEOUT_SECS",
        "LEADROUTE_ENGINE_RETRY_BACKOFF_MS",
        "LEADROUTE_ENGINE_ATTEMPT_BUDGET_MS",
        "LEADROUTE_ENGINE_OVERALL_TIMEOUT_MS",
        "LEADROUTE_SERVER_BIND_ADDRESS",
        "LEADROUTE_SERVER_PORT",
        "LEADROUTE_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "LEADROUTE_SERVER_INTAKE_QUEUE_CAPACITY",
        "LEADROUTE_EVENTS_WEBHOOK_URL",
        "LEADROUTE_EVENTS_SIGNING_SECRET",
        "LEADROUTE_EVENTS_TIMEOUT_SECS",
        "LEADROUTE_LOGGING_LEVEL",
        "LEADROUTE_LOGGING_FORMAT",
        "LEADROUTE_LOG_LEVEL",
        "LEADROUTE_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
