use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use leadroute_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for entry in effective_values(&config) {
        let source = field_source(
            entry.key,
            entry.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(entry.key, &entry.value, source));
    }

    lines.join("\n")
}

struct ConfigEntry {
    key: &'static str,
    env_keys: &'static [&'static str],
    value: String,
}

fn entry(key: &'static str, env_keys: &'static [&'static str], value: String) -> ConfigEntry {
    ConfigEntry { key, env_keys, value }
}

fn effective_values(config: &AppConfig) -> Vec<ConfigEntry> {
    let signing_secret = match &config.events.signing_secret {
        Some(secret) => redact_secret(secret.expose_secret()),
        None => "<unset>".to_string(),
    };

    vec![
        entry("database.url", &["LEADROUTE_DATABASE_URL"], config.database.url.clone()),
        entry(
            "database.max_connections",
            &["LEADROUTE_DATABASE_MAX_CONNECTIONS"],
            config.database.max_connections.to_string(),
        ),
        entry(
            "database.timeout_secs",
            &["LEADROUTE_DATABASE_TIMEOUT_SECS"],
            config.database.timeout_secs.to_string(),
        ),
        entry(
            "engine.retry_backoff_ms",
            &["LEADROUTE_ENGINE_RETRY_BACKOFF_MS"],
            config.engine.retry_backoff_ms.to_string(),
        ),
        entry(
            "engine.attempt_budget_ms",
            &["LEADROUTE_ENGINE_ATTEMPT_BUDGET_MS"],
            config.engine.attempt_budget_ms.to_string(),
        ),
        entry(
            "engine.overall_timeout_ms",
            &["LEADROUTE_ENGINE_OVERALL_TIMEOUT_MS"],
            config.engine.overall_timeout_ms.to_string(),
        ),
        entry(
            "server.bind_address",
            &["LEADROUTE_SERVER_BIND_ADDRESS"],
            config.server.bind_address.clone(),
        ),
        entry("server.port", &["LEADROUTE_SERVER_PORT"], config.server.port.to_string()),
        entry(
            "server.graceful_shutdown_secs",
            &["LEADROUTE_SERVER_GRACEFUL_SHUTDOWN_SECS"],
            config.server.graceful_shutdown_secs.to_string(),
        ),
        entry(
            "server.intake_queue_capacity",
            &["LEADROUTE_SERVER_INTAKE_QUEUE_CAPACITY"],
            config.server.intake_queue_capacity.to_string(),
        ),
        entry(
            "events.webhook_url",
            &["LEADROUTE_EVENTS_WEBHOOK_URL"],
            config.events.webhook_url.clone().unwrap_or_else(|| "<unset>".to_string()),
        ),
        entry("events.signing_secret", &["LEADROUTE_EVENTS_SIGNING_SECRET"], signing_secret),
        entry(
            "events.timeout_secs",
            &["LEADROUTE_EVENTS_TIMEOUT_SECS"],
            config.events.timeout_secs.to_string(),
        ),
        entry(
            "logging.level",
            &["LEADROUTE_LOGGING_LEVEL", "LEADROUTE_LOG_LEVEL"],
            config.logging.level.clone(),
        ),
        entry(
            "logging.format",
            &["LEADROUTE_LOGGING_FORMAT", "LEADROUTE_LOG_FORMAT"],
            config.logging.format.as_str().to_string(),
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    ["leadroute.toml", "config/leadroute.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a `whsec-` style prefix so operators can tell which secret is loaded.
fn redact_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
