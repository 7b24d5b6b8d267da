use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub engine: EngineSettings,
    pub server: ServerConfig,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Raw engine timings; converted into `engine::EngineConfig` at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    pub retry_backoff_ms: u64,
    pub attempt_budget_ms: u64,
    pub overall_timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
    pub intake_queue_capacity: usize,
}

#[derive(Clone, Debug)]
pub struct EventsConfig {
    pub webhook_url: Option<String>,
    pub signing_secret: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub webhook_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://leadroute.db?mode=rwc".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            engine: EngineSettings {
                retry_backoff_ms: 50,
                attempt_budget_ms: 250,
                overall_timeout_ms: 2_000,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
                intake_queue_capacity: 1_024,
            },
            events: EventsConfig { webhook_url: None, signing_secret: None, timeout_secs: 5 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("leadroute.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(engine) = patch.engine {
            if let Some(retry_backoff_ms) = engine.retry_backoff_ms {
                self.engine.retry_backoff_ms = retry_backoff_ms;
            }
            if let Some(attempt_budget_ms) = engine.attempt_budget_ms {
                self.engine.attempt_budget_ms = attempt_budget_ms;
            }
            if let Some(overall_timeout_ms) = engine.overall_timeout_ms {
                self.engine.overall_timeout_ms = overall_timeout_ms;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
            if let Some(intake_queue_capacity) = server.intake_queue_capacity {
                self.server.intake_queue_capacity = intake_queue_capacity;
            }
        }

        if let Some(events) = patch.events {
            if let Some(webhook_url) = events.webhook_url {
                self.events.webhook_url = Some(webhook_url);
            }
            if let Some(signing_secret) = events.signing_secret {
                self.events.signing_secret = Some(signing_secret.into());
            }
            if let Some(timeout_secs) = events.timeout_secs {
                self.events.timeout_secs = timeout_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("LEADROUTE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("LEADROUTE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_env("LEADROUTE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("LEADROUTE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("LEADROUTE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADROUTE_ENGINE_RETRY_BACKOFF_MS") {
            self.engine.retry_backoff_ms = parse_env("LEADROUTE_ENGINE_RETRY_BACKOFF_MS", &value)?;
        }
        if let Some(value) = read_env("LEADROUTE_ENGINE_ATTEMPT_BUDGET_MS") {
            self.engine.attempt_budget_ms =
                parse_env("LEADROUTE_ENGINE_ATTEMPT_BUDGET_MS", &value)?;
        }
        if let Some(value) = read_env("LEADROUTE_ENGINE_OVERALL_TIMEOUT_MS") {
            self.engine.overall_timeout_ms =
                parse_env("LEADROUTE_ENGINE_OVERALL_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = read_env("LEADROUTE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("LEADROUTE_SERVER_PORT") {
            self.server.port = parse_env("LEADROUTE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("LEADROUTE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_env("LEADROUTE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADROUTE_SERVER_INTAKE_QUEUE_CAPACITY") {
            self.server.intake_queue_capacity =
                parse_env("LEADROUTE_SERVER_INTAKE_QUEUE_CAPACITY", &value)?;
        }

        if let Some(value) = read_env("LEADROUTE_EVENTS_WEBHOOK_URL") {
            self.events.webhook_url = Some(value);
        }
        if let Some(value) = read_env("LEADROUTE_EVENTS_SIGNING_SECRET") {
            self.events.signing_secret = Some(value.into());
        }
        if let Some(value) = read_env("LEADROUTE_EVENTS_TIMEOUT_SECS") {
            self.events.timeout_secs = parse_env("LEADROUTE_EVENTS_TIMEOUT_SECS", &value)?;
        }

        let log_level =
            read_env("LEADROUTE_LOGGING_LEVEL").or_else(|| read_env("LEADROUTE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("LEADROUTE_LOGGING_FORMAT").or_else(|| read_env("LEADROUTE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(webhook_url) = overrides.webhook_url {
            self.events.webhook_url = Some(webhook_url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_engine(&self.engine)?;
        validate_server(&self.server)?;
        validate_events(&self.events)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("leadroute.toml"), PathBuf::from("config/leadroute.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_engine(engine: &EngineSettings) -> Result<(), ConfigError> {
    if engine.attempt_budget_ms == 0 {
        return Err(ConfigError::Validation(
            "engine.attempt_budget_ms must be greater than zero".to_string(),
        ));
    }

    if engine.overall_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "engine.overall_timeout_ms must be greater than zero".to_string(),
        ));
    }

    if engine.retry_backoff_ms >= engine.attempt_budget_ms {
        return Err(ConfigError::Validation(format!(
            "engine.retry_backoff_ms ({}) must be smaller than engine.attempt_budget_ms ({})",
            engine.retry_backoff_ms, engine.attempt_budget_ms
        )));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    if server.intake_queue_capacity == 0 {
        return Err(ConfigError::Validation(
            "server.intake_queue_capacity must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_events(events: &EventsConfig) -> Result<(), ConfigError> {
    if let Some(url) = &events.webhook_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "events.webhook_url must start with http:// or https://".to_string(),
            ));
        }
    }

    if let Some(secret) = &events.signing_secret {
        if secret.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "events.signing_secret must not be blank when set".to_string(),
            ));
        }
        if events.webhook_url.is_none() {
            return Err(ConfigError::Validation(
                "events.signing_secret is set but events.webhook_url is missing".to_string(),
            ));
        }
    }

    if events.timeout_secs == 0 || events.timeout_secs > 60 {
        return Err(ConfigError::Validation(
            "events.timeout_secs must be in range 1..=60".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    engine: Option<EnginePatch>,
    server: Option<ServerPatch>,
    events: Option<EventsPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    retry_backoff_ms: Option<u64>,
    attempt_budget_ms: Option<u64>,
    overall_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    intake_queue_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct EventsPatch {
    webhook_url: Option<String>,
    signing_secret: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
