use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_env("FLOWRULE")
    }

    /// Load configuration from environment with custom prefix
    pub fn load_from_env(prefix: &str) -> Result<Self, ConfigError> {
        let builder = with_defaults(Config::builder())?.add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load configuration from file with environment overrides
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = with_defaults(Config::builder())?
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("FLOWRULE")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

fn with_defaults(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
    builder
        .set_default("server.host", default_host())?
        .set_default("server.port", default_port() as i64)?
        .set_default("engine.automation_principal", default_automation_principal())?
        .set_default("engine.max_action_attempts", default_max_action_attempts() as i64)?
        .set_default("engine.initial_backoff_ms", default_initial_backoff_ms() as i64)?
        .set_default("engine.max_backoff_ms", default_max_backoff_ms() as i64)?
        .set_default("engine.action_timeout_ms", default_action_timeout_ms() as i64)?
        .set_default("engine.conflict_retries", default_conflict_retries() as i64)?
        .set_default("engine.dispatch_lanes", default_dispatch_lanes() as i64)?
        .set_default("engine.event_buffer_size", default_event_buffer_size() as i64)?
        .set_default("engine.max_cascade_depth", default_max_cascade_depth() as i64)?
        .set_default("engine.ledger_retention_days", default_ledger_retention_days() as i64)?
        .set_default("telemetry.service_name", default_service_name())?
        .set_default("telemetry.log_level", default_log_level())?
        .set_default("telemetry.json_logs", false)
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }

    pub fn with_host(mut self, host: String) -> Self {
        self.host = host;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Tuning for the automation engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Principal that automation-driven transitions are authorized as.
    #[serde(default = "default_automation_principal")]
    pub automation_principal: String,
    /// Attempts per action for timeouts and transient I/O failures.
    #[serde(default = "default_max_action_attempts")]
    pub max_action_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Upper bound on a single collaborator call.
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
    /// Re-fetch attempts after a version conflict.
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
    #[serde(default = "default_dispatch_lanes")]
    pub dispatch_lanes: usize,
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
    #[serde(default = "default_max_cascade_depth")]
    pub max_cascade_depth: u32,
    #[serde(default = "default_ledger_retention_days")]
    pub ledger_retention_days: u32,
}

impl EngineConfig {
    pub fn with_automation_principal(mut self, principal: impl Into<String>) -> Self {
        self.automation_principal = principal.into();
        self
    }

    pub fn with_max_action_attempts(mut self, attempts: u32) -> Self {
        self.max_action_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    pub fn with_action_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.action_timeout_ms = timeout_ms;
        self
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub fn with_dispatch_lanes(mut self, lanes: usize) -> Self {
        self.dispatch_lanes = lanes;
        self
    }

    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    pub fn with_max_cascade_depth(mut self, depth: u32) -> Self {
        self.max_cascade_depth = depth;
        self
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn ledger_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.ledger_retention_days))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            automation_principal: default_automation_principal(),
            max_action_attempts: default_max_action_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            action_timeout_ms: default_action_timeout_ms(),
            conflict_retries: default_conflict_retries(),
            dispatch_lanes: default_dispatch_lanes(),
            event_buffer_size: default_event_buffer_size(),
            max_cascade_depth: default_max_cascade_depth(),
            ledger_retention_days: default_ledger_retention_days(),
        }
    }
}

fn default_automation_principal() -> String {
    "automation".to_string()
}

fn default_max_action_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_action_timeout_ms() -> u64 {
    10_000
}

fn default_conflict_retries() -> u32 {
    3
}

fn default_dispatch_lanes() -> usize {
    num_cpus::get().max(1)
}

fn default_event_buffer_size() -> usize {
    1024
}

fn default_max_cascade_depth() -> u32 {
    5
}

fn default_ledger_retention_days() -> u32 {
    90
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_service_name() -> String {
    "flowrule".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_creation() {
        let config = ServerConfig::new()
            .with_host("127.0.0.1".to_string())
            .with_port(3000);

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert_eq!(config.address(), "127.0.0.1:3000");
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();

        assert_eq!(config.automation_principal, "automation");
        assert_eq!(config.max_action_attempts, 3);
        assert_eq!(config.conflict_retries, 3);
        assert!(config.dispatch_lanes > 0);
        assert_eq!(config.action_timeout(), Duration::from_secs(10));
        assert_eq!(config.ledger_retention(), chrono::Duration::days(90));
    }

    #[test]
    fn test_engine_config_builders() {
        let config = EngineConfig::default()
            .with_automation_principal("bot")
            .with_max_action_attempts(5)
            .with_backoff(10, 200)
            .with_dispatch_lanes(2)
            .with_max_cascade_depth(1);

        assert_eq!(config.automation_principal, "bot");
        assert_eq!(config.max_action_attempts, 5);
        assert_eq!(config.initial_backoff(), Duration::from_millis(10));
        assert_eq!(config.max_backoff(), Duration::from_millis(200));
        assert_eq!(config.dispatch_lanes, 2);
        assert_eq!(config.max_cascade_depth, 1);
    }

    #[test]
    fn test_load_from_env_uses_defaults() {
        let config = AppConfig::load_from_env("FLOWRULE_TEST_UNSET_PREFIX").unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.engine.max_cascade_depth, 5);
        assert_eq!(config.telemetry.service_name, "flowrule");
        assert!(!config.telemetry.json_logs);
    }
}
