//! Command-line argument parsing

use clap::Parser;
use flowrule_core::AppConfig;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "flowrule-server",
    about = "Flowrule workflow and automation server",
    version,
    long_about = "Serves per-project workflow graphs and runs trigger/condition/action \
                  automations against entity events, recording every run in an \
                  auditable execution ledger."
)]
pub struct Args {
    /// Path to a configuration file (toml, yaml, or json)
    #[arg(short, long, env = "FLOWRULE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind
    #[arg(long, env = "FLOWRULE_HOST")]
    pub host: Option<String>,

    /// HTTP server port
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short,
        long,
        env = "LOG_LEVEL",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    pub log_level: Option<String>,

    /// Enable JSON log format
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,

    /// Seconds between ledger retention sweeps
    #[arg(long, env = "FLOWRULE_PURGE_INTERVAL_SECS", default_value = "3600")]
    pub purge_interval_secs: u64,
}

impl Args {
    /// Load the configuration and apply command-line overrides.
    pub fn load_config(&self) -> anyhow::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("configuration file {} does not exist", path.display());
                }
                AppConfig::load_from_file(&path.to_string_lossy())?
            }
            None => AppConfig::load()?,
        };

        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(level) = &self.log_level {
            config.telemetry.log_level = level.clone();
        }
        if self.json_logs {
            config.telemetry.json_logs = true;
        }
        Ok(config)
    }
}
