use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::coordination::circuit_breaker::CircuitBreakerConfig;
use crate::coordination::instance_lock::InstanceLockConfig;
use crate::error::{FailsafeError, Result};
use crate::persistence::intent_log::IntentLogConfig;
use crate::safety::quality_gate::QualityGateConfig;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub instance_lock: InstanceLockConfig,
    #[serde(default)]
    pub intent_log: IntentLogConfig,
    #[serde(default)]
    pub quality_gate: QualityGateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    #[default]
    Paper,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Live => "live",
            TradingMode::Paper => "paper",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, TradingMode::Live)
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TradingConfig {
    /// Live mode reconciles positions against the exchange at startup
    #[serde(default)]
    pub mode: TradingMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for the daily rolling log file
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            .set_default("trading.mode", "paper")?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("FAILSAFE_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // FAILSAFE_DATABASE__URL, FAILSAFE_CIRCUIT_BREAKER__QUERY_TIMEOUT_MS, ...
            .add_source(
                Environment::with_prefix("FAILSAFE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Configuration for CLI usage without config files
    pub fn default_config(database_url: &str, mode: TradingMode) -> Self {
        Self {
            database: DatabaseConfig {
                url: database_url.to_string(),
                max_connections: default_max_connections(),
            },
            trading: TradingConfig { mode },
            circuit_breaker: CircuitBreakerConfig::default(),
            instance_lock: InstanceLockConfig::default(),
            intent_log: IntentLogConfig::default(),
            quality_gate: QualityGateConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate every component section
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.database.url.trim().is_empty() {
            errors.push("database.url must be set".to_string());
        }
        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be > 0".to_string());
        }
        for result in [
            self.circuit_breaker.validate(),
            self.instance_lock.validate(),
            self.intent_log.validate(),
            self.quality_gate.validate(),
        ] {
            if let Err(e) = result {
                errors.push(e.to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FailsafeError::InvalidConfig(errors.join("; ")))
        }
    }
}
