//! Configuration management

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub access: AccessConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Public URL the storefront script points at (e.g., "https://gate.example.com")
    #[serde(default)]
    pub public_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub driver: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Tunables for the access-decision pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// "development" or "production". In development, private/loopback IPs
    /// bypass the IP check so local testing is not self-blocking.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Two requests with the same session id inside this window merge into
    /// one visit row.
    #[serde(default = "default_session_window_minutes")]
    pub session_window_minutes: i64,
    /// Upper bound for each datastore call inside a check. A timeout is
    /// treated like any other datastore failure: the check allows.
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_session_window_minutes() -> i64 {
    30
}

fn default_check_timeout_ms() -> u64 {
    250
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            session_window_minutes: default_session_window_minutes(),
            check_timeout_ms: default_check_timeout_ms(),
        }
    }
}

impl AccessConfig {
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";

        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .add_source(config::Environment::with_prefix("STOREGATE"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate server config
        if self.server.http_port == 0 {
            anyhow::bail!("Invalid http_port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }

        // Validate database config
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.driver != "sqlite" {
            anyhow::bail!(
                "Invalid database driver '{}'. Only 'sqlite' is supported",
                self.database.driver
            );
        }

        // Validate logging level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        // Validate access config
        let valid_envs = ["development", "production"];
        if !valid_envs.contains(&self.access.environment.as_str()) {
            anyhow::bail!(
                "Invalid environment '{}'. Must be one of: {:?}",
                self.access.environment,
                valid_envs
            );
        }
        if self.access.session_window_minutes <= 0 {
            anyhow::bail!("session_window_minutes must be positive");
        }
        if self.access.check_timeout_ms == 0 {
            anyhow::bail!("check_timeout_ms must be positive");
        }

        Ok(())
    }
}
