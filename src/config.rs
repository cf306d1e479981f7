//! Configuration
//!
//! Layers, later ones winning:
//! 1. built-in defaults
//! 2. a TOML file (`--config`, `CADENCE_CONFIG_PATH`, or `./cadence.toml`)
//! 3. environment variables (`CADENCE_SCHEDULER__MAX_EXECUTORS=4`)
//! 4. explicit builder overrides
//!
//! `CADENCE_DATABASE_URL` is honoured as a shorthand for
//! `CADENCE_DATABASE__URL`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::EngineError;
use crate::ids;

const ENV_PREFIX: &str = "CADENCE";
const DEFAULT_CONFIG_FILE: &str = "cadence.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Heartbeat period
    pub heart_rate_ms: u64,
    /// How often timers and pending exids are reloaded from storage
    pub reload_frequency_secs: u64,
    /// Bound on simultaneously live executors
    pub max_executors: usize,
    /// Default launch domain
    pub domain: Option<String>,
    pub unit: String,
    pub env: String,
    /// Refuse to start on an unmigrated storage
    pub migration_check: bool,
    /// Bound on `wait` calls, unbounded when absent
    pub wait_timeout_secs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heart_rate_ms: 300,
            reload_frequency_secs: 60,
            max_executors: 1,
            domain: None,
            unit: "u0".to_string(),
            env: "dev".to_string(),
            migration_check: false,
            wait_timeout_secs: None,
        }
    }
}

impl SchedulerConfig {
    pub fn heart_rate(&self) -> Duration {
        Duration::from_millis(self.heart_rate_ms)
    }

    pub fn reload_frequency(&self) -> Duration {
        Duration::from_secs(self.reload_frequency_secs)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(domain) = &self.domain {
            if !ids::is_domain_name(domain) {
                return Err(EngineError::InvalidDomain(domain.clone()).into());
            }
        }
        anyhow::ensure!(self.max_executors > 0, "scheduler.max_executors must be at least 1");
        anyhow::ensure!(self.heart_rate_ms > 0, "scheduler.heart_rate_ms must be positive");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 20,
            min_connections: 2,
            acquire_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Root of `<domain>/<name>.json` flow files
    pub flows_dir: PathBuf,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            flows_dir: PathBuf::from("flows"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub database: DatabaseConfig,
    pub loader: LoaderConfig,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Loads from file and environment, no overrides
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration as TOML")
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_path: Option<PathBuf>,
    database_url: Option<String>,
    max_executors: Option<usize>,
    heart_rate_ms: Option<u64>,
}

impl ConfigBuilder {
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn database_url(mut self, url: Option<String>) -> Self {
        self.database_url = url;
        self
    }

    pub fn max_executors(mut self, max: Option<usize>) -> Self {
        self.max_executors = max;
        self
    }

    pub fn heart_rate_ms(mut self, ms: Option<u64>) -> Self {
        self.heart_rate_ms = ms;
        self
    }

    pub fn build(self) -> Result<Config> {
        let defaults = config::Config::try_from(&Config::default())
            .context("Failed to seed configuration defaults")?;

        let mut builder = config::Config::builder().add_source(defaults);

        let path = self
            .config_path
            .or_else(|| std::env::var(format!("{}_CONFIG_PATH", ENV_PREFIX)).ok().map(PathBuf::from));
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

        let mut config: Config = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        if let Ok(url) = std::env::var(format!("{}_DATABASE_URL", ENV_PREFIX)) {
            config.database.url = Some(url);
        }
        if let Some(url) = self.database_url {
            config.database.url = Some(url);
        }
        if let Some(max) = self.max_executors {
            config.scheduler.max_executors = max;
        }
        if let Some(ms) = self.heart_rate_ms {
            config.scheduler.heart_rate_ms = ms;
        }

        config.scheduler.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scheduler.heart_rate(), Duration::from_millis(300));
        assert_eq!(config.scheduler.reload_frequency(), Duration::from_secs(60));
        assert_eq!(config.scheduler.max_executors, 1);
        assert_eq!(config.scheduler.unit, "u0");
        assert!(config.scheduler.wait_timeout().is_none());
    }

    #[test]
    fn test_file_and_overrides() {
        let dir = std::env::temp_dir().join(format!("cadence-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cadence.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[scheduler]\nmax_executors = 3\ndomain = \"org.acme\"\n\n[database]\nmax_connections = 5"
        )
        .unwrap();

        let config = Config::builder()
            .config_path(Some(path))
            .database_url(Some("postgres://localhost/cadence".into()))
            .heart_rate_ms(Some(50))
            .build()
            .unwrap();

        assert_eq!(config.scheduler.max_executors, 3);
        assert_eq!(config.scheduler.domain.as_deref(), Some("org.acme"));
        assert_eq!(config.scheduler.heart_rate_ms, 50);
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.database.url.as_deref(), Some("postgres://localhost/cadence"));
    }

    #[test]
    fn test_invalid_domain_is_rejected() {
        let config = SchedulerConfig {
            domain: Some("not a domain".into()),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "invalid domain name \"not a domain\"");
    }

    #[test]
    fn test_renders_toml() {
        let toml = Config::default().to_toml().unwrap();
        assert!(toml.contains("[scheduler]"));
        assert!(toml.contains("heart_rate_ms = 300"));
    }
}
