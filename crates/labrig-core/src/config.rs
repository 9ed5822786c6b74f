/*!
 * Configuration management for labrig.
 *
 * This module loads and exposes the instrument configuration: logging and
 * scheduler settings plus one table per device holding its module key
 * bindings, named motor positions, motion profiles and operation timeouts.
 */
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Instrument-wide configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Per-device configuration tables, keyed by device name
    #[serde(default)]
    pub devices: HashMap<String, DeviceConfig>,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Instrument name
    #[serde(default = "default_instrument_name")]
    pub instrument_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to log to stdout
    #[serde(default = "default_log_stdout")]
    pub stdout: bool,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Device tick interval in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl SchedulerConfig {
    /// Get the tick interval as a duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Configuration table for one device instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Module role name -> symbolic module key in the module registry
    /// (e.g. "motor" -> "loader.motor")
    #[serde(default)]
    pub modules: HashMap<String, String>,

    /// Named motor positions in half-steps (e.g. "drawer_closed" -> 100)
    #[serde(default)]
    pub positions: HashMap<String, i32>,

    /// Named motion profile indexes
    #[serde(default)]
    pub profiles: HashMap<String, u8>,

    /// Named operation timeouts in milliseconds
    #[serde(default)]
    pub timeouts: HashMap<String, u64>,
}

impl DeviceConfig {
    /// Look up the symbolic module key bound to a module role
    pub fn module_key(&self, role: &str) -> Result<&str> {
        self.modules
            .get(role)
            .map(String::as_str)
            .ok_or_else(|| Error::config(format!("No module key configured for role {}", role)))
    }

    /// Look up a named motor position
    pub fn position(&self, key: &str) -> Result<i32> {
        self.positions
            .get(key)
            .copied()
            .ok_or_else(|| Error::config(format!("No position configured for {}", key)))
    }

    /// Look up a named motion profile index
    pub fn profile(&self, key: &str) -> Result<u8> {
        self.profiles
            .get(key)
            .copied()
            .ok_or_else(|| Error::config(format!("No motion profile configured for {}", key)))
    }

    /// Look up a named operation timeout, falling back to a default
    pub fn timeout(&self, key: &str, default: Duration) -> Duration {
        self.timeouts
            .get(key)
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(default)
    }
}

impl Config {
    /// Get the configuration table for a device, or an empty default
    pub fn device(&self, name: &str) -> DeviceConfig {
        self.devices.get(name).cloned().unwrap_or_default()
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instrument_name: default_instrument_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stdout: default_log_stdout(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

fn default_instrument_name() -> String {
    "labrig".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_stdout() -> bool {
    true
}

fn default_tick_interval_ms() -> u64 {
    50
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!(
                    "Configuration file {} does not exist, using defaults",
                    config_file
                );
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!(
                "Loading configuration from environment variables with prefix {}",
                prefix
            );
            config_builder = config_builder
                .add_source(Environment::with_prefix(&prefix).separator("__").try_parsing(true));
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone, Default)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
