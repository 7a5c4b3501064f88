//! Configuration for hookline.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//! api_key = "${HOOKLINE_API_KEY}"
//!
//! [engine]
//! command_prefix = "/"
//! cron_concurrency = 8
//!
//! [catalog]
//! path = "config/catalog.toml"
//!
//! [mirror]
//! log = true
//! redis = true
//! ```

use crate::mirror::{BroadcastMirror, LogMirror, MirrorSet, RedisMirror};
use deadpool_redis::Pool;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "HOOKLINE_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "config/hookline.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub mirror: MirrorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token required on the ingress API, if set
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Events buffered per (tenant, server) lane
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            consumer_group: default_consumer_group(),
            lane_capacity: default_lane_capacity(),
        }
    }
}

fn default_consumer_group() -> String {
    crate::DEFAULT_CONSUMER_GROUP.to_string()
}

fn default_lane_capacity() -> usize {
    crate::worker::DEFAULT_LANE_CAPACITY
}

/// Dispatch engine tuning
#[derive(Debug, Deserialize, Clone)]
pub struct EngineSection {
    /// Used when a server has no `commandPrefix` setting
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,

    /// Installations reconciled in parallel during a module sync
    #[serde(default = "default_cron_concurrency")]
    pub cron_concurrency: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Per-request timeout of the HTTP game adapter
    #[serde(default = "default_adapter_timeout_ms")]
    pub adapter_timeout_ms: u64,

    /// How often due delayed jobs and repeating schedules are fired
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            command_prefix: default_command_prefix(),
            cron_concurrency: default_cron_concurrency(),
            connect_timeout_ms: default_connect_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            adapter_timeout_ms: default_adapter_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl EngineSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn default_command_prefix() -> String {
    crate::commands::DEFAULT_COMMAND_PREFIX.to_string()
}

fn default_cron_concurrency() -> usize {
    crate::cronjobs::DEFAULT_CONCURRENCY
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_adapter_timeout_ms() -> u64 {
    10_000
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CatalogConfig {
    /// Seed file for the in-process repository (TOML or JSON)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MirrorConfig {
    #[serde(default = "default_true")]
    pub log: bool,

    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,

    /// Publish to `hookline:mirror:{tenant}` channels
    #[serde(default)]
    pub redis: bool,

    /// In-process broadcast capacity; 0 disables it
    #[serde(default)]
    pub broadcast_capacity: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            log: true,
            log_prefix: default_log_prefix(),
            redis: false,
            broadcast_capacity: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_prefix() -> String {
    "hookline".to_string()
}

impl EngineConfig {
    /// Build the configured mirrors. The Redis mirror is skipped when no
    /// pool is available.
    pub fn build_mirrors(&self, pool: Option<&Pool>) -> MirrorSet {
        let mut mirrors = MirrorSet::new();

        if self.mirror.log {
            mirrors = mirrors.with(Arc::new(LogMirror::with_prefix(&self.mirror.log_prefix)));
        }

        if self.mirror.redis {
            match pool {
                Some(pool) => mirrors = mirrors.with(Arc::new(RedisMirror::new(pool.clone()))),
                None => warn!("Redis mirror enabled but no Redis pool available, skipping"),
            }
        }

        if self.mirror.broadcast_capacity > 0 {
            mirrors = mirrors.with(Arc::new(BroadcastMirror::new(
                self.mirror.broadcast_capacity,
            )));
        }

        mirrors
    }

    /// Load configuration from the default path or HOOKLINE_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;

        info!(
            port = config.server.port,
            command_prefix = %config.engine.command_prefix,
            catalog = ?config.catalog.path,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse and validate TOML text, substituting `${VAR}` placeholders.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        debug!("Parsing TOML configuration");
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.command_prefix.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "engine.command_prefix must not be empty".to_string(),
            ));
        }

        if self.engine.cron_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "engine.cron_concurrency must be at least 1".to_string(),
            ));
        }

        if self.worker.lane_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "worker.lane_capacity must be at least 1".to_string(),
            ));
        }

        if self.engine.tick_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "engine.tick_interval_ms must be at least 1".to_string(),
            ));
        }

        if let Some(key) = &self.server.api_key {
            if key.contains("${") {
                warn!("server.api_key contains an unsubstituted environment variable");
            }
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}
