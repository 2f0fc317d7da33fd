//! Cluster configuration
//!
//! Loaded in layers, lowest precedence first:
//! 1. Hardcoded defaults
//! 2. TOML file named by `CANOPY_CONFIG`, else `./canopy.toml`
//! 3. Environment variable overrides
//!
//! Property maps using the dotted key names (`hosts.zookeeper`,
//! `path.root`, `retry.initialSleepTime`, ...) are accepted through
//! [`ClusterConfig::from_properties`].

pub mod error;

use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use canopy_coordination::PathNamespace;
use canopy_coordination::RetryConfig;
use canopy_coordination::SessionLossPolicy;
use canopy_coordination::constants::DEFAULT_ROOT_PATH;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use error::ConfigError;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_FILE_ENV: &str = "CANOPY_CONFIG";
/// Configuration file picked up from the working directory.
pub const LOCAL_CONFIG_FILE: &str = "./canopy.toml";

/// Settings for one process's coordination client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Coordination service connection string.
    pub hosts: String,
    /// Namespace root all cluster state lives under.
    pub path_root: String,
    /// Fixed node id; a random UUID is used when unset.
    pub node_id: Option<String>,
    /// Session timeout to request when the store session is opened. The
    /// session is established by the caller, so this is handed to the store
    /// rather than enforced here.
    pub session_timeout_ms: u64,
    /// Upper bound on a single store call before it is treated as a lost
    /// connection and retried.
    pub connection_timeout_ms: u64,
    pub session_loss_policy: SessionLossPolicy,
    pub retry: RetryConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hosts: "127.0.0.1:2181".to_string(),
            path_root: DEFAULT_ROOT_PATH.to_string(),
            node_id: None,
            session_timeout_ms: 20_000,
            connection_timeout_ms: 3_000,
            session_loss_policy: SessionLossPolicy::default(),
            retry: RetryConfig::default(),
        }
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, value, e.to_string()))
}

impl ClusterConfig {
    /// Defaults, then the first TOML file found, then environment overrides.
    pub fn load_with_layers() -> Result<Self, ConfigError> {
        let mut config = Self::load_toml_with_fallbacks()?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn load_toml_with_fallbacks() -> Result<Self, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_FILE_ENV) {
            let path = Path::new(&config_path);
            if path.exists() {
                info!("Loading configuration from {CONFIG_FILE_ENV}: {config_path}");
                return Self::from_toml_file(path);
            }
            warn!("{CONFIG_FILE_ENV} specified but not found: {config_path}");
        }

        let local_config = Path::new(LOCAL_CONFIG_FILE);
        if local_config.exists() {
            info!("Loading configuration from: {LOCAL_CONFIG_FILE}");
            return Self::from_toml_file(local_config);
        }

        info!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a TOML file. Missing fields take defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Apply `CANOPY_*` environment variables on top of the current values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any variable source.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(val) = lookup("CANOPY_HOSTS") {
            self.hosts = val;
        }
        if let Some(val) = lookup("CANOPY_PATH_ROOT") {
            self.path_root = val;
        }
        if let Some(val) = lookup("CANOPY_NODE_ID") {
            self.node_id = Some(val);
        }
        if let Some(val) = lookup("CANOPY_RETRY_INITIAL_SLEEP_MS") {
            self.retry.initial_sleep_ms = parse_value("CANOPY_RETRY_INITIAL_SLEEP_MS", &val)?;
        }
        if let Some(val) = lookup("CANOPY_RETRY_INTERVAL_TIMES") {
            self.retry.max_retries = parse_value("CANOPY_RETRY_INTERVAL_TIMES", &val)?;
        }
        if let Some(val) = lookup("CANOPY_SESSION_TIMEOUT_MS") {
            self.session_timeout_ms = parse_value("CANOPY_SESSION_TIMEOUT_MS", &val)?;
        }
        Ok(())
    }

    /// Build a configuration from dotted property keys. Unknown keys are
    /// ignored; malformed values are rejected.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        // Sorted so `hosts` wins over its alias regardless of map order.
        let mut keys: Vec<&String> = properties.keys().collect();
        keys.sort_by(|a, b| (a.as_str() == "hosts", a.as_str()).cmp(&(b.as_str() == "hosts", b.as_str())));
        for key in keys {
            let value = &properties[key];
            match key.as_str() {
                "hosts" | "hosts.zookeeper" => config.hosts = value.clone(),
                "path.root" => config.path_root = value.clone(),
                "node.id" => config.node_id = Some(value.clone()),
                "retry.initialSleepTime" => config.retry.initial_sleep_ms = parse_value(key, value)?,
                "retry.intervalTimes" => config.retry.max_retries = parse_value(key, value)?,
                "retry.maxSleepTime" => config.retry.max_sleep_ms = parse_value(key, value)?,
                "session.timeout" => config.session_timeout_ms = parse_value(key, value)?,
                "connection.timeout" => config.connection_timeout_ms = parse_value(key, value)?,
                "membership.lossPolicy" => config.session_loss_policy = parse_value(key, value)?,
                other => debug!(key = other, "ignoring unknown configuration property"),
            }
        }
        Ok(config)
    }

    /// Reject combinations no client can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.trim().is_empty() {
            return Err(ConfigError::invalid("hosts", &self.hosts, "must not be empty"));
        }
        if self.path_root.trim_matches('/').is_empty() {
            return Err(ConfigError::invalid("path.root", &self.path_root, "must not be empty"));
        }
        if let Err(e) = PathNamespace::new(&self.path_root) {
            return Err(ConfigError::invalid("path.root", &self.path_root, e.to_string()));
        }
        if self.retry.initial_sleep_ms == 0 {
            return Err(ConfigError::invalid("retry.initialSleepTime", "0", "must be greater than zero"));
        }
        if self.retry.max_sleep_ms < self.retry.initial_sleep_ms {
            return Err(ConfigError::invalid(
                "retry.maxSleepTime",
                self.retry.max_sleep_ms.to_string(),
                format!("must be at least retry.initialSleepTime ({})", self.retry.initial_sleep_ms),
            ));
        }
        if self.session_timeout_ms == 0 {
            return Err(ConfigError::invalid("session.timeout", "0", "must be greater than zero"));
        }
        if self.connection_timeout_ms == 0 {
            return Err(ConfigError::invalid("connection.timeout", "0", "must be greater than zero"));
        }
        Ok(())
    }

    pub fn namespace(&self) -> Result<PathNamespace, ConfigError> {
        PathNamespace::new(&self.path_root).map_err(|e| ConfigError::invalid("path.root", &self.path_root, e.to_string()))
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}
