//! Service configuration loading from file and environment variables.

use bindery_db::DbRuntimeSettings;
use bindery_types::{DeviceType, Limits, LocalDevice, OsAccountId};
use serde::Deserialize;
use thiserror::Error;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Worker and limit settings.
    #[serde(default)]
    pub service: ServiceConfig,

    /// Trust store settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Identity of the device this service runs on.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Authenticator module settings.
    #[serde(default)]
    pub modules: ModulesConfig,
}

/// Worker queue and trust store ceilings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Capacity of the worker command queue. Entry points fail with `Busy`
    /// when it is full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_max_groups")]
    pub max_groups_per_account: usize,

    /// Includes the local device.
    #[serde(default = "default_max_devices")]
    pub max_devices_per_group: usize,

    #[serde(default = "default_max_role_entries")]
    pub max_role_entries: usize,

    /// Account used for inbound data that names none.
    #[serde(default = "default_os_account")]
    pub default_os_account: OsAccountId,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file, or `:memory:`.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "bindery_session=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Local device identity.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Device UDID. A random one is generated when unset.
    #[serde(default = "LocalDevice::generated_udid")]
    pub udid: String,

    #[serde(default = "default_user_type")]
    pub user_type: DeviceType,

    #[serde(default)]
    pub conn_device_id: Option<String>,
}

/// Authenticator module configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModulesConfig {
    /// Registers the reference module under both module types.
    #[serde(default = "default_enable_reference")]
    pub enable_reference: bool,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_groups() -> usize {
    Limits::default().max_groups_per_account
}

fn default_max_devices() -> usize {
    Limits::default().max_devices_per_group
}

fn default_max_role_entries() -> usize {
    Limits::default().max_role_entries
}

fn default_os_account() -> OsAccountId {
    100
}

fn default_db_path() -> String {
    "bindery.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    DbRuntimeSettings::default().busy_timeout_ms
}

fn default_pool_max_size() -> u32 {
    DbRuntimeSettings::default().pool_max_size
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_user_type() -> DeviceType {
    DeviceType::Accessory
}

fn default_enable_reference() -> bool {
    true
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_groups_per_account: default_max_groups(),
            max_devices_per_group: default_max_devices(),
            max_role_entries: default_max_role_entries(),
            default_os_account: default_os_account(),
        }
    }
}

impl ServiceConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            max_groups_per_account: self.max_groups_per_account,
            max_devices_per_group: self.max_devices_per_group,
            max_role_entries: self.max_role_entries,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl DatabaseConfig {
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            udid: LocalDevice::generated_udid(),
            user_type: default_user_type(),
            conn_device_id: None,
        }
    }
}

impl DeviceConfig {
    pub fn local_device(&self) -> LocalDevice {
        let mut local = LocalDevice::new(self.udid.clone(), self.user_type);
        local.conn_device_id = self.conn_device_id.clone();
        local
    }
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            enable_reference: default_enable_reference(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Rejects values the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.queue_capacity == 0 {
            return Err(ConfigError::Invalid("service.queue_capacity must be positive".into()));
        }
        if self.service.max_devices_per_group < 2 {
            return Err(ConfigError::Invalid(
                "service.max_devices_per_group must leave room for a peer".into(),
            ));
        }
        if self.device.udid.trim().is_empty() {
            return Err(ConfigError::Invalid("device.udid must not be empty".into()));
        }
        if self.database.pool_max_size == 0 {
            return Err(ConfigError::Invalid("database.pool_max_size must be positive".into()));
        }
        Ok(())
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `BINDERY_DB_PATH` overrides `database.path`
/// - `BINDERY_LOG_LEVEL` overrides `logging.level`
/// - `BINDERY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `BINDERY_QUEUE_CAPACITY` overrides `service.queue_capacity`
/// - `BINDERY_DEVICE_UDID` overrides `device.udid`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the resulting configuration is invalid.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(db_path) = var("BINDERY_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("BINDERY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("BINDERY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(capacity) = var("BINDERY_QUEUE_CAPACITY") {
        match capacity.parse() {
            Ok(parsed) => config.service.queue_capacity = parsed,
            Err(_) => tracing::warn!(value = %capacity, "ignoring unparsable BINDERY_QUEUE_CAPACITY"),
        }
    }
    if let Some(udid) = var("BINDERY_DEVICE_UDID") {
        config.device.udid = udid;
    }
}
