use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::query::Encoding;
use crate::retry::RetryPolicy;

/// Environment variable naming the agent config file.
pub const CONFIG_ENV: &str = "GREETER_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "/etc/opt/greeter/config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to open config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Config subtree the agent reacts to.
    #[serde(default = "default_greeter_path")]
    pub config_path: String,

    /// Telemetry path the derived state is published under.
    #[serde(default = "default_greeter_path")]
    pub state_path: String,

    #[serde(default = "default_commit_end_path")]
    pub commit_end_path: String,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default = "default_shutdown_timeout", with = "duration_ms")]
    pub shutdown_timeout: Duration,

    #[serde(default)]
    pub disabled_state: DisabledStatePolicy,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            config_path: default_greeter_path(),
            state_path: default_greeter_path(),
            commit_end_path: default_commit_end_path(),
            retry: RetryConfig::default(),
            channel_capacity: default_channel_capacity(),
            shutdown_timeout: default_shutdown_timeout(),
            disabled_state: DisabledStatePolicy::default(),
            query: QueryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Loads the config named by `GREETER_CONFIG`, falling back to the
    /// default location. A missing file yields the defaults.
    pub fn load() -> ConfigResult<Self> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        if !path.exists() {
            return Ok(Self::default());
        }
        let config: Self = from_file(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.app_name.trim().is_empty() {
            return Err(ConfigError::Invalid("app_name must not be empty".into()));
        }
        for (field, value) in [
            ("config_path", &self.config_path),
            ("state_path", &self.state_path),
            ("commit_end_path", &self.commit_end_path),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", field)));
            }
        }
        if self.config_path == self.commit_end_path {
            return Err(ConfigError::Invalid(
                "config_path must differ from commit_end_path".into(),
            ));
        }
        if self.logging.max_size_bytes == 0 {
            return Err(ConfigError::Invalid(
                "logging.max_size_bytes must be greater than 0".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_interval", with = "duration_ms")]
    pub interval: Duration,

    /// `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: default_retry_interval(),
            max_attempts: None,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::new(config.interval, config.max_attempts)
    }
}

/// What to do with published state when no name is configured.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DisabledStatePolicy {
    /// Publish nothing; the last published state stays as it was.
    #[default]
    Keep,
    /// Delete the published state.
    Clear,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryBackend {
    #[default]
    JsonRpc,
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default)]
    pub backend: QueryBackend,

    #[serde(default = "default_query_url")]
    pub url: String,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_password")]
    pub password: String,

    #[serde(default = "default_query_timeout", with = "duration_ms")]
    pub timeout: Duration,

    #[serde(default)]
    pub encoding: Encoding,

    #[serde(default = "default_uptime_path")]
    pub uptime_path: String,

    /// Value returned by the static backend.
    #[serde(default)]
    pub static_value: Option<String>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            backend: QueryBackend::default(),
            url: default_query_url(),
            username: default_username(),
            password: default_password(),
            timeout: default_query_timeout(),
            encoding: Encoding::default(),
            uptime_path: default_uptime_path(),
            static_value: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_file")]
    pub file: Option<PathBuf>,

    /// The log file is rotated once it would grow past this size.
    #[serde(default = "default_log_max_size")]
    pub max_size_bytes: usize,

    /// Rotated files kept next to the active one.
    #[serde(default = "default_log_max_backups")]
    pub max_backups: usize,

    /// Rotated files older than this are removed at startup. `None` keeps them.
    #[serde(default = "default_log_max_age_days")]
    pub max_age_days: Option<u64>,

    /// Also forward logs to the local syslog daemon.
    #[serde(default = "default_true")]
    pub syslog: bool,

    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Console logging is enabled while this file exists.
    #[serde(default = "default_dev_mode_marker")]
    pub dev_mode_marker: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
            max_size_bytes: default_log_max_size(),
            max_backups: default_log_max_backups(),
            max_age_days: default_log_max_age_days(),
            syslog: true,
            format: default_log_format(),
            dev_mode_marker: default_dev_mode_marker(),
        }
    }
}

fn default_app_name() -> String {
    "greeter".to_string()
}
fn default_greeter_path() -> String {
    ".greeter".to_string()
}
fn default_commit_end_path() -> String {
    ".commit.end".to_string()
}
fn default_channel_capacity() -> usize {
    16
}
fn default_retry_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_query_url() -> String {
    "http://127.0.0.1/jsonrpc".to_string()
}
fn default_username() -> String {
    "admin".to_string()
}
fn default_password() -> String {
    "NokiaSrl1!".to_string()
}
fn default_query_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_uptime_path() -> String {
    "/system/information/last-booted".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("/var/log/greeter/greeter.log"))
}
fn default_log_max_size() -> usize {
    2 * 1024 * 1024
}
fn default_log_max_backups() -> usize {
    3
}
fn default_log_max_age_days() -> Option<u64> {
    Some(28)
}
fn default_true() -> bool {
    true
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_dev_mode_marker() -> PathBuf {
    PathBuf::from("/tmp/.ndk-dev-mode")
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let file = File::open(path.as_ref()).map_err(|source| ConfigError::Io {
        path: path.as_ref().to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> ConfigResult<T> {
    Ok(serde_json::from_str(s)?)
}

pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
