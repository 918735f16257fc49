use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RotatorError};
use crate::proxy::transport::ProxyEndpoint;

const DEFAULT_CONFIG_FILE: &str = "config.json";
const STATE_FILE_NAME: &str = "proxy-rotator-state.json";

/// Upper bound for `repairTime` and `blockTimeout` in seconds (ten years)
pub const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Application configuration loaded from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Upstream proxy endpoints (required, non-empty)
    #[serde(default)]
    pub proxies: Vec<String>,
    /// Port for the relay (default: 8000)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Outbound timeout in milliseconds when the request has none
    #[serde(default = "default_timeout", alias = "DefaultTimeout")]
    pub default_timeout: u64,
    /// Seconds a broken proxy stays out of rotation
    #[serde(default = "default_repair_time")]
    pub repair_time: u64,
    /// Seconds a blocked proxy stays out of rotation
    #[serde(default = "default_block_timeout")]
    pub block_timeout: u64,
    /// Errors after which a never-successful proxy is retired
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
    /// Allow concurrent calls through one proxy
    #[serde(default)]
    pub allow_multiple_calls: bool,
    /// Busy-pool polling interval in milliseconds
    #[serde(default = "default_use_wait_time")]
    pub use_wait_time: u64,
    /// Active proxies required to leave the exhausted state
    #[serde(default = "default_free_slots_needed")]
    pub free_slots_needed: usize,
    /// Minimum spacing between dispatches through one proxy (ms, 0 = off)
    #[serde(default)]
    pub grace_time: u64,
    /// Settle delay before retrying after a 403 (ms)
    #[serde(default = "default_next_request_timeout")]
    pub next_request_timeout: u64,
    /// Maximum 403-triggered retry cycles per inbound request
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Maximum time one selection may spend waiting on a busy pool (ms)
    #[serde(default = "default_selection_timeout")]
    pub selection_timeout: u64,
    /// Transport error codes that mark a proxy broken
    #[serde(default = "default_breaking_errors")]
    pub breaking_errors: Vec<String>,
    /// Shuffle the proxy list on load
    #[serde(default)]
    pub shuffle: bool,
    /// Where the pool state is saved on shutdown
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    /// Logging output configuration
    #[serde(default)]
    pub logging: LogConfig,
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from the file named by `ROTATOR_CONFIG` and apply env overrides
    pub fn from_env() -> Result<Self> {
        let path = get_env_or("ROTATOR_CONFIG", DEFAULT_CONFIG_FILE);
        let mut config = Self::load(Path::new(&path))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            RotatorError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Parse configuration from a JSON document
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| RotatorError::InvalidConfig(format!("malformed configuration: {}", e)))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(port) = env::var("ROTATOR_PORT") {
            self.port = port.parse().map_err(|_| {
                RotatorError::InvalidConfig("ROTATOR_PORT must be a valid port number".into())
            })?;
        }
        if let Ok(addr) = env::var("ROTATOR_BIND_ADDRESS") {
            self.bind_address = addr;
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(format) = env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
        Ok(())
    }

    /// Startup-time validation; any failure here is fatal
    pub fn validate(&self) -> Result<()> {
        if self.proxies.is_empty() {
            return Err(RotatorError::InvalidConfig(
                "there are no proxies in the configuration".into(),
            ));
        }
        for proxy in &self.proxies {
            ProxyEndpoint::parse(proxy)?;
        }
        for (name, secs) in [
            ("repairTime", self.repair_time),
            ("blockTimeout", self.block_timeout),
        ] {
            if secs > MAX_WINDOW_SECS {
                return Err(RotatorError::InvalidConfig(format!(
                    "{} must be at most {} seconds",
                    name, MAX_WINDOW_SECS
                )));
            }
        }
        if self.use_wait_time == 0 {
            return Err(RotatorError::InvalidConfig(
                "useWaitTime must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Get the listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Path of the persisted pool state
    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| env::temp_dir().join(STATE_FILE_NAME))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout)
    }

    pub fn grace_time(&self) -> Option<Duration> {
        (self.grace_time > 0).then(|| Duration::from_millis(self.grace_time))
    }
}

fn default_port() -> u16 {
    8000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_timeout() -> u64 {
    30_000
}

fn default_repair_time() -> u64 {
    60
}

fn default_block_timeout() -> u64 {
    300
}

fn default_max_errors() -> u32 {
    3
}

fn default_use_wait_time() -> u64 {
    200
}

fn default_free_slots_needed() -> usize {
    30
}

fn default_next_request_timeout() -> u64 {
    2_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_selection_timeout() -> u64 {
    30_000
}

fn default_breaking_errors() -> Vec<String> {
    [
        "ETIMEDOUT",
        "ESOCKETTIMEDOUT",
        "ECONNRESET",
        "ECONNREFUSED",
        "ECONNABORTED",
        "EHOSTUNREACH",
        "ENETUNREACH",
        "EPIPE",
    ]
    .iter()
    .map(|code| code.to_string())
    .collect()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
