//! Configuration for the muxchat server.
//!
//! Values are layered, lowest precedence first:
//!
//! 1. built-in defaults,
//! 2. an optional TOML file (`MUXCHAT_CONFIG` or `--config`),
//! 3. environment variables:
//!    - `MUXCHAT_BIND_ADDR`               (default: "0.0.0.0")
//!    - `MUXCHAT_PORT`                    (default: "9000")
//!    - `MUXCHAT_MAX_ONLINE`              (default: "1024")
//!    - `MUXCHAT_SUPERVISE_INTERVAL_SECS` (default: "600")
//!    - `MUXCHAT_MAX_PAYLOAD_BYTES`       (default: 1 GiB)
//!    - `MUXCHAT_READ_DEADLINE_SECS`      (default: "36000", 0 disables)
//!    - `MUXCHAT_WRITE_DEADLINE_SECS`     (default: "30", 0 disables)
//!    - `MUXCHAT_LOG`                     (default: "info")
//! 4. command-line flags, applied by the binary.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const MB: usize = 1 << 20;
pub const GB: usize = 1 << 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// IP address / interface to bind to (e.g. "0.0.0.0" or "127.0.0.1").
    pub bind_addr: String,

    /// TCP port to listen on.
    pub port: u16,

    /// Online connections above which the registry reports itself full.
    pub max_online: usize,

    /// Seconds between two capacity checks of the registry supervisor.
    pub supervise_interval_secs: u64,

    /// Largest single message a connection may deliver.
    pub max_payload_bytes: usize,

    /// Idle read deadline per connection, in seconds. 0 disables it.
    pub read_deadline_secs: u64,

    /// Deadline for writing one message to a client, in seconds. 0 disables
    /// it. A client that stops reading is cut off once it expires.
    pub write_deadline_secs: u64,

    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "0.0.0.0".to_string(),
            port: 9000,
            max_online: 1024,
            supervise_interval_secs: 10 * 60,
            max_payload_bytes: GB,
            read_deadline_secs: 10 * 60 * 60,
            write_deadline_secs: 30,
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load defaults, then the optional file, then the process environment.
    ///
    /// `path` wins over `MUXCHAT_CONFIG` when both are given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = env::var_os("MUXCHAT_CONFIG").map(PathBuf::from);
        let mut config = match path.or(env_path.as_deref()) {
            Some(p) => Self::from_file(p)?,
            None => Config::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `MUXCHAT_*` overrides resolved through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MUXCHAT_BIND_ADDR") {
            self.bind_addr = v;
        }
        override_parsed(&lookup, "MUXCHAT_PORT", &mut self.port)?;
        override_parsed(&lookup, "MUXCHAT_MAX_ONLINE", &mut self.max_online)?;
        override_parsed(
            &lookup,
            "MUXCHAT_SUPERVISE_INTERVAL_SECS",
            &mut self.supervise_interval_secs,
        )?;
        override_parsed(&lookup, "MUXCHAT_MAX_PAYLOAD_BYTES", &mut self.max_payload_bytes)?;
        override_parsed(&lookup, "MUXCHAT_READ_DEADLINE_SECS", &mut self.read_deadline_secs)?;
        override_parsed(&lookup, "MUXCHAT_WRITE_DEADLINE_SECS", &mut self.write_deadline_secs)?;
        if let Some(v) = lookup("MUXCHAT_LOG") {
            self.log_filter = v;
        }

        if self.supervise_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "supervise_interval_secs",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Convenience: `addr:port` socket string.
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn supervise_interval(&self) -> Duration {
        Duration::from_secs(self.supervise_interval_secs)
    }

    pub fn read_deadline(&self) -> Option<Duration> {
        non_zero_secs(self.read_deadline_secs)
    }

    pub fn write_deadline(&self) -> Option<Duration> {
        non_zero_secs(self.write_deadline_secs)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    match secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    }
}

fn override_parsed<F, T>(lookup: &F, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw })?;
    }
    Ok(())
}
