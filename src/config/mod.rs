//! Typed server configuration.
//!
//! Loaded from environment variables or a TOML file, validated once, then
//! passed explicitly to the store and server. There is no global default
//! instance.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Options {
    /// Scope of this server's task list and its identity in the membership view.
    pub server_name: String,
    /// Servers whose last heartbeat is older than this are evicted.
    pub heartbeat_interval: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

/// On-disk shape of the TOML file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileOptions {
    server_name: Option<String>,
    heartbeat_interval_ms: Option<u64>,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Options {
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Load options from environment variables, falling back to defaults.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();
        if let Ok(name) = std::env::var("BROADCAST_SERVER_NAME") {
            options.server_name = name;
        }
        if let Ok(ms) = std::env::var("BROADCAST_HEARTBEAT_INTERVAL_MS") {
            let ms: u64 = ms.parse().map_err(|_| {
                Error::Config(format!("BROADCAST_HEARTBEAT_INTERVAL_MS is not a number: {ms}"))
            })?;
            options.heartbeat_interval = Duration::from_millis(ms);
        }
        options.otel_endpoint = std::env::var("OTEL_ENDPOINT").ok();
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            options.log_level = level;
        }
        options.validate()?;
        Ok(options)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: FileOptions =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad config: {e}")))?;
        let defaults = Self::default();
        let options = Self {
            server_name: file.server_name.unwrap_or(defaults.server_name),
            heartbeat_interval: file
                .heartbeat_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.heartbeat_interval),
            otel_endpoint: file.otel_endpoint,
            log_level: file.log_level.unwrap_or(defaults.log_level),
        };
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_name.trim().is_empty() {
            return Err(Error::Config("server name must not be empty".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat interval must be positive".to_string()));
        }
        Ok(())
    }
}

fn default_server_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| format!("broadcast-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]))
}
