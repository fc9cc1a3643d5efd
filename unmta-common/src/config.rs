//! The Unfig configuration tree.
//!
//! A passive, read-only key/value tree loaded once at startup. Section
//! defaults follow RFC 5321 recommendations where one exists. Per-plugin
//! sections live under `[plugins.<name>]` and may be supplemented by an
//! external file `plugins/<name>.toml` next to the main configuration file;
//! on key collision the external file wins.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::metadata::LevelFilter;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Unfig {
    pub smtp: SmtpConfig,
    pub auth: AuthConfig,
    pub tls: TlsConfig,
    pub log: LogConfig,
    pub plugins: toml::Table,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl Unfig {
    /// Load the configuration tree from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        config.base_dir = path.parent().map_or_else(PathBuf::new, Path::to_path_buf);

        Ok(config)
    }

    /// The merged configuration table for one plugin.
    ///
    /// Starts from the inline `[plugins.<name>]` section, then overlays any
    /// `plugins/<name>.toml` file found next to the main configuration file.
    /// External keys override inline keys.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if an external plugin file exists but cannot be
    /// read or parsed.
    pub fn plugin_config(&self, name: &str) -> Result<toml::Table, ConfigError> {
        let mut merged = match self.plugins.get(name) {
            Some(toml::Value::Table(table)) => table.clone(),
            _ => toml::Table::new(),
        };

        let external = self.base_dir.join("plugins").join(format!("{name}.toml"));
        if external.is_file() {
            let raw = std::fs::read_to_string(&external).map_err(|source| ConfigError::Read {
                path: external.display().to_string(),
                source,
            })?;
            let table: toml::Table =
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: external.display().to_string(),
                    source,
                })?;

            for (key, value) in table {
                merged.insert(key, value);
            }
        }

        Ok(merged)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub port: u16,
    pub listen: String,
    pub hostname: String,
    /// Seconds without client bytes before the connection is dropped with 421.
    #[serde(alias = "inactivityTimeout")]
    pub inactivity_timeout: u64,
    /// Seconds open sessions are given to finish after a stop is requested.
    #[serde(alias = "gracefulStopTimeout")]
    pub graceful_stop_timeout: u64,
    /// Maximum accepted message size in bytes; 0 means unlimited.
    #[serde(alias = "maxMessageSize")]
    pub max_message_size: usize,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            port: 2525,
            listen: "localhost".to_string(),
            hostname: default_hostname(),
            inactivity_timeout: 300,
            graceful_stop_timeout: 300,
            max_message_size: 0,
        }
    }
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enable: bool,
    #[serde(alias = "requireTLS")]
    pub require_tls: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enable: false,
            require_tls: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    #[serde(alias = "enableStartTLS")]
    pub enable_starttls: bool,
    pub key: Option<PathBuf>,
    pub cert: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
}

/// Verbosity of the process-wide logger.
///
/// `Smtp` is the most verbose level and additionally prints the full
/// client/server dialog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Smtp,
}

impl LogLevel {
    #[must_use]
    pub const fn filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Smtp => LevelFilter::TRACE,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Smtp => "smtp",
        })
    }
}
