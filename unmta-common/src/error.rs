//! Foundational error types shared across the UnMTA crates.

use std::io;

use thiserror::Error;

/// Errors raised while loading the Unfig configuration tree.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Unable to parse configuration file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Errors that can occur while a session is being handled.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Connection error occurred.
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// Protocol error occurred during the session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The client went silent for longer than the inactivity timeout.
    #[error("Session timed out after {0} seconds")]
    Timeout(u64),
}

impl SessionError {
    /// Returns `true` if the error is a client-side issue.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }
}
