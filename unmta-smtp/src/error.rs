//! Error types for the SMTP server core.

use std::io;

use thiserror::Error;

use crate::plugin::RegistryError;

/// Errors that can occur during connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O error during connection operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The inactivity countdown expired while waiting for client octets.
    #[error("No client activity for {0} seconds")]
    Inactive(u64),

    /// A command line exceeded the 512 octet ceiling.
    #[error("Line too long")]
    LineTooLong,

    /// Formatting error while preparing a reply.
    #[error("Reply formatting error: {0}")]
    Format(#[from] std::fmt::Error),
}

/// Errors that can occur during TLS operations.
#[derive(Debug, Error)]
pub enum TlsError {
    /// I/O error during the handshake.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to load the TLS certificate.
    #[error("Failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to load the TLS private key.
    #[error("Failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// Rustls library error.
    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

/// Errors that can bring down the server or prevent it from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the listening socket.
    #[error("Failed to bind listener to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Required TLS material is missing or unreadable.
    #[error("TLS material missing: {path}")]
    TlsMaterial { path: String },

    /// STARTTLS was enabled without both a certificate and a key.
    #[error("STARTTLS is enabled but [tls].{field} is not configured")]
    TlsIncomplete { field: &'static str },

    /// Plugin registration failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A plugin failed its server-start hook.
    #[error("Plugin startup failed: {0}")]
    PluginStart(#[source] anyhow::Error),

    /// I/O error in the accept loop.
    #[error("Listener error: {0}")]
    Accept(#[from] io::Error),
}

/// Specialized `Result` type for connection operations.
pub(crate) type ConnectionResult<T> = std::result::Result<T, ConnectionError>;
