pub mod address;
pub mod config;
pub mod error;
pub mod logging;

pub use tracing;

/// Control signal broadcast to every listener and session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
