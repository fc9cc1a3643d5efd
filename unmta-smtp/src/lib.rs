//! The SMTP receiving core of UnMTA.
//!
//! Accepts TCP connections, drives each through an RFC 5321 / 3207 / 4954
//! conversation, and delegates every policy decision to an ordered chain of
//! plugins. The server takes no position on what mail is acceptable: with no
//! plugins loaded it greets, parses, enforces command sequencing and answers
//! with protocol defaults.

pub mod command;
pub mod connection;
mod data;
pub mod dispatch;
pub mod error;
mod listener;
mod machine;
pub mod phase;
pub mod plugin;
pub mod response;
pub mod server;
pub mod session;

pub use command::{Command, MailParameters, SmtpCommand, MAX_LINE_OCTETS};
pub use connection::TlsMaterial;
pub use dispatch::Hook;
pub use error::ServerError;
pub use phase::{GreetingType, SessionPhase};
pub use plugin::{GlobalContext, HookResult, Plugin, PluginManager, RegistryError};
pub use response::{Action, Response, ResponseError, ResponsePhase};
pub use server::{BoundServer, Server};
pub use session::{PluginView, Session};
