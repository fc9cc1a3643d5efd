//! UnMTA: an extensible SMTP receiving server.
//!
//! The binary crate wires configuration, logging and the bundled example
//! plugin to the [`unmta_smtp`] core. Everything interesting lives in the
//! library crates; see [`unmta_smtp::Server`] for embedding.

pub mod plugins;
