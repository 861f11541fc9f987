//! Traffic records REST server.
//!
//! The binary in `main.rs` wires configuration, adapters and the outbox
//! dispatcher; everything it uses is exposed here so router-level tests can
//! build the same app against in-memory adapters.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod router;
pub mod state;
