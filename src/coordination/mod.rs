//! Cross-process coordination
//!
//! A long-lived TCP service used by tests running inside worker
//! subprocesses: named locks, a shared key/value store, tag-based value
//! set leasing and run-once rendezvous. Workers find it through the
//! `PABOTLIBURI` environment variable.

mod client;
pub mod protocol;
mod server;
mod state;

pub use client::CoordinationClient;
pub use server::{CoordinationServer, DEFAULT_LIVENESS};
pub use state::{parse_resource_file, CoordinationState, ValueSet};

/// Default bind address.
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8270;
