//! warden-core: Core library for warden
//!
//! This crate keeps a metered proxy (V2Ray) in step with a registry of user
//! accounts: it meters per-account traffic, deactivates accounts that reach
//! their traffic or time limit, and regenerates the proxy configuration and
//! restarts the proxy whenever the set of active accounts changes.
//!
//! # Architecture
//!
//! ```text
//! Admin API ──┐                          ┌── PersistenceGateway (blob store)
//!             ├─→ ControlPlane ─ registry┤
//! Enforcer ───┘        │                 └── MetricsGateway (stats API)
//!                      ↓
//!             ProcessSupervisor → synthesize config → proxy child
//! ```
//!
//! # Modules
//!
//! - `account`: Account model and deactivation policy
//! - `registry`: Lock-protected account registry and snapshots
//! - `persistence`: Blob store gateway and the persisted account document
//! - `stats`: Reset-on-read traffic counter queries
//! - `proxy_config`: Proxy configuration synthesis
//! - `supervisor`: Proxy process lifecycle and serialized restarts
//! - `service`: Control plane shared by the enforcer and admin handlers
//! - `enforcer`: Periodic quota enforcement loop
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//! - `web`: Admin HTTP API (feature-gated: `web`)
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod account;
pub mod config;
pub mod enforcer;
pub mod error;
pub mod logging;
pub mod persistence;
pub mod proxy_config;
pub mod registry;
pub mod service;
pub mod stats;
pub mod supervisor;

#[cfg(feature = "web")]
pub mod web;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
