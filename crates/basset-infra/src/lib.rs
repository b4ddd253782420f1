//! Infrastructure layer for Basset.
//!
//! Contains implementations of the port traits defined in `basset-core`:
//! the SQLite key/value store, the HTTP browser-bridge capability provider,
//! and the `config.toml` loader.

pub mod bridge;
pub mod config;
pub mod sqlite;
