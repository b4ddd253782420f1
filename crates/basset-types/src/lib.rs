//! Shared domain types for Basset.
//!
//! This crate contains the types used across the Basset workflow engine:
//! workflow definitions and their step trees, execution state, the error
//! taxonomy, engine configuration, lifecycle events and store envelopes.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod store;
pub mod workflow;
