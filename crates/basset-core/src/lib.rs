//! Workflow engine and port trait definitions for Basset.
//!
//! This crate defines the "ports" (key/value store and provider traits) that
//! the infrastructure layer implements, together with the engine that drives
//! workflow executions over them. It depends only on `basset-types` -- never
//! on `basset-infra` or any database/IO crate.

pub mod event;
pub mod provider;
pub mod storage;
pub mod store;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
