//! Storage abstractions for Basset.
//!
//! Defines the key/value store trait every persistent component goes
//! through, plus an in-memory implementation. Durable implementations live
//! in basset-infra.

pub mod kv_store;
pub mod memory;

pub use kv_store::KvStore;
pub use memory::InMemoryKvStore;
