//! HTTP browser-bridge capability provider.
//!
//! Browser actions are executed by an external bridge process. Each action is
//! sent as one JSON command envelope and answered with one response envelope:
//!
//! ```text
//! POST {base_url}/command
//! {"command_id": "...", "type": "navigate", "params": {...}}
//! -> {"command_id": "...", "success": true, "result": {...}, "error": null}
//! ```

pub mod client;
pub mod types;

pub use client::BridgeCapabilityProvider;
