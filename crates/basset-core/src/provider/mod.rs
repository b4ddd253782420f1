//! Provider ports consulted by leaf steps.
//!
//! - `capability` -- browser actions (navigate, click, fill, extract, screenshot, wait)
//! - `box_capability` -- type-erased capability provider
//! - `detection` -- pattern detection over page text
//! - `verification` -- local format checks
//! - `ingestion` -- entity persistence

pub mod box_capability;
pub mod capability;
pub mod detection;
pub mod ingestion;
pub mod verification;

pub use box_capability::BoxCapabilityProvider;
pub use capability::CapabilityProvider;
pub use detection::{DetectionProvider, PatternDetector, PatternMatch};
pub use ingestion::{BoxIngestionProvider, IngestionProvider, KvIngestionProvider};
pub use verification::{FormatVerifier, Verification, VerificationProvider};
