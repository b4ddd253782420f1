//! Capability provider trait: the browser actions leaf steps delegate to.
//!
//! The engine never drives a browser itself. `navigate`, `click`, `fill`,
//! `extract`, `screenshot` and element waits are forwarded to a provider
//! that returns a JSON result or a classified [`StepError`].

use std::future::Future;
use std::time::Duration;

use basset_types::error::StepError;
use basset_types::workflow::{
    ClickParams, ExtractParams, FillParams, NavigateParams, ScreenshotParams,
};
use serde_json::Value;

/// Browser capabilities required by the leaf step kinds.
///
/// Parameters arrive with every `${...}` reference already substituted.
/// `timeout` is the budget the engine grants the call; the engine also
/// enforces it from the outside.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
pub trait CapabilityProvider: Send + Sync {
    /// Human-readable provider name.
    fn name(&self) -> &str;

    fn navigate(
        &self,
        params: &NavigateParams,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, StepError>> + Send;

    fn click(
        &self,
        params: &ClickParams,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, StepError>> + Send;

    fn fill(
        &self,
        params: &FillParams,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, StepError>> + Send;

    /// Extract a structured record from the current page.
    fn extract(
        &self,
        params: &ExtractParams,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, StepError>> + Send;

    /// Capture the page or an element. The returned value is an opaque
    /// artifact reference.
    fn screenshot(
        &self,
        params: &ScreenshotParams,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, StepError>> + Send;

    /// Block until `selector` is present or `timeout` elapses.
    fn wait_for(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, StepError>> + Send;
}
