//! BoxCapabilityProvider -- object-safe dynamic dispatch wrapper for CapabilityProvider.
//!
//! Same blanket-impl pattern as the other boxed ports:
//! 1. Define an object-safe `CapabilityProviderDyn` trait with boxed futures
//! 2. Blanket-impl `CapabilityProviderDyn` for all `T: CapabilityProvider`
//! 3. `BoxCapabilityProvider` wraps `Box<dyn CapabilityProviderDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use basset_types::error::StepError;
use basset_types::workflow::{
    ClickParams, ExtractParams, FillParams, NavigateParams, ScreenshotParams,
};
use serde_json::Value;

use super::capability::CapabilityProvider;

type BoxedResult<'a> = Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>>;

/// Object-safe version of [`CapabilityProvider`] with boxed futures.
pub trait CapabilityProviderDyn: Send + Sync {
    fn name(&self) -> &str;

    fn navigate_boxed<'a>(&'a self, params: &'a NavigateParams, timeout: Duration)
    -> BoxedResult<'a>;

    fn click_boxed<'a>(&'a self, params: &'a ClickParams, timeout: Duration) -> BoxedResult<'a>;

    fn fill_boxed<'a>(&'a self, params: &'a FillParams, timeout: Duration) -> BoxedResult<'a>;

    fn extract_boxed<'a>(&'a self, params: &'a ExtractParams, timeout: Duration)
    -> BoxedResult<'a>;

    fn screenshot_boxed<'a>(
        &'a self,
        params: &'a ScreenshotParams,
        timeout: Duration,
    ) -> BoxedResult<'a>;

    fn wait_for_boxed<'a>(&'a self, selector: &'a str, timeout: Duration) -> BoxedResult<'a>;
}

/// Blanket implementation: any `CapabilityProvider` automatically implements
/// `CapabilityProviderDyn`.
impl<T: CapabilityProvider> CapabilityProviderDyn for T {
    fn name(&self) -> &str {
        CapabilityProvider::name(self)
    }

    fn navigate_boxed<'a>(
        &'a self,
        params: &'a NavigateParams,
        timeout: Duration,
    ) -> BoxedResult<'a> {
        Box::pin(self.navigate(params, timeout))
    }

    fn click_boxed<'a>(&'a self, params: &'a ClickParams, timeout: Duration) -> BoxedResult<'a> {
        Box::pin(self.click(params, timeout))
    }

    fn fill_boxed<'a>(&'a self, params: &'a FillParams, timeout: Duration) -> BoxedResult<'a> {
        Box::pin(self.fill(params, timeout))
    }

    fn extract_boxed<'a>(
        &'a self,
        params: &'a ExtractParams,
        timeout: Duration,
    ) -> BoxedResult<'a> {
        Box::pin(self.extract(params, timeout))
    }

    fn screenshot_boxed<'a>(
        &'a self,
        params: &'a ScreenshotParams,
        timeout: Duration,
    ) -> BoxedResult<'a> {
        Box::pin(self.screenshot(params, timeout))
    }

    fn wait_for_boxed<'a>(&'a self, selector: &'a str, timeout: Duration) -> BoxedResult<'a> {
        Box::pin(self.wait_for(selector, timeout))
    }
}

/// Type-erased capability provider for runtime provider selection
/// (HTTP bridge, scripted test double, ...).
pub struct BoxCapabilityProvider {
    inner: Box<dyn CapabilityProviderDyn + Send + Sync>,
}

impl BoxCapabilityProvider {
    /// Wrap a concrete `CapabilityProvider` in a type-erased box.
    pub fn new<T: CapabilityProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn navigate(
        &self,
        params: &NavigateParams,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        self.inner.navigate_boxed(params, timeout).await
    }

    pub async fn click(&self, params: &ClickParams, timeout: Duration) -> Result<Value, StepError> {
        self.inner.click_boxed(params, timeout).await
    }

    pub async fn fill(&self, params: &FillParams, timeout: Duration) -> Result<Value, StepError> {
        self.inner.fill_boxed(params, timeout).await
    }

    pub async fn extract(
        &self,
        params: &ExtractParams,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        self.inner.extract_boxed(params, timeout).await
    }

    pub async fn screenshot(
        &self,
        params: &ScreenshotParams,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        self.inner.screenshot_boxed(params, timeout).await
    }

    pub async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<Value, StepError> {
        self.inner.wait_for_boxed(selector, timeout).await
    }
}

impl std::fmt::Debug for BoxCapabilityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCapabilityProvider")
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedCapabilities;
    use serde_json::json;

    #[tokio::test]
    async fn test_box_delegates_to_inner_provider() {
        let inner = ScriptedCapabilities::new();
        inner.push_ok("navigate", json!({"url": "https://example.com", "status": 200}));
        let boxed = BoxCapabilityProvider::new(inner.clone());

        assert_eq!(boxed.name(), "scripted");
        let params = NavigateParams {
            url: "https://example.com".to_string(),
            wait_for: None,
            timeout_ms: None,
        };
        let result = boxed.navigate(&params, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result["status"], 200);
        assert_eq!(inner.calls("navigate"), 1);
    }

    #[tokio::test]
    async fn test_box_propagates_step_errors() {
        let inner = ScriptedCapabilities::new();
        inner.push_err(
            "click",
            StepError::new(basset_types::error::ErrorKind::ElementNotFound, "#go"),
        );
        let boxed = BoxCapabilityProvider::new(inner);
        let params = ClickParams {
            selector: "#go".to_string(),
            wait_for: None,
            timeout_ms: None,
        };
        let err = boxed.click(&params, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
