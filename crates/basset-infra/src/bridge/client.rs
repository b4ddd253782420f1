//! BridgeCapabilityProvider -- concrete [`CapabilityProvider`] over HTTP.
//!
//! Every capability call becomes one command envelope POSTed to the bridge.
//! Transport failures, HTTP status codes and bridge-reported error strings
//! are all mapped onto [`ErrorKind`] so the retry policy can tell transient
//! failures from permanent ones.

use std::time::Duration;

use basset_core::provider::CapabilityProvider;
use basset_core::workflow::retry::classify_message;
use basset_types::error::{ErrorKind, StepError};
use basset_types::workflow::{
    ClickParams, ExtractParams, FillParams, NavigateParams, ScreenshotParams,
};
use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::types::{BridgeCommand, BridgeResponse, CommandType};

/// Browser capability provider speaking the bridge command protocol.
pub struct BridgeCapabilityProvider {
    client: reqwest::Client,
    base_url: String,
}

impl BridgeCapabilityProvider {
    /// Path commands are POSTed to.
    const COMMAND_PATH: &'static str = "/command";

    /// Create a provider for the bridge at `base_url` (e.g. `http://127.0.0.1:9222`).
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send one command and unwrap its result.
    ///
    /// `timeout` bounds the whole HTTP exchange and is forwarded to the
    /// bridge as `timeout_ms`.
    async fn send(
        &self,
        command_type: CommandType,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        let command = BridgeCommand {
            command_id: Uuid::now_v7(),
            command_type,
            params: with_timeout(params, timeout),
        };
        let url = format!("{}{}", self.base_url, Self::COMMAND_PATH);

        tracing::debug!(
            command_id = %command.command_id,
            command = command_type.as_str(),
            "sending bridge command"
        );

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&command)
            .send()
            .await
            .map_err(|e| transport_error(command_type, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(command_type, status, &body));
        }

        let reply: BridgeResponse = response
            .json()
            .await
            .map_err(|e| transport_error(command_type, e))?;

        if reply.command_id != command.command_id {
            return Err(StepError::provider(format!(
                "bridge answered command {} with response for {}",
                command.command_id, reply.command_id
            )));
        }

        if reply.success {
            Ok(reply.result.unwrap_or(Value::Null))
        } else {
            let message = reply
                .error
                .unwrap_or_else(|| format!("bridge {} command failed", command_type.as_str()));
            tracing::debug!(
                command_id = %command.command_id,
                command = command_type.as_str(),
                error = message.as_str(),
                "bridge command failed"
            );
            Err(StepError::new(classify_message(&message), message))
        }
    }
}

impl CapabilityProvider for BridgeCapabilityProvider {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn navigate(
        &self,
        params: &NavigateParams,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        self.send(CommandType::Navigate, to_params(params)?, timeout).await
    }

    async fn click(&self, params: &ClickParams, timeout: Duration) -> Result<Value, StepError> {
        self.send(CommandType::Click, to_params(params)?, timeout).await
    }

    async fn fill(&self, params: &FillParams, timeout: Duration) -> Result<Value, StepError> {
        self.send(CommandType::FillForm, to_params(params)?, timeout).await
    }

    async fn extract(&self, params: &ExtractParams, timeout: Duration) -> Result<Value, StepError> {
        self.send(CommandType::GetContent, to_params(params)?, timeout).await
    }

    async fn screenshot(
        &self,
        params: &ScreenshotParams,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        self.send(CommandType::Screenshot, to_params(params)?, timeout).await
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<Value, StepError> {
        self.send(CommandType::WaitForElement, json!({ "selector": selector }), timeout)
            .await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn to_params<T: Serialize>(params: &T) -> Result<Value, StepError> {
    serde_json::to_value(params).map_err(|e| StepError::internal(e.to_string()))
}

fn with_timeout(mut params: Value, timeout: Duration) -> Value {
    if let Value::Object(map) = &mut params {
        map.insert("timeout_ms".to_string(), json!(timeout.as_millis() as u64));
    }
    params
}

fn transport_error(command_type: CommandType, err: reqwest::Error) -> StepError {
    let message = format!("bridge {} request failed: {err}", command_type.as_str());
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_decode() {
        ErrorKind::Provider
    } else {
        ErrorKind::Network
    };
    StepError::new(kind, message)
}

fn status_error(command_type: CommandType, status: reqwest::StatusCode, body: &str) -> StepError {
    let message = format!(
        "bridge {} returned HTTP {status}: {body}",
        command_type.as_str()
    );
    let kind = match status.as_u16() {
        429 => ErrorKind::Quota,
        401 | 403 => ErrorKind::Permission,
        408 | 504 => ErrorKind::Timeout,
        500..=599 => ErrorKind::Network,
        _ => ErrorKind::Provider,
    };
    StepError::new(kind, message)
}
