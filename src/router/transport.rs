//! Delivery of action requests to downstream systems.

use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use super::EndpointConfig;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Timeouts and connection failures. Retried.
    #[error("{0}")]
    Network(String),

    /// Anything else. Not retried.
    #[error("{0}")]
    Unexpected(String),
}

/// What a downstream system answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransportResponse {
    pub fn ok(status_code: u16, data: Value) -> Self {
        Self {
            success: true,
            status_code: Some(status_code),
            data: Some(data),
            error: None,
        }
    }

    pub fn rejected(status_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait ActionTransport: Send + Sync {
    /// Deliver `request` to `endpoint` (already resolved, no placeholders).
    async fn send(
        &self,
        endpoint: &str,
        config: &EndpointConfig,
        request: &Value,
    ) -> Result<TransportResponse, TransportError>;
}

/// Answers locally with configurable latency and failure odds.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    latency: bool,
}

impl SimulatedTransport {
    pub fn new(latency: bool) -> Self {
        Self { latency }
    }
}

enum Outcome {
    Success(u32),
    Timeout,
    Failure(u16, &'static str),
}

const FAILURES: [Option<(u16, &str)>; 4] = [
    None,
    Some((
        500,
        "Internal Server Error: The server encountered an unexpected condition.",
    )),
    Some((
        400,
        "Validation Error: The request data did not pass validation.",
    )),
    Some((401, "Authentication Error: Invalid or expired credentials.")),
];

#[async_trait]
impl ActionTransport for SimulatedTransport {
    async fn send(
        &self,
        _endpoint: &str,
        config: &EndpointConfig,
        request: &Value,
    ) -> Result<TransportResponse, TransportError> {
        let timeout = Duration::try_from_secs_f64(config.timeout_seconds)
            .map_err(|e| TransportError::Unexpected(format!("Invalid timeout: {}", e)))?
            .as_secs_f64();
        // the rng is not Send, so draw everything before sleeping
        let (delay, outcome) = {
            let mut rng = rand::thread_rng();
            let delay = if timeout > 0.1 {
                rng.gen_range(0.1..timeout)
            } else {
                timeout
            };
            let outcome = if rng.gen::<f64>() < config.success_rate {
                Outcome::Success(rng.gen_range(100_000..=999_999))
            } else {
                match FAILURES.choose(&mut rng).copied().flatten() {
                    Some((code, message)) => Outcome::Failure(code, message),
                    None => Outcome::Timeout,
                }
            };
            (delay, outcome)
        };

        if self.latency && delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }

        match outcome {
            Outcome::Success(id) => Ok(TransportResponse::ok(
                200,
                json!({
                    "message": format!(
                        "Successfully processed {} for {}",
                        request["action_type"].as_str().unwrap_or("action"),
                        request["target"].as_str().unwrap_or("target"),
                    ),
                    "id": format!("ACT-{}", id),
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                }),
            )),
            Outcome::Timeout => Err(TransportError::Network(
                "Simulated timeout error".to_string(),
            )),
            Outcome::Failure(code, message) => Ok(TransportResponse::rejected(Some(code), message)),
        }
    }
}

/// Sends requests over HTTP to `base_url + endpoint`.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActionTransport for HttpTransport {
    async fn send(
        &self,
        endpoint: &str,
        config: &EndpointConfig,
        request: &Value,
    ) -> Result<TransportResponse, TransportError> {
        let method = reqwest::Method::from_bytes(config.method.to_uppercase().as_bytes())
            .map_err(|e| TransportError::Unexpected(format!("Invalid method {}: {}", config.method, e)))?;
        let timeout = Duration::try_from_secs_f64(config.timeout_seconds)
            .map_err(|e| TransportError::Unexpected(format!("Invalid timeout: {}", e)))?;
        let url = format!("{}{}", config.base_url.trim_end_matches('/'), endpoint);

        let response = self
            .client
            .request(method, &url)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_reqwest_error)?;

        if status.as_u16() < 400 {
            let data = serde_json::from_str(&text).unwrap_or(Value::String(text));
            Ok(TransportResponse::ok(status.as_u16(), data))
        } else {
            Ok(TransportResponse::rejected(Some(status.as_u16()), text))
        }
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        TransportError::Network(e.to_string())
    } else {
        TransportError::Unexpected(e.to_string())
    }
}
