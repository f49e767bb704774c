//! Stage worker seam: the external services that produce each section.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::config::WorkerConfig;
use crate::error::{ApiError, ErrorCategory, StageError};
use crate::stage::StageSpec;
use crate::types::{GenerationRequest, StageId};

/// Everything a worker receives for one stage invocation.
#[derive(Debug, Clone, Serialize)]
pub struct StageContext {
    pub generation_key: String,
    pub stage: StageId,
    pub spec: &'static StageSpec,
    pub request: GenerationRequest,
    /// Whether this call should be web-grounded.
    pub use_grounding: bool,
    /// Launch-date filter for grounded retrieval, when the profile forwards it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_date: Option<NaiveDate>,
    /// Payloads of completed upstream stages, direct and transitive.
    pub dependencies: BTreeMap<StageId, Value>,
    /// 1 for the first call, incremented on every retry.
    pub attempt: u32,
}

impl StageContext {
    pub fn dependency(&self, stage: StageId) -> Option<&Value> {
        self.dependencies.get(&stage)
    }
}

/// Produces the payload for one stage.
///
/// Timeouts are the worker's responsibility and should surface as `network` errors.
#[async_trait]
pub trait StageWorker: Send + Sync {
    async fn invoke(&self, stage: StageId, context: &StageContext) -> Result<Value, StageError>;
}

const WORKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Calls `POST {base_url}/stages/{stage}` with the JSON stage context.
pub struct HttpStageWorker {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpStageWorker {
    pub fn new(config: &WorkerConfig) -> Result<Self, ApiError> {
        if config.base_url.trim().is_empty() {
            return Err(ApiError::ConfigError(
                "worker.base_url must be set to use the HTTP stage worker".to_string(),
            ));
        }
        let client = Client::builder()
            .connect_timeout(WORKER_CONNECT_TIMEOUT)
            .timeout(config.timeout())
            .build()
            .map_err(|e| ApiError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn endpoint(&self, stage: StageId) -> String {
        format!("{}/stages/{}", self.base_url, stage)
    }
}

#[async_trait]
impl StageWorker for HttpStageWorker {
    async fn invoke(&self, stage: StageId, context: &StageContext) -> Result<Value, StageError> {
        let url = self.endpoint(stage);
        debug!(stage = %stage, attempt = context.attempt, url = %url, "Invoking stage worker");

        let mut request = self.client.post(&url).json(context);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request.send().await.map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_status(status.as_u16(), retry_after, &body));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| StageError::external(format!("Failed to parse stage response: {}", e)))
    }
}

/// Maps a non-success HTTP status to a classified stage error.
pub fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> StageError {
    let code = format!("E_HTTP_{}", status);
    match status {
        400 | 422 => StageError::new(
            ErrorCategory::Validation,
            format!("Stage request rejected: {}", body),
        )
        .with_code(code),
        401 => StageError::new(
            ErrorCategory::Authentication,
            format!("Authentication failed: {}", body),
        )
        .with_code(code),
        403 => StageError::new(
            ErrorCategory::Authorization,
            format!("Not authorized: {}", body),
        )
        .with_code(code),
        429 => StageError::rate_limited(format!("Rate limit exceeded: {}", body), retry_after)
            .with_code(code),
        500..=599 => {
            StageError::external(format!("Stage service error {}: {}", status, body)).with_code(code)
        }
        _ => StageError::external(format!("Request failed with status {}: {}", status, body))
            .with_code(code)
            .mark_non_retryable(),
    }
}

/// Parses a `Retry-After` header given in whole seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn map_transport_error(error: reqwest::Error) -> StageError {
    if error.is_timeout() {
        StageError::network(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        StageError::network(format!("Connection error: {}", error))
    } else if error.is_request() {
        StageError::network(format!("Request error: {}", error))
    } else {
        StageError::external(format!("HTTP error: {}", error))
    }
}
