//! HTTP client for a remote SMC decoding service.
//!
//! The service owns the language model, the grammar parsers and the particle
//! filter. One decode is one `POST {base_url}/smc`; the response carries the
//! posterior and, optionally, the engine's record for the run.

use crate::client::{
    DecodeParams, DecodeRequest, DecodedPosterior, DecodingEngine, EngineOptions, LanguageModel,
    Prompt,
};
use crate::models::{Config, CtrlError, Result};
use crate::sampler::{Critic, TokenSampler};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Request body, borrowing from the [`DecodeRequest`].
#[derive(Debug, Serialize)]
struct SmcRequest<'a> {
    lm: &'a LanguageModel,
    prompt: &'a Prompt,
    sampler: &'a TokenSampler,
    #[serde(skip_serializing_if = "Option::is_none")]
    critic: Option<&'a Critic>,
    #[serde(flatten)]
    params: &'a DecodeParams,
    options: EngineOptions,
}

impl<'a> From<&'a DecodeRequest> for SmcRequest<'a> {
    fn from(request: &'a DecodeRequest) -> Self {
        Self {
            lm: &request.lm,
            prompt: &request.prompt,
            sampler: &request.sampler,
            critic: request.critic.as_ref(),
            params: &request.params,
            options: request.options,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SmcResponse {
    decoded_posterior: DecodedPosterior,
    #[serde(default)]
    record: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Extract the message from an `{"error": {"message": ...}}` body, falling
/// back to the raw text.
fn error_message(body: String) -> String {
    match serde_json::from_str::<ApiErrorResponse>(&body) {
        Ok(api_error) => api_error.error.message,
        Err(_) => body,
    }
}

/// Write the engine record next to the other run artifacts.
async fn write_record(path: &Path, record: &Value) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CtrlError::io(format!("creating {}", parent.display()), e))?;
    }

    let json = serde_json::to_vec_pretty(record)
        .map_err(|e| CtrlError::Internal(format!("serializing record: {e}")))?;
    let temp_path = path.with_extension("json.tmp");
    tokio::fs::write(&temp_path, json)
        .await
        .map_err(|e| CtrlError::io(format!("writing {}", temp_path.display()), e))?;
    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| CtrlError::io(format!("renaming record to {}", path.display()), e))?;
    Ok(())
}

/// Decoding engine reached over HTTP.
///
/// Features:
/// - Retry with exponential backoff on network errors, timeouts and 5xx
/// - `retry-after` honoured on 429
/// - Bearer auth when an API key is configured
pub struct HttpEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    max_retries: u32,
}

impl HttpEngine {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout_secs: u64,
        max_retries: u32,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(CtrlError::Network)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            timeout,
            max_retries: max_retries.max(1),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.engine.base_url.clone(),
            config.resolve_api_key(),
            config.engine.timeout_secs,
            config.engine.max_retries,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|_| CtrlError::InvalidInput("API key is not a valid header value".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn backoff(attempt: u32) -> Duration {
        Duration::from_secs(2u64.pow(attempt))
    }

    /// Send one decode request, retrying transient failures.
    pub async fn smc(&self, request: &DecodeRequest) -> Result<DecodedPosterior> {
        let start = Instant::now();
        let url = format!("{}/smc", self.base_url);
        let body = SmcRequest::from(request);
        let headers = self.headers()?;
        let mut last_error: Option<CtrlError> = None;

        for attempt in 0..self.max_retries {
            let is_last = attempt + 1 == self.max_retries;

            let response = match self
                .client
                .post(&url)
                .headers(headers.clone())
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(if e.is_timeout() {
                        CtrlError::Timeout(self.timeout)
                    } else {
                        CtrlError::Network(e)
                    });
                    if !is_last {
                        let backoff = Self::backoff(attempt);
                        debug!(
                            attempt = attempt,
                            backoff_secs = backoff.as_secs(),
                            "Retrying after network error"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    continue;
                }
            };

            let status = response.status().as_u16();

            if status == 429 {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<f64>().ok())
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .unwrap_or(1.0);

                last_error = Some(CtrlError::EngineApi {
                    status,
                    message: format!("rate limited, retry after {retry_after}s"),
                });
                if !is_last {
                    debug!(
                        attempt = attempt,
                        retry_after_secs = retry_after,
                        "Engine busy, waiting"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(retry_after)).await;
                }
                continue;
            }

            if !response.status().is_success() {
                let message = error_message(response.text().await.unwrap_or_default());
                let error = CtrlError::EngineApi { status, message };

                if !error.is_retryable() {
                    return Err(error);
                }
                last_error = Some(error);
                if !is_last {
                    let backoff = Self::backoff(attempt);
                    warn!(
                        status = status,
                        attempt = attempt,
                        backoff_secs = backoff.as_secs(),
                        "Engine error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                continue;
            }

            let body: SmcResponse = response.json().await.map_err(|e| {
                CtrlError::EngineProtocol(format!("failed to parse /smc response: {e}"))
            })?;

            if let Some(record) = &body.record {
                write_record(&request.record_path, record).await?;
            }

            debug!(
                sequences = body.decoded_posterior.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Decode complete"
            );
            return Ok(body.decoded_posterior);
        }

        Err(match last_error {
            Some(error) if self.max_retries > 1 => CtrlError::MaxRetriesExceeded {
                attempts: self.max_retries,
                last_error: error.to_string(),
            },
            Some(error) => error,
            None => CtrlError::MaxRetriesExceeded {
                attempts: self.max_retries,
                last_error: "Unknown error".to_string(),
            },
        })
    }

    /// Health check: ping the `/health` endpoint.
    pub async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let url = format!("{}/health", self.base_url);
        let request = match self.headers() {
            Ok(headers) => self.client.get(&url).headers(headers),
            Err(e) => {
                return HealthCheckResult {
                    endpoint: self.base_url.clone(),
                    status: HealthStatus::Unhealthy,
                    latency_ms: None,
                    error: Some(e.to_string()),
                };
            }
        };

        match request.timeout(Duration::from_secs(10)).send().await {
            Ok(response) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                let healthy = response.status().is_success();
                HealthCheckResult {
                    endpoint: self.base_url.clone(),
                    status: if healthy {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Unhealthy
                    },
                    latency_ms: Some(latency_ms),
                    error: (!healthy).then(|| format!("HTTP {}", response.status().as_u16())),
                }
            }
            Err(e) => HealthCheckResult {
                endpoint: self.base_url.clone(),
                status: HealthStatus::Unreachable,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }
}

impl DecodingEngine for HttpEngine {
    fn decode(
        &self,
        request: DecodeRequest,
    ) -> impl Future<Output = Result<DecodedPosterior>> + Send {
        async move { self.smc(&request).await }
    }
}

/// Health check result.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub endpoint: String,
    pub status: HealthStatus,
    /// Latency in milliseconds (if reachable)
    pub latency_ms: Option<u64>,
    /// Error message (if unhealthy or unreachable)
    pub error: Option<String>,
}

/// Health status of the engine endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unreachable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Message;
    use crate::sampler::{ExpensivePotential, FastPotential};
    use crate::strategy::Weighting;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn request(critic: Option<Critic>) -> DecodeRequest {
        let lm = Arc::new(LanguageModel::new("gpt2"));
        DecodeRequest {
            critic,
            prompt: Prompt::Chat(vec![Message::user("List singers")]),
            sampler: Arc::new(
                TokenSampler::eager(FastPotential::bool_cfg("start: /SELECT .+/"), Weighting::Proper)
                    .unwrap(),
            ),
            params: DecodeParams {
                n_particles: 10,
                ess_threshold: 0.5,
                max_tokens: 100,
                resampling_method: None,
            },
            record_path: PathBuf::from("out/q1-0-record.json"),
            options: EngineOptions::default(),
            lm,
        }
    }

    #[test]
    fn test_request_body_shape() {
        let request = request(None);
        let json = serde_json::to_value(SmcRequest::from(&request)).unwrap();

        assert_eq!(json["lm"]["name"], "gpt2");
        assert_eq!(json["n_particles"], 10);
        assert_eq!(json["max_tokens"], 100);
        assert_eq!(json["sampler"]["kind"], "eager");
        assert_eq!(json["sampler"]["weighting"], "proper");
        assert_eq!(json["prompt"]["format"], "chat");
        assert!(json.get("critic").is_none());
        assert!(json.get("resampling_method").is_none());
        assert!(json.get("record_path").is_none());
    }

    #[test]
    fn test_request_body_includes_critic() {
        let lm = LanguageModel::new("gpt2");
        let critic = ExpensivePotential::new("sql_exec").coerce(&lm);
        let request = request(Some(critic));
        let json = serde_json::to_value(SmcRequest::from(&request)).unwrap();
        assert_eq!(json["critic"]["potential"]["kind"], "sql_exec");
        assert_eq!(json["critic"]["coercion"], "byte_join");
    }

    #[test]
    fn test_response_parsing() {
        let body: SmcResponse = serde_json::from_str(
            r#"{"decoded_posterior": {"SELECT name FROM singer": 0.9}, "record": {"steps": 3}}"#,
        )
        .unwrap();
        assert_eq!(body.decoded_posterior.len(), 1);
        assert_eq!(body.record.unwrap()["steps"], 3);

        let bare: SmcResponse = serde_json::from_str(r#"{"decoded_posterior": {}}"#).unwrap();
        assert!(bare.decoded_posterior.is_empty());
        assert!(bare.record.is_none());
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"error": {"message": "model not loaded"}}"#.to_string()),
            "model not loaded"
        );
        assert_eq!(error_message("Bad Gateway".to_string()), "Bad Gateway");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let engine = HttpEngine::new("http://localhost:8000/", None, 5, 0).unwrap();
        assert_eq!(engine.base_url(), "http://localhost:8000");
        assert_eq!(engine.max_retries, 1);
    }

    #[tokio::test]
    async fn test_write_record_atomic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("q1-0-record.json");
        write_record(&path, &serde_json::json!({"history": [1, 2]}))
            .await
            .unwrap();

        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["history"][1], 2);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_unreachable_engine_reports_network_error() {
        let engine = HttpEngine::new("http://127.0.0.1:9", None, 2, 1).unwrap();
        let err = engine.decode(request(None)).await.unwrap_err();
        assert!(matches!(err, CtrlError::Network(_) | CtrlError::Timeout(_)));
        assert_eq!(engine.health_check().await.status, HealthStatus::Unreachable);
    }
}
