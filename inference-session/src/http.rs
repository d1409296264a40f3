//! Plain HTTP fallback binding.
//!
//! Same request shapes and validation as the encrypted channel, sent as
//! JSON over HTTPS. No session, no counter, no correlator: one request, one
//! response.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::{ChargePolicy, EngineConfig};
use crate::correlator::Outcome;
use crate::error::{retry_hint, ProtocolError, RemoteErrorCode};
use crate::payload::{build_request, parse_result, RequestContext};
use crate::rate_limit::RateLimiter;
use crate::types::RequestSpec;
use crate::validator::Validator;

/// Per-call options for the HTTP binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpOptions {
    /// Base URL of the host, e.g. `https://host.example:8080`
    pub host_url: String,
}

impl HttpOptions {
    pub fn new(host_url: impl Into<String>) -> Self {
        Self {
            host_url: host_url.into(),
        }
    }
}

/// Error body a host returns with a non-2xx status.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default, alias = "errorCode")]
    error_code: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorBody {
    fn message(&self, status: StatusCode) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| format!("HTTP {status}"))
    }
}

/// HTTP fallback binding.
pub struct HttpBinding {
    client: Client,
    config: Arc<EngineConfig>,
    validator: Arc<Validator>,
    limiter: Arc<RateLimiter>,
    chain_id: u64,
}

impl HttpBinding {
    /// Create a binding sharing the given validator and limiter.
    pub fn new(
        config: Arc<EngineConfig>,
        validator: Arc<Validator>,
        limiter: Arc<RateLimiter>,
        chain_id: u64,
    ) -> Result<Self, ProtocolError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.http.request_timeout_ms))
            .build()
            .map_err(|e| ProtocolError::generation(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            validator,
            limiter,
            chain_id,
        })
    }

    /// Standalone binding with its own validator and limiter.
    pub fn from_config(config: EngineConfig, chain_id: u64) -> Result<Self, ProtocolError> {
        let limiter = Arc::new(RateLimiter::new(&config.rate_limits));
        let validator = Arc::new(Validator::new(config.clone()));
        Self::new(Arc::new(config), validator, limiter, chain_id)
    }

    fn url(&self, options: &HttpOptions, request: &RequestSpec) -> String {
        format!(
            "{}{}",
            options.host_url.trim_end_matches('/'),
            self.config.http.path_for(request.kind())
        )
    }

    /// Submit one request and map the response.
    pub async fn submit(&self, request: &RequestSpec, options: &HttpOptions) -> Outcome {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.submit_as(&request_id, request, options).await
    }

    /// Submit under a caller-chosen request id.
    pub async fn submit_as(&self, request_id: &str, request: &RequestSpec, options: &HttpOptions) -> Outcome {
        self.validator.validate(request)?;

        let kind = request.kind();
        let category = kind.rate_category();
        self.limiter.check(category)?;
        let charge = self.limiter.charge_policy();
        if charge == ChargePolicy::OnSend {
            self.limiter.record_admission(category);
        }

        let mut body = build_request(
            request,
            &RequestContext {
                request_id,
                chain_id: self.chain_id,
                default_steps: self.config.channels.http_default_steps,
                image: &self.config.image,
            },
        )?;
        // One response per request on this binding
        if let Value::Object(map) = &mut body {
            map.remove("stream");
        }

        let url = self.url(options, request);
        debug!(request_id = %request_id, ?kind, url = %url, "HTTP submit");

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                ProtocolError::Timeout {
                    after: Duration::from_millis(self.config.http.request_timeout_ms),
                }
            } else {
                warn!(request_id = %request_id, "HTTP request failed: {}", e);
                ProtocolError::GenerationFailed {
                    code: Some("NETWORK_ERROR".into()),
                    message: e.to_string(),
                    retry_after: None,
                }
            }
        })?;

        let outcome = self.read_response(request_id, request, response).await;
        if outcome.is_ok() && charge == ChargePolicy::OnSuccess {
            self.limiter.record_admission(category);
        }
        outcome
    }

    async fn read_response(&self, request_id: &str, request: &RequestSpec, response: Response) -> Outcome {
        let status = response.status();

        if status.is_success() {
            let body: Map<String, Value> = response.json().await.map_err(|e| ProtocolError::GenerationFailed {
                code: Some("MALFORMED_RESULT".into()),
                message: format!("Invalid response body: {e}"),
                retry_after: None,
            })?;
            return parse_result(request.kind(), request_id, &body, "");
        }

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .and_then(retry_hint);

        let text = response.text().await.unwrap_or_default();
        let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
        let message = body.message(status);

        warn!(request_id = %request_id, status = status.as_u16(), "Host returned error: {}", message);

        Err(match status {
            StatusCode::BAD_REQUEST => match body.error_code.as_deref() {
                Some(code) if RemoteErrorCode::parse(code).is_safety_related() => {
                    ProtocolError::PromptBlocked {
                        code: code.to_string(),
                        message,
                    }
                }
                _ => ProtocolError::validation("request", message),
            },
            StatusCode::TOO_MANY_REQUESTS => ProtocolError::RateLimitExceeded {
                category: request.kind().rate_category(),
                retry_after: retry_after.unwrap_or(Duration::from_secs(1)),
            },
            StatusCode::SERVICE_UNAVAILABLE => ProtocolError::ServiceUnavailable(message),
            _ => ProtocolError::GenerationFailed {
                code: body
                    .error_code
                    .or_else(|| Some(format!("HTTP_{}", status.as_u16()))),
                message,
                retry_after,
            },
        })
    }
}
