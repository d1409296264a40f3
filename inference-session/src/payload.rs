//! Inner (plaintext) payloads shared by both bindings.
//!
//! Builds the JSON request body for each exchange kind, with config
//! defaults applied, and parses the host's inner frames and result bodies.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::ImageLimits;
use crate::error::{map_remote_error, ProtocolError};
use crate::types::{
    BillingMetrics, ExchangeKind, GenerationResult, ProviderInfo, RequestSpec, ResultContent,
    SafetyVerdict, VectorMatch,
};

/// Per-call values merged into the request body.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub request_id: &'a str,
    pub chain_id: u64,
    /// Diffusion steps used when the request leaves them unset
    pub default_steps: u32,
    pub image: &'a ImageLimits,
}

/// Build the inner request body for `spec`.
pub fn build_request(spec: &RequestSpec, ctx: &RequestContext<'_>) -> Result<Value, ProtocolError> {
    let body = match spec {
        RequestSpec::Chat(r) => serde_json::to_value(r),
        RequestSpec::Image(r) => serde_json::to_value(r),
        RequestSpec::VectorSearch(r) => serde_json::to_value(r),
        RequestSpec::VectorUpload(r) => serde_json::to_value(r),
    }
    .map_err(|e| ProtocolError::EncryptionFailed(format!("Failed to encode request: {e}")))?;

    let mut body = match body {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    body.insert("action".into(), Value::from(spec.kind().action()));
    body.insert("id".into(), Value::from(ctx.request_id));
    body.insert("chainId".into(), Value::from(ctx.chain_id));

    match spec.kind() {
        ExchangeKind::ChatStream => {
            body.insert("stream".into(), Value::Bool(true));
        }
        ExchangeKind::ImageGeneration => {
            body.entry("size")
                .or_insert_with(|| Value::from(ctx.image.default_size.as_str()));
            body.entry("steps")
                .or_insert_with(|| Value::from(ctx.default_steps));
            body.entry("safetyLevel")
                .or_insert_with(|| Value::from(ctx.image.default_safety_level.as_str()));
        }
        ExchangeKind::VectorSearch | ExchangeKind::VectorUpload => {}
    }

    Ok(Value::Object(body))
}

/// A decrypted frame from the host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InnerFrame {
    /// Partial output of a streaming exchange
    #[serde(alias = "token", alias = "chunk")]
    StreamChunk {
        #[serde(default)]
        id: Option<String>,
        content: String,
    },
    /// Progress of a long-running generation
    Progress {
        #[serde(default)]
        id: Option<String>,
        step: u32,
        total: u32,
    },
    /// End of a streamed exchange
    StreamEnd {
        #[serde(default)]
        id: Option<String>,
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    /// Terminal success
    #[serde(alias = "response")]
    Result {
        #[serde(default)]
        id: Option<String>,
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    /// Terminal remote failure
    Error {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        error_code: Option<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        retry_after: Option<f64>,
    },
}

impl InnerFrame {
    pub fn parse(plaintext: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(plaintext)
            .map_err(|e| ProtocolError::EncryptionFailed(format!("Malformed inner frame: {e}")))
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::StreamChunk { id, .. }
            | Self::Progress { id, .. }
            | Self::StreamEnd { id, .. }
            | Self::Result { id, .. }
            | Self::Error { id, .. } => id.as_deref(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StreamEnd { .. } | Self::Result { .. } | Self::Error { .. })
    }

    /// Whether a request of `kind` can consume this frame.
    pub fn accepted_by(&self, kind: ExchangeKind) -> bool {
        match self {
            Self::StreamChunk { .. } | Self::StreamEnd { .. } => kind.is_streaming(),
            Self::Progress { .. } => kind == ExchangeKind::ImageGeneration,
            Self::Result { .. } | Self::Error { .. } => true,
        }
    }

    /// Map an `error` frame into the local taxonomy.
    pub fn into_error(self) -> Option<ProtocolError> {
        match self {
            Self::Error {
                error_code,
                error,
                retry_after,
                ..
            } => Some(map_remote_error(
                error_code.as_deref(),
                error.as_deref(),
                retry_after,
            )),
            _ => None,
        }
    }
}

fn malformed(message: impl Into<String>) -> ProtocolError {
    ProtocolError::GenerationFailed {
        code: Some("MALFORMED_RESULT".into()),
        message: message.into(),
        retry_after: None,
    }
}

fn field<'a>(body: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| body.get(*name))
}

fn decode<T: for<'de> Deserialize<'de>>(value: &Value) -> Option<T> {
    serde_json::from_value(value.clone()).ok()
}

fn parse_billing(body: &Map<String, Value>) -> Option<BillingMetrics> {
    if let Some(billing) = field(body, &["billing", "usage"]) {
        return decode(billing);
    }
    let has_metrics = ["tokensUsed", "tokens_used", "generationUnits", "generation_units"]
        .iter()
        .any(|k| body.contains_key(*k));
    if has_metrics {
        decode(&Value::Object(body.clone()))
    } else {
        None
    }
}

fn parse_provider(body: &Map<String, Value>) -> Option<ProviderInfo> {
    if let Some(provider) = body.get("provider") {
        return decode(provider);
    }
    let host_address = field(body, &["hostAddress", "host_address"])
        .and_then(Value::as_str)
        .map(String::from);
    let model = body.get("model").and_then(Value::as_str).map(String::from);
    if host_address.is_none() && model.is_none() {
        None
    } else {
        Some(ProviderInfo { host_address, model })
    }
}

fn parse_size(size: &str) -> Option<(u32, u32)> {
    let (w, h) = size.split_once('x')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Build a [`GenerationResult`] from a terminal body.
///
/// `streamed` is the aggregated token buffer for streaming kinds.
pub fn parse_result(
    kind: ExchangeKind,
    request_id: &str,
    body: &Map<String, Value>,
    streamed: &str,
) -> Result<GenerationResult, ProtocolError> {
    let content = match kind {
        ExchangeKind::ChatStream => {
            let text = if streamed.is_empty() {
                field(body, &["content", "response", "text"])
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            } else {
                streamed.to_string()
            };
            ResultContent::Text { text }
        }
        ExchangeKind::ImageGeneration => {
            let image = field(body, &["image", "imageData", "image_data"])
                .and_then(Value::as_str)
                .ok_or_else(|| malformed("result is missing image data"))?
                .to_string();
            let from_size = body.get("size").and_then(Value::as_str).and_then(parse_size);
            let width = field(body, &["width"])
                .and_then(Value::as_u64)
                .map(|w| w as u32)
                .or(from_size.map(|(w, _)| w))
                .unwrap_or(0);
            let height = field(body, &["height"])
                .and_then(Value::as_u64)
                .map(|h| h as u32)
                .or(from_size.map(|(_, h)| h))
                .unwrap_or(0);
            let seed = body.get("seed").and_then(Value::as_u64);
            ResultContent::Image {
                image,
                width,
                height,
                seed,
            }
        }
        ExchangeKind::VectorSearch => {
            let matches: Vec<VectorMatch> = field(body, &["matches", "results"])
                .and_then(decode)
                .ok_or_else(|| malformed("result is missing matches"))?;
            ResultContent::Matches { matches }
        }
        ExchangeKind::VectorUpload => {
            let uploaded = field(body, &["uploaded", "count"])
                .and_then(Value::as_u64)
                .ok_or_else(|| malformed("result is missing upload count"))?
                as u32;
            let rejected = body
                .get("rejected")
                .and_then(decode::<Vec<String>>)
                .unwrap_or_default();
            ResultContent::Upload { uploaded, rejected }
        }
    };

    Ok(GenerationResult {
        request_id: request_id.to_string(),
        kind,
        content,
        safety: body.get("safety").and_then(decode::<SafetyVerdict>),
        billing: parse_billing(body),
        provider: parse_provider(body),
    })
}
