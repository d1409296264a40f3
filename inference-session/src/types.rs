//! Request and result types for the four exchange kinds.
//!
//! Field names on the inner wire payload follow the host protocol
//! (`safetyLevel`, `chainId`), so these types serialize in camelCase.

use serde::{Deserialize, Serialize};

#[cfg(feature = "typescript")]
use ts_rs::TS;

/// Kind of logical exchange carried over a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    ChatStream,
    ImageGeneration,
    VectorSearch,
    VectorUpload,
}

impl ExchangeKind {
    /// Value of the `action` field in the inner request payload.
    pub fn action(&self) -> &'static str {
        match self {
            Self::ChatStream => "prompt",
            Self::ImageGeneration => "image_generation",
            Self::VectorSearch => "vector_search",
            Self::VectorUpload => "vector_upload",
        }
    }

    /// Rate-limit bucket this kind is charged against.
    pub fn rate_category(&self) -> RateCategory {
        match self {
            Self::ChatStream => RateCategory::Chat,
            Self::ImageGeneration => RateCategory::Image,
            Self::VectorSearch | Self::VectorUpload => RateCategory::Vector,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::ChatStream)
    }
}

/// Admission-control bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum RateCategory {
    Chat,
    Image,
    Vector,
    /// Limit imposed by the remote host rather than locally.
    Remote,
}

/// A chat turn streamed token by token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }
}

/// Image generation parameters. Unset options are filled from config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct ImageRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "guidanceScale")]
    pub guidance: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_guidance(mut self, guidance: f32) -> Self {
        self.guidance = Some(guidance);
        self
    }

    pub fn with_safety_level(mut self, level: impl Into<String>) -> Self {
        self.safety_level = Some(level.into());
        self
    }
}

/// Nearest-neighbour search over the host's vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct VectorSearchRequest {
    pub vector: Vec<f32>,
    pub k: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
}

impl VectorSearchRequest {
    pub fn new(vector: Vec<f32>, k: u32) -> Self {
        Self {
            vector,
            k,
            threshold: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

/// One vector to upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct VectorEntry {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    #[cfg_attr(feature = "typescript", ts(type = "unknown"))]
    pub metadata: serde_json::Value,
}

impl VectorEntry {
    pub fn new(id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            vector,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Batch upload into the host's vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct VectorUploadRequest {
    pub vectors: Vec<VectorEntry>,
}

impl VectorUploadRequest {
    pub fn new(vectors: Vec<VectorEntry>) -> Self {
        Self { vectors }
    }
}

/// A request to submit on either binding.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestSpec {
    Chat(ChatRequest),
    Image(ImageRequest),
    VectorSearch(VectorSearchRequest),
    VectorUpload(VectorUploadRequest),
}

impl RequestSpec {
    pub fn kind(&self) -> ExchangeKind {
        match self {
            Self::Chat(_) => ExchangeKind::ChatStream,
            Self::Image(_) => ExchangeKind::ImageGeneration,
            Self::VectorSearch(_) => ExchangeKind::VectorSearch,
            Self::VectorUpload(_) => ExchangeKind::VectorUpload,
        }
    }
}

impl From<ChatRequest> for RequestSpec {
    fn from(r: ChatRequest) -> Self {
        Self::Chat(r)
    }
}

impl From<ImageRequest> for RequestSpec {
    fn from(r: ImageRequest) -> Self {
        Self::Image(r)
    }
}

impl From<VectorSearchRequest> for RequestSpec {
    fn from(r: VectorSearchRequest) -> Self {
        Self::VectorSearch(r)
    }
}

impl From<VectorUploadRequest> for RequestSpec {
    fn from(r: VectorUploadRequest) -> Self {
        Self::VectorUpload(r)
    }
}

/// Safety classifier verdict reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SafetyVerdict {
    #[serde(default, alias = "prompt_safe")]
    pub prompt_safe: bool,
    #[serde(default, alias = "output_safe")]
    pub output_safe: bool,
    #[serde(default, alias = "safety_level", skip_serializing_if = "Option::is_none")]
    pub safety_level: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

/// Per-exchange billing metrics for pay-per-token settlement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct BillingMetrics {
    #[serde(default, alias = "tokens_used")]
    pub tokens_used: u64,
    #[serde(default, alias = "input_tokens")]
    pub input_tokens: u64,
    #[serde(default, alias = "output_tokens")]
    pub output_tokens: u64,
    /// Host-computed generation units (images are billed by pixels x steps).
    #[serde(default, alias = "generation_units", skip_serializing_if = "Option::is_none")]
    pub generation_units: Option<f64>,
    #[serde(default, alias = "job_id", skip_serializing_if = "Option::is_none")]
    pub job_id: Option<u64>,
    #[serde(default, alias = "processing_time_ms")]
    pub processing_time_ms: u64,
}

/// Which host produced the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    #[serde(default, alias = "host_address", skip_serializing_if = "Option::is_none")]
    pub host_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A single search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    #[cfg_attr(feature = "typescript", ts(type = "unknown"))]
    pub metadata: serde_json::Value,
}

/// Kind-specific payload of a settled exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultContent {
    Text {
        text: String,
    },
    Image {
        /// Base64 encoded image bytes
        image: String,
        width: u32,
        height: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seed: Option<u64>,
    },
    Matches {
        matches: Vec<VectorMatch>,
    },
    Upload {
        uploaded: u32,
        #[serde(default)]
        rejected: Vec<String>,
    },
}

/// Outcome of one successfully settled exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub request_id: String,
    pub kind: ExchangeKind,
    pub content: ResultContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety: Option<SafetyVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing: Option<BillingMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderInfo>,
}

impl GenerationResult {
    /// Text content, for chat results.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            ResultContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_categories() {
        assert_eq!(ExchangeKind::ChatStream.rate_category(), RateCategory::Chat);
        assert_eq!(ExchangeKind::VectorUpload.rate_category(), RateCategory::Vector);
        assert_eq!(ExchangeKind::ImageGeneration.action(), "image_generation");
        assert!(ExchangeKind::ChatStream.is_streaming());
        assert!(!ExchangeKind::VectorSearch.is_streaming());
    }

    #[test]
    fn test_image_request_serializes_camel_case() {
        let request = ImageRequest::new("a fox")
            .with_guidance(7.5)
            .with_safety_level("strict");
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["guidanceScale"], 7.5);
        assert_eq!(json["safetyLevel"], "strict");
        assert!(json.get("size").is_none());
    }

    #[test]
    fn test_billing_accepts_snake_case() {
        let billing: BillingMetrics =
            serde_json::from_str(r#"{"tokens_used": 42, "job_id": 7}"#).unwrap();
        assert_eq!(billing.tokens_used, 42);
        assert_eq!(billing.job_id, Some(7));
    }
}
