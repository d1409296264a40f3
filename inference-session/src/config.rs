//! Configuration for the protocol engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{ExchangeKind, RateCategory};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chat validation limits
    pub chat: ChatLimits,
    /// Image validation limits and defaults
    pub image: ImageLimits,
    /// Vector validation limits
    pub vector: VectorLimits,
    /// Admission control
    pub rate_limits: RateLimitConfig,
    /// Per-kind settlement timeouts
    pub timeouts: TimeoutConfig,
    /// Retry defaults for callers using `with_retry`
    pub retry: RetryConfig,
    /// Per-binding request defaults
    pub channels: ChannelDefaults,
    /// HTTP fallback binding
    pub http: HttpConfig,
    /// Usage ledger
    pub ledger: LedgerConfig,
}

impl EngineConfig {
    /// Load config from YAML. Missing sections take their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.chat.max_prompt_length == 0 || self.image.max_prompt_length == 0 {
            return invalid("max_prompt_length must be positive");
        }
        if self.image.allowed_sizes.is_empty() {
            return invalid("image.allowed_sizes must not be empty");
        }
        if !self.image.allowed_sizes.contains(&self.image.default_size) {
            return invalid("image.default_size must be one of image.allowed_sizes");
        }
        if self.image.allowed_safety_levels.is_empty() {
            return invalid("image.allowed_safety_levels must not be empty");
        }
        if !self
            .image
            .allowed_safety_levels
            .contains(&self.image.default_safety_level)
        {
            return invalid("image.default_safety_level must be allowed");
        }
        if self.image.min_steps > self.image.max_steps {
            return invalid("image.min_steps exceeds image.max_steps");
        }
        if self.image.min_guidance > self.image.max_guidance {
            return invalid("image.min_guidance exceeds image.max_guidance");
        }
        for steps in [
            self.channels.encrypted_default_steps,
            self.channels.http_default_steps,
        ] {
            if steps < self.image.min_steps || steps > self.image.max_steps {
                return invalid("channel default steps outside image step range");
            }
        }
        if self.vector.max_dimension == 0 || self.vector.max_k == 0 || self.vector.max_batch == 0 {
            return invalid("vector limits must be positive");
        }
        for bucket in [
            &self.rate_limits.chat,
            &self.rate_limits.image,
            &self.rate_limits.vector,
        ] {
            if bucket.capacity == 0 || bucket.window_ms == 0 {
                return invalid("rate limit capacity and window must be positive");
            }
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.base < 1.0 {
            return invalid("retry.base must be >= 1.0");
        }
        Ok(())
    }
}

/// Chat validation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatLimits {
    /// Maximum prompt length in characters
    pub max_prompt_length: usize,
    /// Upper bound on `max_tokens`
    pub max_tokens_limit: u32,
}

impl Default for ChatLimits {
    fn default() -> Self {
        Self {
            max_prompt_length: 32_000,
            max_tokens_limit: 8192,
        }
    }
}

/// Image validation limits and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageLimits {
    pub max_prompt_length: usize,
    pub allowed_sizes: Vec<String>,
    pub default_size: String,
    pub min_steps: u32,
    pub max_steps: u32,
    pub min_guidance: f32,
    pub max_guidance: f32,
    pub allowed_safety_levels: Vec<String>,
    pub default_safety_level: String,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_prompt_length: 2000,
            allowed_sizes: [
                "256x256",
                "512x512",
                "768x768",
                "1024x1024",
                "1024x768",
                "768x1024",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            default_size: "1024x1024".to_string(),
            min_steps: 1,
            max_steps: 50,
            min_guidance: 0.0,
            max_guidance: 20.0,
            allowed_safety_levels: ["strict", "moderate", "permissive"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_safety_level: "moderate".to_string(),
        }
    }
}

/// Vector validation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorLimits {
    pub max_dimension: usize,
    pub max_k: u32,
    pub max_batch: usize,
}

impl Default for VectorLimits {
    fn default() -> Self {
        Self {
            max_dimension: 4096,
            max_k: 100,
            max_batch: 1000,
        }
    }
}

/// When a request consumes rate-limit quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargePolicy {
    /// Once per successfully settled request
    #[default]
    OnSuccess,
    /// As soon as the envelope is handed to the transport
    OnSend,
}

/// Sliding-window bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Requests admitted per window
    pub capacity: u32,
    /// Window length (ms)
    pub window_ms: u64,
}

impl BucketConfig {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window_ms: window.as_millis() as u64,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub chat: BucketConfig,
    pub image: BucketConfig,
    pub vector: BucketConfig,
    pub charge_policy: ChargePolicy,
}

impl RateLimitConfig {
    pub fn bucket(&self, category: RateCategory) -> Option<&BucketConfig> {
        match category {
            RateCategory::Chat => Some(&self.chat),
            RateCategory::Image => Some(&self.image),
            RateCategory::Vector => Some(&self.vector),
            RateCategory::Remote => None,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            chat: BucketConfig::new(30, Duration::from_secs(60)),
            image: BucketConfig::new(5, Duration::from_secs(60)),
            vector: BucketConfig::new(60, Duration::from_secs(60)),
            charge_policy: ChargePolicy::OnSuccess,
        }
    }
}

/// Settlement timeouts per exchange kind (ms).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub chat_ms: u64,
    pub image_ms: u64,
    pub vector_search_ms: u64,
    pub vector_upload_ms: u64,
}

impl TimeoutConfig {
    pub fn for_kind(&self, kind: ExchangeKind) -> Duration {
        Duration::from_millis(match kind {
            ExchangeKind::ChatStream => self.chat_ms,
            ExchangeKind::ImageGeneration => self.image_ms,
            ExchangeKind::VectorSearch => self.vector_search_ms,
            ExchangeKind::VectorUpload => self.vector_upload_ms,
        })
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            chat_ms: 120_000,
            image_ms: 180_000,
            vector_search_ms: 30_000,
            vector_upload_ms: 60_000,
        }
    }
}

/// Retry defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Backoff base; wait is `base^attempt` seconds
    pub base: f64,
    /// Upper bound on a single wait (ms)
    pub max_delay_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: 2.0,
            max_delay_ms: None,
        }
    }
}

/// Request defaults that differ between bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelDefaults {
    /// Default diffusion steps on the encrypted channel
    pub encrypted_default_steps: u32,
    /// Default diffusion steps on the HTTP fallback
    pub http_default_steps: u32,
}

impl Default for ChannelDefaults {
    fn default() -> Self {
        Self {
            encrypted_default_steps: 4,
            http_default_steps: 20,
        }
    }
}

/// HTTP fallback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub request_timeout_ms: u64,
    pub chat_path: String,
    pub image_path: String,
    pub vector_search_path: String,
    pub vector_upload_path: String,
}

impl HttpConfig {
    pub fn path_for(&self, kind: ExchangeKind) -> &str {
        match kind {
            ExchangeKind::ChatStream => &self.chat_path,
            ExchangeKind::ImageGeneration => &self.image_path,
            ExchangeKind::VectorSearch => &self.vector_search_path,
            ExchangeKind::VectorUpload => &self.vector_upload_path,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 120_000,
            chat_path: "/v1/inference".to_string(),
            image_path: "/v1/images/generate".to_string(),
            vector_search_path: "/v1/vectors/search".to_string(),
            vector_upload_path: "/v1/vectors/upload".to_string(),
        }
    }
}

/// Usage ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub max_entries: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { max_entries: 1000 }
    }
}
