//! Synchronous request validation.
//!
//! Runs to completion before any admission check or encryption, so an
//! invalid request never produces a network side effect.

use std::collections::HashSet;

use crate::config::EngineConfig;
use crate::error::ProtocolError;
use crate::types::{
    ChatRequest, ImageRequest, RequestSpec, VectorSearchRequest, VectorUploadRequest,
};

/// Validates requests against configured limits.
#[derive(Debug, Clone)]
pub struct Validator {
    config: EngineConfig,
}

type Validation = Result<(), ProtocolError>;

impl Validator {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Return the first violated constraint, if any.
    pub fn validate(&self, request: &RequestSpec) -> Validation {
        match request {
            RequestSpec::Chat(r) => self.validate_chat(r),
            RequestSpec::Image(r) => self.validate_image(r),
            RequestSpec::VectorSearch(r) => self.validate_vector_search(r),
            RequestSpec::VectorUpload(r) => self.validate_vector_upload(r),
        }
    }

    fn validate_chat(&self, request: &ChatRequest) -> Validation {
        let limits = &self.config.chat;
        check_prompt(&request.prompt, limits.max_prompt_length)?;

        if let Some(max_tokens) = request.max_tokens {
            if max_tokens == 0 || max_tokens > limits.max_tokens_limit {
                return Err(ProtocolError::validation(
                    "max_tokens",
                    format!("must be between 1 and {}", limits.max_tokens_limit),
                ));
            }
        }

        if let Some(temperature) = request.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ProtocolError::validation(
                    "temperature",
                    "must be between 0.0 and 2.0",
                ));
            }
        }

        Ok(())
    }

    fn validate_image(&self, request: &ImageRequest) -> Validation {
        let limits = &self.config.image;
        check_prompt(&request.prompt, limits.max_prompt_length)?;

        if let Some(negative) = &request.negative_prompt {
            if negative.chars().count() > limits.max_prompt_length {
                return Err(ProtocolError::validation(
                    "negative_prompt",
                    format!("exceeds {} characters", limits.max_prompt_length),
                ));
            }
        }

        if let Some(size) = &request.size {
            if !limits.allowed_sizes.contains(size) {
                return Err(ProtocolError::validation(
                    "size",
                    format!("{size} is not one of {}", limits.allowed_sizes.join(", ")),
                ));
            }
        }

        if let Some(steps) = request.steps {
            if steps < limits.min_steps || steps > limits.max_steps {
                return Err(ProtocolError::validation(
                    "steps",
                    format!("must be between {} and {}", limits.min_steps, limits.max_steps),
                ));
            }
        }

        if let Some(guidance) = request.guidance {
            if !guidance.is_finite() || guidance < limits.min_guidance || guidance > limits.max_guidance
            {
                return Err(ProtocolError::validation(
                    "guidance",
                    format!(
                        "must be between {} and {}",
                        limits.min_guidance, limits.max_guidance
                    ),
                ));
            }
        }

        if let Some(level) = &request.safety_level {
            if !limits.allowed_safety_levels.contains(level) {
                return Err(ProtocolError::validation(
                    "safety_level",
                    format!(
                        "{level} is not one of {}",
                        limits.allowed_safety_levels.join(", ")
                    ),
                ));
            }
        }

        Ok(())
    }

    fn validate_vector_search(&self, request: &VectorSearchRequest) -> Validation {
        let limits = &self.config.vector;
        check_vector("vector", &request.vector, limits.max_dimension)?;

        if request.k == 0 || request.k > limits.max_k {
            return Err(ProtocolError::validation(
                "k",
                format!("must be between 1 and {}", limits.max_k),
            ));
        }

        if let Some(threshold) = request.threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ProtocolError::validation(
                    "threshold",
                    "must be between 0.0 and 1.0",
                ));
            }
        }

        Ok(())
    }

    fn validate_vector_upload(&self, request: &VectorUploadRequest) -> Validation {
        let limits = &self.config.vector;

        if request.vectors.is_empty() {
            return Err(ProtocolError::validation("vectors", "batch is empty"));
        }
        if request.vectors.len() > limits.max_batch {
            return Err(ProtocolError::validation(
                "vectors",
                format!("batch exceeds {} entries", limits.max_batch),
            ));
        }

        let dimension = request.vectors[0].vector.len();
        let mut seen = HashSet::with_capacity(request.vectors.len());

        for entry in &request.vectors {
            if entry.id.trim().is_empty() {
                return Err(ProtocolError::validation("vectors.id", "must not be empty"));
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(ProtocolError::validation(
                    "vectors.id",
                    format!("duplicate id {}", entry.id),
                ));
            }
            check_vector("vectors.vector", &entry.vector, limits.max_dimension)?;
            if entry.vector.len() != dimension {
                return Err(ProtocolError::validation(
                    "vectors.vector",
                    format!(
                        "dimension mismatch for {}: expected {dimension}, got {}",
                        entry.id,
                        entry.vector.len()
                    ),
                ));
            }
        }

        Ok(())
    }
}

fn check_prompt(prompt: &str, max_length: usize) -> Validation {
    if prompt.trim().is_empty() {
        return Err(ProtocolError::validation("prompt", "must not be empty"));
    }
    let length = prompt.chars().count();
    if length > max_length {
        return Err(ProtocolError::validation(
            "prompt",
            format!("length {length} exceeds maximum of {max_length}"),
        ));
    }
    Ok(())
}

fn check_vector(field: &str, vector: &[f32], max_dimension: usize) -> Validation {
    if vector.is_empty() {
        return Err(ProtocolError::validation(field, "must not be empty"));
    }
    if vector.len() > max_dimension {
        return Err(ProtocolError::validation(
            field,
            format!("dimension {} exceeds {max_dimension}", vector.len()),
        ));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(ProtocolError::validation(field, "contains non-finite values"));
    }
    Ok(())
}
