//! Prompt extraction adapter: describe an image back into a reusable prompt.
//!
//! The canonical prompt field carries the source image URL for this kind.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{BackendError, GenerationBackend, post_json};
use crate::artifact::{ArtifactRef, inline_text};
use crate::types::{CanonicalInput, GenerationKind};

#[derive(Debug, Clone)]
pub struct PromptBackend {
    endpoint: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    prompt: String,
}

impl PromptBackend {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl GenerationBackend for PromptBackend {
    fn name(&self) -> &'static str {
        "prompt"
    }

    fn kind(&self) -> GenerationKind {
        GenerationKind::PromptExtraction
    }

    fn build_payload(&self, input: &CanonicalInput) -> Result<serde_json::Value, BackendError> {
        Ok(json!({
            "model": input.model,
            "image_url": input.prompt,
        }))
    }

    async fn invoke(
        &self,
        http: &reqwest::Client,
        input: &CanonicalInput,
        timeout: Duration,
    ) -> Result<Vec<ArtifactRef>, BackendError> {
        let payload = self.build_payload(input)?;
        let response = post_json(http, &self.endpoint, &self.api_key, &payload, timeout).await?;
        let parsed: ExtractionResponse = response
            .json()
            .await
            .map_err(|err| BackendError::MalformedResponse(err.to_string()))?;
        if parsed.prompt.trim().is_empty() {
            return Err(BackendError::MalformedResponse(
                "extraction returned an empty prompt".to_string(),
            ));
        }
        Ok(vec![inline_text(parsed.prompt)])
    }
}
