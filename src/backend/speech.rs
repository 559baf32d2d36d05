//! Speech synthesis adapter: one POST, binary audio back.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{BackendError, GenerationBackend, post_json};
use crate::artifact::ArtifactRef;
use crate::types::{CanonicalInput, GenerationKind};

const DEFAULT_VOICE: &str = "alloy";

#[derive(Debug, Clone)]
pub struct SpeechBackend {
    endpoint: String,
    api_key: String,
}

impl SpeechBackend {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl GenerationBackend for SpeechBackend {
    fn name(&self) -> &'static str {
        "speech"
    }

    fn kind(&self) -> GenerationKind {
        GenerationKind::SpeechSynthesis
    }

    fn build_payload(&self, input: &CanonicalInput) -> Result<serde_json::Value, BackendError> {
        Ok(json!({
            "model": input.model,
            "input": input.prompt,
            "voice": input.voice.as_deref().unwrap_or(DEFAULT_VOICE),
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
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(BackendError::MalformedResponse(
                "speech response carried no audio".to_string(),
            ));
        }
        debug!(model = %input.model, size = bytes.len(), "speech back-end returned audio");
        Ok(vec![ArtifactRef::Inline {
            bytes,
            media_type: "audio/mpeg".to_string(),
        }])
    }
}
