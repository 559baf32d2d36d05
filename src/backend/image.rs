//! Image generation adapter: one POST, N image URLs back.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{BackendError, GenerationBackend, post_json};
use crate::artifact::ArtifactRef;
use crate::types::{CanonicalInput, GenerationKind};

#[derive(Debug, Clone)]
pub struct ImageBackend {
    endpoint: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    data: Vec<ImageItem>,
}

#[derive(Debug, Deserialize)]
struct ImageItem {
    url: String,
}

impl ImageBackend {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl GenerationBackend for ImageBackend {
    fn name(&self) -> &'static str {
        "image"
    }

    fn kind(&self) -> GenerationKind {
        GenerationKind::ImageGeneration
    }

    fn build_payload(&self, input: &CanonicalInput) -> Result<serde_json::Value, BackendError> {
        let mut payload = json!({
            "model": input.model,
            "prompt": input.prompt,
            "n": input.units,
        });
        if let Some(resolution) = &input.resolution {
            payload["size"] = json!(resolution);
        }
        Ok(payload)
    }

    async fn invoke(
        &self,
        http: &reqwest::Client,
        input: &CanonicalInput,
        timeout: Duration,
    ) -> Result<Vec<ArtifactRef>, BackendError> {
        let payload = self.build_payload(input)?;
        let response = post_json(http, &self.endpoint, &self.api_key, &payload, timeout).await?;
        let parsed: ImageResponse = response
            .json()
            .await
            .map_err(|err| BackendError::MalformedResponse(err.to_string()))?;

        if parsed.data.is_empty() {
            return Err(BackendError::MalformedResponse(
                "image response carried no data entries".to_string(),
            ));
        }
        debug!(model = %input.model, count = parsed.data.len(), "image back-end returned urls");
        Ok(parsed
            .data
            .into_iter()
            .map(|item| ArtifactRef::RemoteUrl(item.url))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let backend = ImageBackend::new("http://img.local/v1/images", "key");
        let input = CanonicalInput::new("nova-image-2", "a fox").units(3).resolution("512x512");
        let payload = backend.build_payload(&input).unwrap();
        assert_eq!(payload["model"], "nova-image-2");
        assert_eq!(payload["n"], 3);
        assert_eq!(payload["size"], "512x512");
    }

    #[test]
    fn test_payload_omits_absent_resolution() {
        let backend = ImageBackend::new("http://img.local/v1/images", "key");
        let payload = backend
            .build_payload(&CanonicalInput::new("nova-image-2", "a fox"))
            .unwrap();
        assert!(payload.get("size").is_none());
    }
}
