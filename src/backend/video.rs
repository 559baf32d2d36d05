//! Video generation adapter: submit a render job, poll until it resolves.
//!
//! Generation takes from seconds to minutes; the caller's timeout bounds the
//! whole submit-and-poll exchange.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{BackendError, GenerationBackend, check_status, post_json};
use crate::artifact::ArtifactRef;
use crate::types::{CanonicalInput, GenerationKind};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct VideoBackend {
    endpoint: String,
    api_key: String,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RenderStatus {
    status: String,
    video_url: Option<String>,
    error: Option<String>,
}

impl VideoBackend {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn poll_until_ready(
        &self,
        http: &reqwest::Client,
        render_id: &str,
    ) -> Result<ArtifactRef, BackendError> {
        loop {
            let response = http
                .get(format!("{}/{render_id}", self.endpoint))
                .bearer_auth(&self.api_key)
                .send()
                .await?;
            let state: RenderStatus = check_status(response)
                .await?
                .json()
                .await
                .map_err(|err| BackendError::MalformedResponse(err.to_string()))?;

            match state.status.as_str() {
                "completed" => {
                    let url = state.video_url.ok_or_else(|| {
                        BackendError::MalformedResponse(
                            "completed render without video_url".to_string(),
                        )
                    })?;
                    return Ok(ArtifactRef::RemoteUrl(url));
                }
                "failed" => {
                    return Err(BackendError::Api {
                        status: 200,
                        message: state
                            .error
                            .unwrap_or_else(|| "render failed without detail".to_string()),
                    });
                }
                other => {
                    debug!(render_id, status = other, "video render still in progress");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

#[async_trait]
impl GenerationBackend for VideoBackend {
    fn name(&self) -> &'static str {
        "video"
    }

    fn kind(&self) -> GenerationKind {
        GenerationKind::VideoGeneration
    }

    fn build_payload(&self, input: &CanonicalInput) -> Result<serde_json::Value, BackendError> {
        let duration = input.duration_secs.ok_or_else(|| {
            BackendError::MalformedResponse("video request without duration_secs".to_string())
        })?;
        let mut payload = json!({
            "model": input.model,
            "prompt": input.prompt,
            "duration": duration,
        });
        if let Some(resolution) = &input.resolution {
            payload["resolution"] = json!(resolution);
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
        let exchange = async {
            let response =
                post_json(http, &self.endpoint, &self.api_key, &payload, timeout).await?;
            let submitted: SubmitResponse = response
                .json()
                .await
                .map_err(|err| BackendError::MalformedResponse(err.to_string()))?;
            debug!(render_id = %submitted.id, model = %input.model, "video render submitted");
            self.poll_until_ready(http, &submitted.id).await
        };
        let artifact = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| BackendError::Timeout(timeout))??;
        Ok(vec![artifact])
    }
}
