//! Generation back-end adapters.
//!
//! One adapter per back-end family, registered rather than branched: resolving
//! a [`GenerationKind`] never inspects model-id prefixes. Every adapter owns a
//! single payload translation and an invoke with a bounded timeout; a timeout
//! is policy-identical to a hard back-end failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::artifact::ArtifactRef;
use crate::types::{CanonicalInput, GenerationKind};

mod image;
mod prompt;
mod speech;
mod video;

pub use image::ImageBackend;
pub use prompt::PromptBackend;
pub use speech::SpeechBackend;
pub use video::VideoBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("back-end request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("back-end error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("back-end did not respond within {:.0}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("malformed back-end response: {0}")]
    MalformedResponse(String),
}

/// A third-party generation service, invoked through its adapter.
#[async_trait]
pub trait GenerationBackend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn kind(&self) -> GenerationKind;

    /// Translate canonical input into the back-end's wire payload.
    fn build_payload(&self, input: &CanonicalInput) -> Result<serde_json::Value, BackendError>;

    /// Call the back-end with a bounded timeout and return artifact references.
    async fn invoke(
        &self,
        http: &reqwest::Client,
        input: &CanonicalInput,
        timeout: Duration,
    ) -> Result<Vec<ArtifactRef>, BackendError>;
}

/// Adapter registry keyed by operation kind. Adding a back-end family means
/// registering an adapter, not adding a branch.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<GenerationKind, Arc<dyn GenerationBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn resolve(&self, kind: GenerationKind) -> Option<Arc<dyn GenerationBackend>> {
        self.backends.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<GenerationKind> {
        self.backends.keys().copied().collect()
    }
}

/// POST a JSON payload within the remaining budget, mapping non-success
/// statuses to [`BackendError::Api`].
pub(crate) async fn post_json(
    http: &reqwest::Client,
    url: &str,
    api_key: &str,
    payload: &serde_json::Value,
    timeout: Duration,
) -> Result<reqwest::Response, BackendError> {
    let request = http.post(url).bearer_auth(api_key).json(payload).send();
    let response = tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| BackendError::Timeout(timeout))??;
    check_status(response).await
}

pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(BackendError::Api {
        status: status.as_u16(),
        message,
    })
}
