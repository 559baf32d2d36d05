//! Artifact staging and the durable persistence contract.
//!
//! Raw back-end output is streamed into an ephemeral staging directory before
//! delivery. Staged files are swept after a grace period regardless of how
//! delivery went; the durable record lives behind [`ArtifactStore`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::types::{ActorId, GenerationKind, JobId};

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to download artifact from {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("back-end returned no artifacts")]
    Empty,
}

/// Durable store rejected or failed to write the artifact record.
#[derive(Debug, Error)]
#[error("persistence failure: {0}")]
pub struct PersistenceError(pub String);

/// Raw back-end output: either a remote reference to fetch or inline bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactRef {
    RemoteUrl(String),
    Inline { bytes: Bytes, media_type: String },
}

fn extension(kind: GenerationKind) -> &'static str {
    match kind {
        GenerationKind::ImageGeneration => "png",
        GenerationKind::VideoGeneration => "mp4",
        GenerationKind::SpeechSynthesis => "mp3",
        GenerationKind::PromptExtraction => "txt",
    }
}

impl ArtifactRef {
    pub fn source_url(&self) -> Option<&str> {
        match self {
            Self::RemoteUrl(url) => Some(url),
            Self::Inline { .. } => None,
        }
    }
}

/// A staged artifact: local copy plus its remote source reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub job: JobId,
    pub kind: GenerationKind,
    pub source_url: Option<String>,
    pub local_path: PathBuf,
    pub size: u64,
}

/// Record written to durable storage for a delivered (or deliverable) artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub job: JobId,
    pub actor: ActorId,
    pub kind: GenerationKind,
    pub cost: Decimal,
    pub source_url: Option<String>,
    pub local_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Durable persistence for artifact records, outside this core.
#[async_trait]
pub trait ArtifactStore: Send + Sync + std::fmt::Debug {
    async fn save(&self, record: &ArtifactRecord) -> Result<String, PersistenceError>;
}

/// Ephemeral local staging area.
#[derive(Debug, Clone)]
pub struct ArtifactStage {
    root: PathBuf,
}

impl ArtifactStage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stream back-end output into the staging directory, one file per artifact.
    pub async fn stage(
        &self,
        http: &reqwest::Client,
        job: JobId,
        kind: GenerationKind,
        refs: &[ArtifactRef],
    ) -> Result<Vec<Artifact>, StagingError> {
        if refs.is_empty() {
            return Err(StagingError::Empty);
        }
        tokio::fs::create_dir_all(&self.root).await?;

        let mut staged = Vec::with_capacity(refs.len());
        for (index, artifact_ref) in refs.iter().enumerate() {
            let filename = format!("{job}-{index}.{}", extension(kind));
            let path = self.root.join(filename);
            let size = match artifact_ref {
                ArtifactRef::RemoteUrl(url) => self.download(http, url, &path).await?,
                ArtifactRef::Inline { bytes, .. } => {
                    tokio::fs::write(&path, bytes).await?;
                    bytes.len() as u64
                }
            };
            debug!(%job, path = %path.display(), size, "artifact staged");
            staged.push(Artifact {
                job,
                kind,
                source_url: artifact_ref.source_url().map(str::to_owned),
                local_path: path,
                size,
            });
        }
        Ok(staged)
    }

    async fn download(
        &self,
        http: &reqwest::Client,
        url: &str,
        path: &Path,
    ) -> Result<u64, StagingError> {
        let map_err = |source| StagingError::Download {
            url: url.to_string(),
            source,
        };
        let response = http
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(map_err)?;

        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut size = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_err)?;
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(size)
    }

    /// Delete staged files older than the grace period, delivered or not.
    /// Returns how many were removed.
    pub async fn sweep(&self, grace: Duration) -> Result<usize, StagingError> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let expired = metadata
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age >= grace);
            if expired {
                if let Err(err) = tokio::fs::remove_file(entry.path()).await {
                    warn!(path = %entry.path().display(), %err, "staging sweep skipped file");
                } else {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Inline helper used by text-producing back-ends.
pub fn inline_text(text: impl Into<String>) -> ArtifactRef {
    ArtifactRef::Inline {
        bytes: Bytes::from(text.into()),
        media_type: "text/plain".to_string(),
    }
}
