//! Artifact hand-off between the frame extractor and the storage backends.
//!
//! The extractor pushes one reader per extracted artifact through a
//! capacity-1 channel, so it never runs more than one artifact ahead of the
//! backend consuming it.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use mpf_models::ArtifactKey;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::debug;

use crate::backend::ArtifactRequest;
use crate::error::{StorageError, StorageResult};

/// One extracted artifact, readable exactly once.
pub struct ExtractedArtifact {
    pub key: ArtifactKey,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl ExtractedArtifact {
    pub fn new(key: ArtifactKey, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            key,
            reader: Box::new(reader),
        }
    }
}

impl std::fmt::Debug for ExtractedArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractedArtifact")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Prefix of the job warning emitted for each artifact that stayed on local
/// disk because its upload failed.
pub const PARTIAL_ARTIFACT_UPLOAD_WARNING: &str =
    "Some artifacts were stored locally because storing them remotely failed due to: ";

/// Job warning for one artifact whose upload failed.
pub fn partial_upload_warning(key: ArtifactKey, error: &dyn std::fmt::Display) -> String {
    format!("{}{} ({})", PARTIAL_ARTIFACT_UPLOAD_WARNING, error, key)
}

/// Receiving end of an extraction run. An `Err` item ends the run.
pub type ArtifactStream = mpsc::Receiver<StorageResult<ExtractedArtifact>>;

/// Sending end handed to the extraction task.
pub type ArtifactSender = mpsc::Sender<StorageResult<ExtractedArtifact>>;

/// The synchronous hand-off channel.
pub fn hand_off() -> (ArtifactSender, ArtifactStream) {
    mpsc::channel(1)
}

/// Produces the artifacts of an [`ArtifactRequest`].
///
/// May be called more than once for the same request: a failed remote
/// attempt is followed by a fresh extraction for local storage.
#[async_trait]
pub trait ArtifactExtractor: Send + Sync {
    async fn extract(&self, request: &ArtifactRequest) -> StorageResult<ArtifactStream>;
}

/// Serves artifacts already held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticArtifactExtractor {
    artifacts: Vec<(ArtifactKey, Bytes)>,
}

impl StaticArtifactExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: ArtifactKey, data: impl Into<Bytes>) -> Self {
        self.artifacts.push((key, data.into()));
        self
    }
}

#[async_trait]
impl ArtifactExtractor for StaticArtifactExtractor {
    async fn extract(&self, _request: &ArtifactRequest) -> StorageResult<ArtifactStream> {
        let (tx, rx) = hand_off();
        let artifacts = self.artifacts.clone();
        tokio::spawn(async move {
            for (key, data) in artifacts {
                let artifact = ExtractedArtifact::new(key, std::io::Cursor::new(data));
                if tx.send(Ok(artifact)).await.is_err() {
                    debug!("Artifact consumer went away, stopping");
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// Serves artifacts from files that were already extracted to disk.
#[derive(Debug, Clone, Default)]
pub struct FileArtifactExtractor {
    files: Vec<(ArtifactKey, PathBuf)>,
}

impl FileArtifactExtractor {
    pub fn new(files: Vec<(ArtifactKey, PathBuf)>) -> Self {
        Self { files }
    }
}

#[async_trait]
impl ArtifactExtractor for FileArtifactExtractor {
    async fn extract(&self, _request: &ArtifactRequest) -> StorageResult<ArtifactStream> {
        let (tx, rx) = hand_off();
        let files = self.files.clone();
        tokio::spawn(async move {
            for (key, path) in files {
                let item = match tokio::fs::File::open(&path).await {
                    Ok(file) => Ok(ExtractedArtifact::new(key, file)),
                    Err(e) => Err(StorageError::extraction(format!(
                        "failed to open artifact {} at {}: {}",
                        key,
                        path.display(),
                        e
                    ))),
                };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    return;
                }
            }
        });
        Ok(rx)
    }
}
