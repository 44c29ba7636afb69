//! Storage backend contract and request types.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mpf_models::{ArtifactKey, JobId, MediaId, OutputKind, PropertyLookup};
use tokio::io::AsyncRead;
use url::Url;

use crate::artifacts::ArtifactExtractor;
use crate::error::StorageResult;
use crate::hashing::{self, ContentKey};

/// Replayable content of a store request.
///
/// Both variants can be opened any number of times, so a failed remote
/// attempt never consumes the only copy of the data.
#[derive(Debug, Clone)]
pub enum ByteSource {
    File(PathBuf),
    Bytes(Bytes),
}

impl ByteSource {
    /// Open a fresh reader positioned at the start of the content.
    pub async fn open(&self) -> StorageResult<Box<dyn AsyncRead + Send + Unpin>> {
        match self {
            ByteSource::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Box::new(file))
            }
            ByteSource::Bytes(bytes) => Ok(Box::new(std::io::Cursor::new(bytes.clone()))),
        }
    }

    pub async fn len(&self) -> StorageResult<u64> {
        match self {
            ByteSource::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
            ByteSource::Bytes(bytes) => Ok(bytes.len() as u64),
        }
    }

    pub async fn content_key(&self) -> StorageResult<ContentKey> {
        match self {
            ByteSource::File(path) => hashing::hash_file(path).await,
            ByteSource::Bytes(bytes) => Ok(hashing::hash_bytes(bytes)),
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            ByteSource::File(path) => Some(path),
            ByteSource::Bytes(_) => None,
        }
    }
}

impl From<Bytes> for ByteSource {
    fn from(bytes: Bytes) -> Self {
        ByteSource::Bytes(bytes)
    }
}

impl From<Vec<u8>> for ByteSource {
    fn from(bytes: Vec<u8>) -> Self {
        ByteSource::Bytes(Bytes::from(bytes))
    }
}

impl From<PathBuf> for ByteSource {
    fn from(path: PathBuf) -> Self {
        ByteSource::File(path)
    }
}

/// One output to persist.
#[derive(Clone)]
pub struct StoreRequest {
    pub job_id: JobId,
    pub media_id: Option<MediaId>,
    pub kind: OutputKind,
    pub source: ByteSource,
    /// Name used when the output lands on local disk.
    pub file_name: Option<String>,
    /// Effective job/media/action configuration.
    pub properties: Arc<dyn PropertyLookup>,
}

impl StoreRequest {
    pub fn new(
        job_id: JobId,
        kind: OutputKind,
        source: impl Into<ByteSource>,
        properties: Arc<dyn PropertyLookup>,
    ) -> Self {
        Self {
            job_id,
            media_id: None,
            kind,
            source: source.into(),
            file_name: None,
            properties,
        }
    }

    pub fn with_media(mut self, media_id: MediaId) -> Self {
        self.media_id = Some(media_id);
        self
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }
}

impl fmt::Debug for StoreRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRequest")
            .field("job_id", &self.job_id)
            .field("media_id", &self.media_id)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}

/// Artifact extraction for one medium and one action of a job.
#[derive(Clone)]
pub struct ArtifactRequest {
    pub job_id: JobId,
    pub media_id: MediaId,
    pub action_index: u32,
    /// Artifacts the extractor is expected to produce. Keys it does not
    /// produce are reported as job warnings.
    pub expected: BTreeSet<ArtifactKey>,
    /// File extension used for locally stored artifacts.
    pub extension: String,
    pub properties: Arc<dyn PropertyLookup>,
}

impl ArtifactRequest {
    pub fn new(
        job_id: JobId,
        media_id: MediaId,
        action_index: u32,
        properties: Arc<dyn PropertyLookup>,
    ) -> Self {
        Self {
            job_id,
            media_id,
            action_index,
            expected: BTreeSet::new(),
            extension: "png".to_string(),
            properties,
        }
    }

    pub fn expecting(mut self, keys: impl IntoIterator<Item = ArtifactKey>) -> Self {
        self.expected.extend(keys);
        self
    }

    /// Expected keys missing from `uris`.
    pub fn missing_from(&self, uris: &ArtifactUris) -> Vec<ArtifactKey> {
        self.expected
            .iter()
            .filter(|key| !uris.contains_key(key))
            .copied()
            .collect()
    }
}

impl fmt::Debug for ArtifactRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactRequest")
            .field("job_id", &self.job_id)
            .field("media_id", &self.media_id)
            .field("action_index", &self.action_index)
            .field("expected", &self.expected.len())
            .finish_non_exhaustive()
    }
}

/// Location of every stored artifact.
pub type ArtifactUris = BTreeMap<ArtifactKey, Url>;

/// A place outputs can be persisted to.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Whether the job's configuration selects this backend.
    ///
    /// "Not configured" is `Ok(false)`. Only inconsistent configuration is
    /// an error.
    fn can_store(&self, props: &dyn PropertyLookup) -> StorageResult<bool>;

    async fn store(&self, request: &StoreRequest) -> StorageResult<Url>;

    async fn store_artifacts(
        &self,
        request: &ArtifactRequest,
        extractor: &dyn ArtifactExtractor,
    ) -> StorageResult<ArtifactUris>;
}
