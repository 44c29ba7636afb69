//! Local filesystem storage.
//!
//! Always eligible. Every remote backend falls back to this one.
//!
//! Layout under the storage root:
//! - `<kind>/<job_id>[/<media_id>]/<file name>` for outputs
//! - `artifacts/<job_id>/<media_id>/<action_index>/track-<t>-frame-<f>.<ext>`

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use mpf_models::{ArtifactKey, OutputKind, PropertyLookup};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info};
use url::Url;

use crate::artifacts::ArtifactExtractor;
use crate::backend::{ArtifactRequest, ArtifactUris, ByteSource, StorageBackend, StoreRequest};
use crate::error::{StorageError, StorageResult};
use crate::metrics;

/// Hex digits of the content hash in an unnamed output object's file name.
const OUTPUT_OBJECT_HASH_LEN: usize = 16;

/// Disk-backed storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the artifacts of one request.
    pub fn artifact_dir(&self, request: &ArtifactRequest) -> PathBuf {
        self.root
            .join(OutputKind::Artifact.directory_name())
            .join(request.job_id.as_str())
            .join(request.media_id.to_string())
            .join(request.action_index.to_string())
    }

    /// Write one artifact to its local location and return its `file://` URI.
    pub async fn store_artifact(
        &self,
        request: &ArtifactRequest,
        key: ArtifactKey,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> StorageResult<Url> {
        let dir = prepare_dir(&self.artifact_dir(request)).await?;
        let name = format!(
            "track-{}-frame-{}.{}",
            key.track_index, key.frame_index, request.extension
        );
        let path = write_atomically(&dir, &name, reader).await?;
        file_url(&path)
    }

    fn output_dir(&self, request: &StoreRequest) -> PathBuf {
        let mut dir = self
            .root
            .join(request.kind.directory_name())
            .join(request.job_id.as_str());
        if let Some(media_id) = request.media_id {
            dir = dir.join(media_id.to_string());
        }
        dir
    }
}

/// Unnamed output objects are named after their content, so different
/// outputs of one job never replace each other.
async fn output_file_name(request: &StoreRequest) -> StorageResult<String> {
    if let Some(name) = &request.file_name {
        return Ok(name.clone());
    }
    if let Some(name) = request
        .source
        .local_path()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
    {
        return Ok(name.to_string());
    }
    match request.kind {
        OutputKind::OutputObject => {
            let key = request.source.content_key().await?;
            let hash = key.as_str();
            let short = hash.get(..OUTPUT_OBJECT_HASH_LEN).unwrap_or(hash);
            Ok(format!("detection-{}.json", short))
        }
        _ => Ok(uuid::Uuid::new_v4().to_string()),
    }
}

async fn prepare_dir(dir: &Path) -> StorageResult<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    Ok(tokio::fs::canonicalize(dir).await?)
}

/// Copy `reader` into `dir/name` through a temporary file in the same
/// directory, so readers never observe a partially written file.
async fn write_atomically(
    dir: &Path,
    name: &str,
    reader: &mut (dyn AsyncRead + Send + Unpin),
) -> StorageResult<PathBuf> {
    let temp = tempfile::Builder::new()
        .prefix(".partial-")
        .tempfile_in(dir)?;
    let (std_file, temp_path) = temp.into_parts();

    let mut file = tokio::fs::File::from_std(std_file);
    tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    drop(file);

    let target = dir.join(name);
    temp_path.persist(&target).map_err(|e| e.error)?;
    Ok(target)
}

fn file_url(path: &Path) -> StorageResult<Url> {
    Url::from_file_path(path).map_err(|_| {
        StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("cannot express {} as a file URI", path.display()),
        ))
    })
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn can_store(&self, _props: &dyn PropertyLookup) -> StorageResult<bool> {
        Ok(true)
    }

    async fn store(&self, request: &StoreRequest) -> StorageResult<Url> {
        let started = Instant::now();
        let dir = prepare_dir(&self.output_dir(request)).await?;
        let name = output_file_name(request).await?;

        let target = dir.join(&name);
        let already_in_place = match &request.source {
            ByteSource::File(path) => tokio::fs::canonicalize(path)
                .await
                .map(|p| p == target)
                .unwrap_or(false),
            ByteSource::Bytes(_) => false,
        };

        let path = if already_in_place {
            target
        } else {
            let mut reader = request.source.open().await?;
            write_atomically(&dir, &name, &mut *reader).await?
        };

        debug!(
            job_id = %request.job_id,
            kind = %request.kind,
            path = %path.display(),
            "Stored output locally"
        );
        metrics::record_store(self.name(), true, started.elapsed().as_secs_f64() * 1000.0);
        file_url(&path)
    }

    async fn store_artifacts(
        &self,
        request: &ArtifactRequest,
        extractor: &dyn ArtifactExtractor,
    ) -> StorageResult<ArtifactUris> {
        let mut stream = extractor.extract(request).await?;
        let mut uris = ArtifactUris::new();

        while let Some(item) = stream.recv().await {
            let mut artifact = item?;
            let uri = self
                .store_artifact(request, artifact.key, &mut *artifact.reader)
                .await?;
            uris.insert(artifact.key, uri);
        }

        info!(
            job_id = %request.job_id,
            media_id = %request.media_id,
            count = uris.len(),
            "Stored artifacts locally"
        );
        Ok(uris)
    }
}
