//! Content-addressed storage in S3-compatible buckets.
//!
//! Every object is stored under `<prefix><h[0..2]>/<h[2..4]>/<h>`, where `h`
//! is the SHA-256 of its content. An existing object with the same key is
//! the same content, so uploads HEAD first and skip the PUT on a hit.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use mpf_models::{props, PropertyLookup, PropertyLookupExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use super::cache::{ClientCache, ClientHandle, ClientKey};
use super::client::{
    classify, into_storage_error, ObjectBody, RequestAuth, RequestKind, S3RequestError,
};
use super::copy::{CopyConfig, CopyResults};
use crate::addressing::{endpoint_string, UrlStyle};
use crate::artifacts::{partial_upload_warning, ArtifactExtractor};
use crate::backend::{ArtifactRequest, ArtifactUris, ByteSource, StorageBackend, StoreRequest};
use crate::config::{StorageConfig, UploadSettings};
use crate::error::{StorageError, StorageResult};
use crate::local::LocalBackend;
use crate::metrics;
use crate::retry::{self, RetryDecision, RetryPolicy};
use crate::warnings::WarningSink;

const BACKEND_NAME: &str = "s3";

// =============================================================================
// Configuration checks
// =============================================================================

/// Whether results must be uploaded to S3.
///
/// A results bucket without both keys is a configuration error, since the
/// job clearly meant to upload.
pub fn requires_result_upload(props: &dyn PropertyLookup) -> StorageResult<bool> {
    if props.get_non_blank(props::S3_RESULTS_BUCKET).is_none() {
        return Ok(false);
    }
    let has_access = props.get_non_blank(props::S3_ACCESS_KEY).is_some();
    let has_secret = props.get_non_blank(props::S3_SECRET_KEY).is_some();
    match (has_access, has_secret) {
        (true, true) => Ok(true),
        (false, false) => Err(StorageError::config(format!(
            "The {} property was set, but the {} and {} properties were not.",
            props::S3_RESULTS_BUCKET,
            props::S3_ACCESS_KEY,
            props::S3_SECRET_KEY
        ))),
        (true, false) => Err(StorageError::config(format!(
            "The {} and {} properties were set, but the {} property was not.",
            props::S3_RESULTS_BUCKET,
            props::S3_ACCESS_KEY,
            props::S3_SECRET_KEY
        ))),
        (false, true) => Err(StorageError::config(format!(
            "The {} and {} properties were set, but the {} property was not.",
            props::S3_RESULTS_BUCKET,
            props::S3_SECRET_KEY,
            props::S3_ACCESS_KEY
        ))),
    }
}

/// Whether input media must be fetched from S3 with credentials.
pub fn requires_media_download(props: &dyn PropertyLookup) -> StorageResult<bool> {
    if props.get_bool(props::S3_UPLOAD_ONLY) {
        return Ok(false);
    }
    let has_access = props.get_non_blank(props::S3_ACCESS_KEY).is_some();
    let has_secret = props.get_non_blank(props::S3_SECRET_KEY).is_some();
    match (has_access, has_secret) {
        (true, true) => Ok(true),
        (false, false) => Ok(false),
        (true, false) => Err(StorageError::config(format!(
            "The {} property was set, but the {} property was not.",
            props::S3_ACCESS_KEY,
            props::S3_SECRET_KEY
        ))),
        (false, true) => Err(StorageError::config(format!(
            "The {} property was set, but the {} property was not.",
            props::S3_SECRET_KEY,
            props::S3_ACCESS_KEY
        ))),
    }
}

// =============================================================================
// Upload target
// =============================================================================

/// A resolved results bucket: client, addressing and credentials.
#[derive(Debug)]
struct UploadTarget {
    handle: Arc<ClientHandle>,
    bucket_uri: Url,
    bucket: String,
    style: UrlStyle,
    prefix: Option<String>,
    auth: RequestAuth,
}

impl UploadTarget {
    async fn resolve(
        cache: &ClientCache,
        props: &dyn PropertyLookup,
        retry_count: u32,
    ) -> StorageResult<Self> {
        let raw = props.get_non_blank(props::S3_RESULTS_BUCKET).ok_or_else(|| {
            StorageError::config(format!("{} is not set", props::S3_RESULTS_BUCKET))
        })?;
        let bucket_uri = Url::parse(raw.trim()).map_err(|e| {
            StorageError::config(format!(
                "The {} property \"{}\" is not a valid URI: {}",
                props::S3_RESULTS_BUCKET,
                raw,
                e
            ))
        })?;

        let style = UrlStyle::from_properties(props);
        let endpoint = style.endpoint_of(bucket_uri.as_str())?;
        let bucket = style.bucket_name_of(&bucket_uri)?;
        let auth = RequestAuth::from_properties(props)?;
        let key = ClientKey::new(
            endpoint_string(&endpoint),
            props.get_non_blank(props::S3_REGION),
            retry_count,
        );

        Ok(Self {
            handle: cache.get(key).await?,
            bucket_uri,
            bucket,
            style,
            prefix: props.get_non_blank(props::S3_UPLOAD_OBJECT_KEY_PREFIX),
            auth,
        })
    }

    fn object_uri(&self, key: &str) -> StorageResult<Url> {
        self.style.full_uri(&self.bucket_uri, key)
    }

    /// Store `source` under its content key unless it is already there.
    async fn put_if_absent(&self, source: &ByteSource) -> StorageResult<Url> {
        let key = source.content_key().await?.object_key(self.prefix.as_deref());
        let uri = self.object_uri(&key)?;

        if object_exists(&self.handle, &self.bucket, &key, &self.auth).await? {
            debug!(uri = %uri, "Object already present, skipping upload");
            metrics::record_dedup_hit();
            return Ok(uri);
        }

        put_object(&self.handle, &self.bucket, &key, source, &self.auth).await?;
        Ok(uri)
    }
}

// =============================================================================
// Retried requests
// =============================================================================

async fn object_exists(
    handle: &ClientHandle,
    bucket: &str,
    key: &str,
    auth: &RequestAuth,
) -> StorageResult<bool> {
    let operation = format!("S3 HEAD {}/{}", bucket, key);
    retry::execute(
        handle.retry_policy(),
        &operation,
        |_| handle.client().object_exists(bucket, key, auth),
        |e| classify(e, RequestKind::ExistenceCheck),
    )
    .await
    .map_err(|f| into_storage_error(f, &operation, RequestKind::ExistenceCheck))
}

async fn put_object(
    handle: &ClientHandle,
    bucket: &str,
    key: &str,
    source: &ByteSource,
    auth: &RequestAuth,
) -> StorageResult<()> {
    let operation = format!("S3 PUT {}/{}", bucket, key);
    let length = source.len().await?;
    retry::execute(
        handle.retry_policy(),
        &operation,
        |_| async move {
            let body = byte_stream(source).await?;
            handle
                .client()
                .put_object(bucket, key, body, Some(length as i64), auth)
                .await
        },
        |e| classify(e, RequestKind::Other),
    )
    .await
    .map_err(|f| into_storage_error(f, &operation, RequestKind::Other))?;

    metrics::record_bytes_uploaded(BACKEND_NAME, length);
    Ok(())
}

async fn get_object(
    handle: &ClientHandle,
    bucket: &str,
    key: &str,
    auth: &RequestAuth,
) -> StorageResult<ObjectBody> {
    let operation = format!("S3 GET {}/{}", bucket, key);
    retry::execute(
        handle.retry_policy(),
        &operation,
        |_| handle.client().get_object(bucket, key, auth),
        |e| classify(e, RequestKind::Other),
    )
    .await
    .map_err(|f| into_storage_error(f, &operation, RequestKind::Other))
}

async fn byte_stream(source: &ByteSource) -> Result<ByteStream, S3RequestError> {
    match source {
        ByteSource::File(path) => ByteStream::from_path(path).await.map_err(|e| {
            S3RequestError::Request(format!("could not read {}: {}", path.display(), e))
        }),
        ByteSource::Bytes(bytes) => Ok(ByteStream::from(bytes.clone())),
    }
}

// =============================================================================
// Copy
// =============================================================================

enum CopyMode {
    /// Same endpoint and credentials on both sides.
    ServerSide,
    /// GET from the source client, PUT through the destination client.
    Streamed {
        source: Arc<ClientHandle>,
        source_auth: RequestAuth,
    },
}

struct CopyJob {
    source_uri: Url,
    source_bucket: String,
    source_key: String,
    destination_key: String,
    mode: CopyMode,
}

async fn run_copy(
    job: CopyJob,
    target: Arc<UploadTarget>,
    copy_policy: RetryPolicy,
) -> StorageResult<Url> {
    let destination_uri = target.object_uri(&job.destination_key)?;
    if object_exists(&target.handle, &target.bucket, &job.destination_key, &target.auth).await? {
        debug!(
            source = %job.source_uri,
            destination = %destination_uri,
            "Copy destination already present"
        );
        metrics::record_dedup_hit();
        return Ok(destination_uri);
    }

    match &job.mode {
        CopyMode::ServerSide => {
            let operation = format!("S3 COPY {} to {}", job.source_uri, destination_uri);
            let handle = &target.handle;
            retry::execute(
                handle.retry_policy(),
                &operation,
                |_| {
                    handle.client().copy_object(
                        &job.source_bucket,
                        &job.source_key,
                        &target.bucket,
                        &job.destination_key,
                        &target.auth,
                    )
                },
                |e| classify(e, RequestKind::Other),
            )
            .await
            .map_err(|f| into_storage_error(f, &operation, RequestKind::Other))?;
        }
        CopyMode::Streamed {
            source,
            source_auth,
        } => {
            let operation = format!("S3 streamed copy {} to {}", job.source_uri, destination_uri);
            retry::execute(
                &copy_policy,
                &operation,
                |_| stream_copy_once(source, source_auth, &job, &target),
                |e| match e {
                    StorageError::CopyInterrupted(_) => RetryDecision::Retry,
                    _ => RetryDecision::Stop,
                },
            )
            .await
            .map_err(|f| f.error)?;
        }
    }

    Ok(destination_uri)
}

/// One GET-to-PUT pass. The PUT body is the live GET body, so a failed PUT
/// is not retried on its own; an interrupted one restarts the whole pass.
async fn stream_copy_once(
    source: &ClientHandle,
    source_auth: &RequestAuth,
    job: &CopyJob,
    target: &UploadTarget,
) -> StorageResult<()> {
    let object = get_object(source, &job.source_bucket, &job.source_key, source_auth).await?;
    let length = object.content_length;

    let operation = format!("S3 PUT {}/{}", target.bucket, job.destination_key);
    target
        .handle
        .client()
        .put_object(
            &target.bucket,
            &job.destination_key,
            object.body,
            length,
            &target.auth,
        )
        .await
        .map_err(|e| {
            into_storage_error(
                retry::RetryFailure {
                    attempts: 1,
                    exhausted: false,
                    error: e,
                },
                &operation,
                RequestKind::CopyDestinationPut,
            )
        })?;

    if let Some(length) = length {
        metrics::record_bytes_uploaded(BACKEND_NAME, length.max(0) as u64);
    }
    Ok(())
}

fn file_path(uri: &Url) -> StorageResult<PathBuf> {
    uri.to_file_path()
        .map_err(|_| StorageError::addressing(format!("\"{}\" is not a local file URI", uri)))
}

// =============================================================================
// Backend
// =============================================================================

/// S3-compatible storage backend.
pub struct S3Backend {
    cache: Arc<ClientCache>,
    local: LocalBackend,
    warnings: Arc<dyn WarningSink>,
    defaults: UploadSettings,
    copy_retry_count: u32,
}

impl S3Backend {
    pub fn new(
        config: &StorageConfig,
        cache: Arc<ClientCache>,
        warnings: Arc<dyn WarningSink>,
    ) -> Self {
        Self {
            cache,
            local: LocalBackend::new(&config.local_storage_dir),
            warnings,
            defaults: config.upload.clone(),
            copy_retry_count: config.copy_retry_count,
        }
    }

    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }

    /// Copy previously stored results into the bucket named by the job's
    /// `S3_RESULTS_BUCKET`.
    ///
    /// `file://` URIs are uploaded under their content key. Remote URIs are
    /// copied server-side when both sides share endpoint and credentials,
    /// and streamed through this process otherwise. Objects already present
    /// at the destination are not copied again. One failed item does not
    /// stop the others.
    pub async fn copy_results(
        &self,
        uris: &[Url],
        props: &dyn PropertyLookup,
    ) -> StorageResult<CopyResults> {
        let started = Instant::now();
        let config = CopyConfig::from_properties(props)?;
        let settings = self.defaults.resolve(props)?;

        let destination_endpoint = config
            .destination
            .style
            .endpoint_of(config.destination_bucket_uri.as_str())?;
        let target = Arc::new(UploadTarget {
            handle: self
                .cache
                .get(ClientKey::new(
                    endpoint_string(&destination_endpoint),
                    config.destination.region.clone(),
                    settings.retry_count,
                ))
                .await?,
            bucket_uri: config.destination_bucket_uri.clone(),
            bucket: config.destination_bucket()?,
            style: config.destination.style.clone(),
            prefix: Some(config.destination.prefix.clone()).filter(|p| !p.trim().is_empty()),
            auth: config.destination_auth()?,
        });

        let copy_policy = RetryPolicy::s3(self.copy_retry_count);
        let semaphore = Arc::new(Semaphore::new(settings.parallel_upload_count.max(1)));
        let mut results = CopyResults::default();
        let mut same_client: HashMap<String, bool> = HashMap::new();
        let mut tasks = JoinSet::new();

        for uri in uris {
            let source_uri = uri.clone();
            let target = target.clone();
            let semaphore = semaphore.clone();

            if uri.scheme() == "file" {
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let outcome = match file_path(&source_uri) {
                        Ok(path) => target.put_if_absent(&ByteSource::File(path)).await,
                        Err(e) => Err(e),
                    };
                    (source_uri, outcome)
                });
                continue;
            }

            let job = match self
                .plan_copy(&config, uri, &mut same_client, &target, settings.retry_count)
                .await
            {
                Ok(job) => job,
                Err(e) => {
                    warn!(source = %uri, "Cannot copy: {}", e);
                    results.record(uri.clone(), Err(e));
                    continue;
                }
            };
            let copy_policy = copy_policy.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = run_copy(job, target, copy_policy).await;
                (source_uri, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((source, outcome)) => {
                    if let Err(e) = &outcome {
                        error!(source = %source, "Failed to copy {} due to: {}", source, e);
                    }
                    results.record(source, outcome);
                }
                Err(e) => error!("Copy task did not complete: {}", e),
            }
        }

        let settled: HashSet<&Url> = results.copied.keys().chain(results.failed.keys()).collect();
        let unsettled: Vec<Url> = uris
            .iter()
            .filter(|uri| !settled.contains(uri))
            .cloned()
            .collect();
        for uri in unsettled {
            results.record(
                uri,
                Err(StorageError::transport("S3 copy", 1, "copy task did not complete")),
            );
        }

        info!(
            copied = results.copied.len(),
            failed = results.failed.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Copied results"
        );
        metrics::record_store(
            "s3_copy",
            results.is_complete(),
            started.elapsed().as_secs_f64() * 1000.0,
        );
        Ok(results)
    }

    /// `same_client` remembers the fast/streamed decision per source
    /// endpoint, so it is made once for each group of URIs.
    async fn plan_copy(
        &self,
        config: &CopyConfig,
        uri: &Url,
        same_client: &mut HashMap<String, bool>,
        target: &UploadTarget,
        retry_count: u32,
    ) -> StorageResult<CopyJob> {
        let style = &config.source.style;
        let endpoint = endpoint_string(&style.endpoint_of(uri.as_str())?);
        let server_side = match same_client.get(&endpoint) {
            Some(decision) => *decision,
            None => {
                let decision = config.can_use_same_client(uri.as_str())?;
                same_client.insert(endpoint.clone(), decision);
                decision
            }
        };

        if server_side {
            let (source_bucket, source_key) =
                config.destination.style.split_bucket_and_key(uri.as_str())?;
            return Ok(CopyJob {
                source_uri: uri.clone(),
                destination_key: config.destination_key(&source_key),
                source_bucket,
                source_key,
                mode: CopyMode::ServerSide,
            });
        }

        let (source_bucket, source_key) = style.split_bucket_and_key(uri.as_str())?;
        let source = self
            .cache
            .get(ClientKey::new(
                endpoint,
                config.source.region.clone(),
                retry_count,
            ))
            .await?;
        debug!(
            source = %uri,
            destination_bucket = %target.bucket,
            "Copy needs separate source and destination clients"
        );
        Ok(CopyJob {
            source_uri: uri.clone(),
            destination_key: config.destination_key(&source_key),
            source_bucket,
            source_key,
            mode: CopyMode::Streamed {
                source,
                source_auth: config.source_auth()?,
            },
        })
    }

    async fn media_source(
        &self,
        uri: &Url,
        props: &dyn PropertyLookup,
    ) -> StorageResult<(Arc<ClientHandle>, String, String, RequestAuth)> {
        let settings = self.defaults.resolve(props)?;
        let style = UrlStyle::from_properties(props);
        let endpoint = style.endpoint_of(uri.as_str())?;
        let (bucket, key) = style.split_bucket_and_key(uri.as_str())?;
        let handle = self
            .cache
            .get(ClientKey::new(
                endpoint_string(&endpoint),
                props.get_non_blank(props::S3_REGION),
                settings.retry_count,
            ))
            .await?;
        Ok((handle, bucket, key, RequestAuth::from_properties(props)?))
    }

    /// Read a whole object, e.g. the output object of an earlier job.
    pub async fn get_object(&self, uri: &Url, props: &dyn PropertyLookup) -> StorageResult<Bytes> {
        let (handle, bucket, key, auth) = self.media_source(uri, props).await?;
        let object = get_object(&handle, &bucket, &key, &auth).await?;
        let data = object.body.collect().await.map_err(|e| {
            StorageError::transport(format!("S3 GET {}", uri), 1, e.to_string())
        })?;
        Ok(data.into_bytes())
    }

    /// Download input media to `destination`. Returns the number of bytes
    /// written.
    pub async fn download_media(
        &self,
        uri: &Url,
        props: &dyn PropertyLookup,
        destination: &Path,
    ) -> StorageResult<u64> {
        let (handle, bucket, key, auth) = self.media_source(uri, props).await?;
        let object = get_object(&handle, &bucket, &key, &auth).await?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut body = object.body;
        let mut file = tokio::fs::File::create(destination).await?;
        let mut written = 0u64;
        while let Some(chunk) = body.try_next().await.map_err(|e| {
            StorageError::transport(format!("S3 GET {}", uri), 1, e.to_string())
        })? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        info!(
            uri = %uri,
            path = %destination.display(),
            bytes = written,
            "Downloaded media"
        );
        Ok(written)
    }

    /// Upload artifacts that were already written locally. Artifacts whose
    /// upload fails keep their local URI.
    async fn upload_local_artifacts(
        &self,
        request: &ArtifactRequest,
        target: Arc<UploadTarget>,
        local_uris: &ArtifactUris,
        parallelism: usize,
    ) -> ArtifactUris {
        let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut tasks = JoinSet::new();

        for (key, local_uri) in local_uris {
            let (key, local_uri) = (*key, local_uri.clone());
            let target = target.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = match file_path(&local_uri) {
                    Ok(path) => {
                        let outcome = target.put_if_absent(&ByteSource::File(path.clone())).await;
                        if outcome.is_ok() {
                            if let Err(e) = tokio::fs::remove_file(&path).await {
                                warn!(path = %path.display(), "Failed to remove uploaded artifact: {}", e);
                            }
                        }
                        outcome
                    }
                    Err(e) => Err(e),
                };
                (key, outcome)
            });
        }

        let mut uris = ArtifactUris::new();
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Ok(remote))) => {
                    uris.insert(key, remote);
                }
                Ok((key, Err(e))) => {
                    warn!(
                        job_id = %request.job_id,
                        artifact = %key,
                        "Artifact upload failed, keeping local copy: {}",
                        e
                    );
                    self.warnings
                        .add_warning(&request.job_id, &partial_upload_warning(key, &e));
                    uris.insert(key, local_uris[&key].clone());
                    failed += 1;
                }
                Err(e) => {
                    error!(job_id = %request.job_id, "Artifact upload task did not complete: {}", e);
                }
            }
        }

        // Items whose task never reported back keep their local copy.
        for (key, local_uri) in local_uris {
            if !uris.contains_key(key) {
                self.warnings.add_warning(
                    &request.job_id,
                    &partial_upload_warning(*key, &"the upload task did not complete"),
                );
                uris.insert(*key, local_uri.clone());
                failed += 1;
            }
        }

        if failed > 0 {
            debug!(job_id = %request.job_id, failed, "Artifacts kept locally");
        }
        uris
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn can_store(&self, props: &dyn PropertyLookup) -> StorageResult<bool> {
        requires_result_upload(props)
    }

    async fn store(&self, request: &StoreRequest) -> StorageResult<Url> {
        let started = Instant::now();
        let props = request.properties.as_ref();

        let result = async {
            let settings = self.defaults.resolve(props)?;
            let target = UploadTarget::resolve(&self.cache, props, settings.retry_count).await?;
            target.put_if_absent(&request.source).await
        }
        .await;

        metrics::record_store(
            self.name(),
            result.is_ok(),
            started.elapsed().as_secs_f64() * 1000.0,
        );
        let uri = result?;
        info!(
            job_id = %request.job_id,
            kind = %request.kind,
            uri = %uri,
            "Stored output in S3"
        );
        Ok(uri)
    }

    async fn store_artifacts(
        &self,
        request: &ArtifactRequest,
        extractor: &dyn ArtifactExtractor,
    ) -> StorageResult<ArtifactUris> {
        let started = Instant::now();
        let props = request.properties.as_ref();
        let settings = self.defaults.resolve(props)?;
        let target =
            Arc::new(UploadTarget::resolve(&self.cache, props, settings.retry_count).await?);

        let local_uris = self.local.store_artifacts(request, extractor).await?;
        let uris = self
            .upload_local_artifacts(request, target, &local_uris, settings.parallel_upload_count)
            .await;

        let remote = uris.values().filter(|u| u.scheme() != "file").count();
        info!(
            job_id = %request.job_id,
            media_id = %request.media_id,
            uploaded = remote,
            kept_local = uris.len() - remote,
            "Stored artifacts in S3"
        );
        metrics::record_store(
            self.name(),
            remote == uris.len(),
            started.elapsed().as_secs_f64() * 1000.0,
        );
        Ok(uris)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{StaticArtifactExtractor, PARTIAL_ARTIFACT_UPLOAD_WARNING};
    use crate::hashing;
    use crate::s3::memory::{InMemoryClientFactory, InMemoryObjectClient, ObjectOp};
    use crate::warnings::InMemoryWarningSink;
    use mpf_models::{ArtifactKey, JobId, MapProperties, MediaId, OutputKind};
    use std::time::Duration;

    struct Fixture {
        backend: S3Backend,
        client: Arc<InMemoryObjectClient>,
        factory: InMemoryClientFactory,
        warnings: Arc<InMemoryWarningSink>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(InMemoryObjectClient::new());
        let factory = InMemoryClientFactory::new(client.clone());
        let cache = Arc::new(ClientCache::new(
            Arc::new(factory.clone()),
            Duration::from_secs(60),
            8,
        ));
        let warnings = Arc::new(InMemoryWarningSink::new());
        let config = StorageConfig {
            local_storage_dir: dir.path().to_path_buf(),
            ..StorageConfig::default()
        };
        Fixture {
            backend: S3Backend::new(&config, cache, warnings.clone()),
            client,
            factory,
            warnings,
            _dir: dir,
        }
    }

    fn props() -> MapProperties {
        MapProperties::new()
            .with(props::S3_RESULTS_BUCKET, "http://minio:9000/results")
            .with(props::S3_ACCESS_KEY, "AKIA")
            .with(props::S3_SECRET_KEY, "secret")
            .with(props::UPLOAD_RETRY_COUNT, "1")
    }

    #[test]
    fn test_requires_result_upload() {
        assert!(!requires_result_upload(&MapProperties::new()).unwrap());
        assert!(requires_result_upload(&props()).unwrap());

        let bucket_only =
            MapProperties::new().with(props::S3_RESULTS_BUCKET, "http://minio:9000/results");
        let err = requires_result_upload(&bucket_only).unwrap_err();
        assert!(err.to_string().contains(
            "The S3_RESULTS_BUCKET property was set, but the S3_ACCESS_KEY and S3_SECRET_KEY \
             properties were not."
        ));

        let missing_secret = bucket_only.clone().with(props::S3_ACCESS_KEY, "AKIA");
        let err = requires_result_upload(&missing_secret).unwrap_err();
        assert!(err
            .to_string()
            .contains("but the S3_SECRET_KEY property was not."));
    }

    #[test]
    fn test_requires_media_download() {
        assert!(!requires_media_download(&MapProperties::new()).unwrap());
        assert!(requires_media_download(&props()).unwrap());
        assert!(!requires_media_download(&props().with(props::S3_UPLOAD_ONLY, "true")).unwrap());

        let only_secret = MapProperties::new().with(props::S3_SECRET_KEY, "secret");
        let err = requires_media_download(&only_secret).unwrap_err();
        assert!(err.to_string().contains(
            "The S3_SECRET_KEY property was set, but the S3_ACCESS_KEY property was not."
        ));
    }

    #[tokio::test]
    async fn test_store_uploads_under_content_key() {
        let f = fixture();
        let request = StoreRequest::new(
            JobId::from("job-1"),
            OutputKind::OutputObject,
            b"hello world".to_vec(),
            Arc::new(props()),
        );

        let uri = f.backend.store(&request).await.unwrap();
        let hash = hashing::hash_bytes(b"hello world");
        let key = hash.object_key(None);
        assert_eq!(uri.as_str(), format!("http://minio:9000/results/{}", key));
        assert_eq!(f.client.object("results", &key).unwrap().as_ref(), b"hello world");
        assert_eq!(f.client.count(ObjectOp::Head), 1);
        assert_eq!(f.client.count(ObjectOp::Put), 1);

        let keys = f.factory.created_keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].endpoint, "http://minio:9000");
        assert_eq!(keys[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_store_skips_put_when_object_exists() {
        let f = fixture();
        let key = hashing::hash_bytes(b"again").object_key(Some("prefix/"));
        f.client.insert("results", &key, Bytes::from_static(b"again"));

        let request = StoreRequest::new(
            JobId::from("job-2"),
            OutputKind::Markup,
            b"again".to_vec(),
            Arc::new(props().with(props::S3_UPLOAD_OBJECT_KEY_PREFIX, "prefix/")),
        );
        let uri = f.backend.store(&request).await.unwrap();
        assert!(uri.path().ends_with(&key));
        assert_eq!(f.client.count(ObjectOp::Put), 0);
    }

    #[tokio::test]
    async fn test_store_retries_then_fails() {
        let f = fixture();
        f.client.fail_always(
            ObjectOp::Put,
            S3RequestError::status(503, Some("SlowDown"), "busy"),
        );
        let request = StoreRequest::new(
            JobId::from("job-3"),
            OutputKind::OutputObject,
            b"{}".to_vec(),
            Arc::new(props().with(props::UPLOAD_RETRY_COUNT, "2")),
        );

        let err = f.backend.store(&request).await.unwrap_err();
        match err {
            StorageError::Transport { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(f.client.count(ObjectOp::Put), 3);
    }

    #[tokio::test]
    async fn test_virtual_host_without_bucket_is_rejected_before_any_request() {
        let f = fixture();
        let props = props()
            .with(props::S3_RESULTS_BUCKET, "https://s3.example.com")
            .with(props::S3_USE_VIRTUAL_HOST, "true")
            .with(props::S3_HOST, "s3.example.com");
        let request = StoreRequest::new(
            JobId::from("job-4"),
            OutputKind::OutputObject,
            b"{}".to_vec(),
            Arc::new(props),
        );

        let err = f.backend.store(&request).await.unwrap_err();
        assert!(matches!(err, StorageError::Addressing(_)));
        assert!(f.client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_artifacts_partial_failure_keeps_local_uri() {
        let f = fixture();
        let failing = hashing::hash_bytes(b"frame two").object_key(None);
        f.client.fail_always(
            ObjectOp::Put,
            S3RequestError::status(500, Some("InternalError"), "broken"),
        );
        // The first artifact is already stored, so only the second needs a PUT.
        let present = hashing::hash_bytes(b"frame one").object_key(None);
        f.client.insert("results", &present, Bytes::from_static(b"frame one"));

        let request = ArtifactRequest::new(
            JobId::from("job-5"),
            MediaId(1),
            0,
            Arc::new(props().with(props::UPLOAD_RETRY_COUNT, "0")),
        );
        let extractor = StaticArtifactExtractor::new()
            .with(ArtifactKey::new(0, 1), b"frame one".to_vec())
            .with(ArtifactKey::new(0, 2), b"frame two".to_vec());

        let uris = f.backend.store_artifacts(&request, &extractor).await.unwrap();
        assert_eq!(uris[&ArtifactKey::new(0, 1)].scheme(), "http");
        let kept = &uris[&ArtifactKey::new(0, 2)];
        assert_eq!(kept.scheme(), "file");
        assert!(kept.to_file_path().unwrap().exists());
        assert!(f.client.object("results", &failing).is_none());

        let warnings = f.warnings.warnings_for(&JobId::from("job-5"));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.starts_with(PARTIAL_ARTIFACT_UPLOAD_WARNING));
        assert!(warnings[0].message.ends_with("(track 0 frame 2)"));
    }

    #[tokio::test]
    async fn test_each_failed_artifact_gets_its_own_warning() {
        let f = fixture();
        f.client.fail_always(
            ObjectOp::Put,
            S3RequestError::status(500, Some("InternalError"), "broken"),
        );
        let present = hashing::hash_bytes(b"frame one").object_key(None);
        f.client.insert("results", &present, Bytes::from_static(b"frame one"));

        let request = ArtifactRequest::new(
            JobId::from("job-7"),
            MediaId(1),
            0,
            Arc::new(props().with(props::UPLOAD_RETRY_COUNT, "0")),
        );
        let extractor = StaticArtifactExtractor::new()
            .with(ArtifactKey::new(0, 1), b"frame one".to_vec())
            .with(ArtifactKey::new(0, 2), b"frame two".to_vec())
            .with(ArtifactKey::new(1, 5), b"frame five".to_vec());

        let uris = f.backend.store_artifacts(&request, &extractor).await.unwrap();
        assert_eq!(uris.len(), 3);
        assert_eq!(uris[&ArtifactKey::new(0, 1)].scheme(), "http");
        assert_eq!(uris[&ArtifactKey::new(0, 2)].scheme(), "file");
        assert_eq!(uris[&ArtifactKey::new(1, 5)].scheme(), "file");

        let messages: Vec<String> = f.warnings.drain().into_iter().map(|w| w.message).collect();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.contains("InternalError")));
        assert!(messages.iter().any(|m| m.ends_with("(track 0 frame 2)")));
        assert!(messages.iter().any(|m| m.ends_with("(track 1 frame 5)")));
    }

    #[tokio::test]
    async fn test_uploaded_artifacts_are_removed_locally() {
        let f = fixture();
        let request = ArtifactRequest::new(JobId::from("job-6"), MediaId(2), 1, Arc::new(props()));
        let extractor =
            StaticArtifactExtractor::new().with(ArtifactKey::new(3, 4), b"pixels".to_vec());

        let uris = f.backend.store_artifacts(&request, &extractor).await.unwrap();
        assert_eq!(uris[&ArtifactKey::new(3, 4)].scheme(), "http");
        let local = f.backend.local.artifact_dir(&request).join("track-3-frame-4.png");
        assert!(!local.exists());
        assert!(f.warnings.warnings().is_empty());
    }

    #[tokio::test]
    async fn test_get_object_reads_whole_object() {
        let f = fixture();
        f.client.insert("media", "videos/in.mp4", Bytes::from_static(b"movie"));
        let uri = Url::parse("http://minio:9000/media/videos/in.mp4").unwrap();

        let data = f.backend.get_object(&uri, &props()).await.unwrap();
        assert_eq!(data.as_ref(), b"movie");

        let dest = f.backend.local.root().join("media/in.mp4");
        let written = f.backend.download_media(&uri, &props(), &dest).await.unwrap();
        assert_eq!(written, 5);
        assert_eq!(std::fs::read(dest).unwrap(), b"movie");
    }
}
