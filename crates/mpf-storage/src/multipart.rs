//! Chunked multipart HTTP upload backend.
//!
//! Three phases against `<service>/api/uploadS3.php`:
//! 1. `POST ?init` answers `{"upload_id": ...}`
//! 2. `POST ?uploadID=<id>&partNumber=<n>` per segment, multipart field
//!    `file`, answered with an `ETag` header
//! 3. `POST ?uploadID=<id>` with
//!    `{"CompleteMultipartUpload":[{"PartNumber":n,"ETag":tag},...]}`,
//!    answered with `{"status":[{"relative_url": ...}]}`
//!
//! Segments are uploaded by a pool of workers; the completion manifest is
//! always sorted by part number. Artifacts of one request are uploaded
//! concurrently, each one falling back to local storage on its own.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use mpf_models::{props, ArtifactKey, PropertyLookup, PropertyLookupExt};
use reqwest::header::ETAG;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::artifacts::{partial_upload_warning, ArtifactExtractor};
use crate::backend::{ArtifactRequest, ArtifactUris, StorageBackend, StoreRequest};
use crate::config::{StorageConfig, UploadSettings};
use crate::dispatcher::{run_workers, Segment, SegmentDispatcher, SegmentResult};
use crate::error::{StorageError, StorageResult};
use crate::http::{build_client, RetryingHttpClient};
use crate::local::LocalBackend;
use crate::metrics;
use crate::retry::RetryPolicy;
use crate::warnings::WarningSink;

const UPLOAD_PATH: &str = "api/uploadS3.php";
const RELATIVE_URL_POINTER: &str = "/status/0/relative_url";

/// Storage backend for the chunked multipart upload service.
///
/// Clones share one reqwest client, built on first use.
#[derive(Clone)]
pub struct HttpMultipartBackend {
    defaults: UploadSettings,
    connect_timeout: Duration,
    request_timeout: Duration,
    base_delay: Duration,
    http: Arc<OnceCell<Client>>,
    local: LocalBackend,
    warnings: Arc<dyn WarningSink>,
}

impl HttpMultipartBackend {
    pub fn new(config: &StorageConfig, warnings: Arc<dyn WarningSink>) -> Self {
        Self {
            defaults: config.upload.clone(),
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            base_delay: RetryPolicy::http_upload(0).base_delay,
            http: Arc::new(OnceCell::new()),
            local: LocalBackend::new(&config.local_storage_dir),
            warnings,
        }
    }

    /// Override the initial retry delay (500ms by default).
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// The configured service URI, `None` when the job does not use this
    /// backend.
    pub fn service_uri(props: &dyn PropertyLookup) -> StorageResult<Option<Url>> {
        match props.get_non_blank(props::HTTP_STORAGE_SERVICE_URI) {
            None => Ok(None),
            Some(raw) => Url::parse(raw.trim()).map(Some).map_err(|e| {
                StorageError::config(format!(
                    "{} \"{}\" is not a valid URI: {}",
                    props::HTTP_STORAGE_SERVICE_URI,
                    raw,
                    e
                ))
            }),
        }
    }

    fn required_service_uri(props: &dyn PropertyLookup) -> StorageResult<Url> {
        Self::service_uri(props)?.ok_or_else(|| {
            StorageError::config(format!("{} is not set", props::HTTP_STORAGE_SERVICE_URI))
        })
    }

    /// The shared client with the retry budget of `settings`.
    async fn client(&self, settings: &UploadSettings) -> StorageResult<RetryingHttpClient> {
        let client = self
            .http
            .get_or_try_init(|| async {
                build_client(
                    self.defaults.thread_count,
                    self.connect_timeout,
                    self.request_timeout,
                )
            })
            .await?
            .clone();
        let policy = RetryPolicy::new(
            settings.retry_count,
            self.base_delay,
            RetryPolicy::http_upload(0).max_delay.max(self.base_delay),
        );
        Ok(RetryingHttpClient::with_client(client, policy))
    }

    /// Upload one stream through the three-phase protocol and return the
    /// retrieval URI.
    pub async fn upload<R>(
        &self,
        service_uri: &Url,
        content: R,
        settings: &UploadSettings,
    ) -> StorageResult<Url>
    where
        R: AsyncRead + Unpin + Send,
    {
        let client = self.client(settings).await?;
        upload_with(&client, service_uri, content, settings).await
    }

    /// Upload every artifact, at most `parallel_upload_count` at a time.
    /// Artifacts whose upload fails are stored locally.
    async fn upload_artifacts(
        &self,
        request: &ArtifactRequest,
        extractor: &dyn ArtifactExtractor,
        service_uri: Url,
        settings: UploadSettings,
    ) -> StorageResult<ArtifactUris> {
        let client = Arc::new(self.client(&settings).await?);
        let service_uri = Arc::new(service_uri);
        let settings = Arc::new(settings);
        let semaphore = Arc::new(Semaphore::new(settings.parallel_upload_count.max(1)));

        let mut tasks = JoinSet::new();
        let mut pending: BTreeMap<ArtifactKey, Bytes> = BTreeMap::new();
        let mut stream = extractor.extract(request).await?;
        while let Some(item) = stream.recv().await {
            let mut artifact = item?;
            let mut data = Vec::new();
            artifact.reader.read_to_end(&mut data).await?;
            let data = Bytes::from(data);
            pending.insert(artifact.key, data.clone());

            let permit = semaphore.clone().acquire_owned().await.ok();
            let key = artifact.key;
            let client = client.clone();
            let service_uri = service_uri.clone();
            let settings = settings.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = upload_with(&client, &service_uri, Cursor::new(data), &settings).await;
                (key, result)
            });
        }

        let mut uris = ArtifactUris::new();
        let mut failures: HashMap<ArtifactKey, String> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Ok(uri))) => {
                    debug!(job_id = %request.job_id, artifact = %key, uri = %uri, "Artifact uploaded");
                    pending.remove(&key);
                    uris.insert(key, uri);
                }
                Ok((key, Err(e))) => {
                    warn!(
                        job_id = %request.job_id,
                        artifact = %key,
                        error = %e,
                        "Artifact upload failed, storing it locally"
                    );
                    failures.insert(key, e.to_string());
                }
                Err(e) => {
                    error!(job_id = %request.job_id, error = %e, "Artifact upload task failed");
                }
            }
        }

        for (key, data) in pending {
            let reason = failures
                .remove(&key)
                .unwrap_or_else(|| "the upload task did not complete".to_string());
            let uri = self
                .local
                .store_artifact(request, key, &mut Cursor::new(data))
                .await?;
            self.warnings
                .add_warning(&request.job_id, &partial_upload_warning(key, &reason));
            uris.insert(key, uri);
        }
        Ok(uris)
    }
}

async fn upload_with<R>(
    client: &RetryingHttpClient,
    service_uri: &Url,
    content: R,
    settings: &UploadSettings,
) -> StorageResult<Url>
where
    R: AsyncRead + Unpin + Send,
{
    let upload_id = init_upload(client, service_uri).await?;
    debug!(upload_id = %upload_id, service = %service_uri, "Upload session started");

    let parts = send_content(client, service_uri, &upload_id, content, settings).await?;

    complete_upload(client, service_uri, &upload_id, &parts)
        .await
        .map_err(|e| {
            warn!(
                upload_id = %upload_id,
                parts = parts.len(),
                "All parts were sent but completing the upload failed; \
                 the remote session was left unfinished"
            );
            e
        })
}

fn upload_uri(service_uri: &Url) -> Url {
    let mut uri = service_uri.clone();
    let path = format!("{}/{}", service_uri.path().trim_end_matches('/'), UPLOAD_PATH);
    uri.set_path(&path);
    uri.set_query(None);
    uri.set_fragment(None);
    uri
}

async fn init_upload(client: &RetryingHttpClient, service_uri: &Url) -> StorageResult<String> {
    let mut uri = upload_uri(service_uri);
    uri.set_query(Some("init"));

    let response = client
        .execute("upload init", |c| Ok(c.post(uri.clone())))
        .await?;
    let body: Value = response.json().await.map_err(|e| {
        StorageError::protocol(format!("Upload init HTTP response was not valid JSON: {}", e))
    })?;

    match body.get("upload_id") {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(StorageError::protocol(
            "Upload init HTTP response did not contain the \"upload_id\" field as expected.",
        )),
    }
}

async fn send_content<R>(
    client: &RetryingHttpClient,
    service_uri: &Url,
    upload_id: &str,
    content: R,
    settings: &UploadSettings,
) -> StorageResult<Vec<SegmentResult>>
where
    R: AsyncRead + Unpin + Send,
{
    let dispatcher = SegmentDispatcher::new(content, settings.segment_size);

    run_workers(&dispatcher, settings.thread_count, move |segment| {
        send_part(client, service_uri, upload_id, segment)
    })
    .await
    .map_err(|failures| {
        warn!(
            upload_id = %upload_id,
            failed = failures.len(),
            "Sending content failed"
        );
        StorageError::SegmentUpload {
            upload_id: upload_id.to_string(),
            failures: failures.iter().map(|e| e.to_string()).collect(),
        }
    })
}

async fn send_part(
    client: &RetryingHttpClient,
    service_uri: &Url,
    upload_id: &str,
    segment: Segment,
) -> StorageResult<SegmentResult> {
    let part_number = segment.number;
    let length = segment.data.len() as u64;

    let mut uri = upload_uri(service_uri);
    uri.query_pairs_mut()
        .append_pair("uploadID", upload_id)
        .append_pair("partNumber", &part_number.to_string());

    let operation = format!("upload part {} of {}", part_number, upload_id);
    let response = client
        .execute(&operation, |c| {
            let part = Part::stream_with_length(segment.data.clone(), length)
                .file_name(format!("part_{}", part_number))
                .mime_str("application/octet-stream")
                .map_err(|e| StorageError::protocol(format!("invalid part content type: {}", e)))?;
            Ok(c.post(uri.clone()).multipart(Form::new().part("file", part)))
        })
        .await?;

    let etag = response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            StorageError::protocol(format!(
                "The HTTP response for upload id \"{}\"'s part number {} did not contain an \"ETag\" header.",
                upload_id, part_number
            ))
        })?;

    metrics::record_bytes_uploaded("http_multipart", length);
    Ok(SegmentResult {
        segment_number: part_number,
        confirmation_token: etag,
    })
}

async fn complete_upload(
    client: &RetryingHttpClient,
    service_uri: &Url,
    upload_id: &str,
    parts: &[SegmentResult],
) -> StorageResult<Url> {
    let mut uri = upload_uri(service_uri);
    uri.query_pairs_mut().append_pair("uploadID", upload_id);
    let body = json!({ "CompleteMultipartUpload": parts });

    let operation = format!("complete upload {}", upload_id);
    let response = client
        .execute(&operation, |c| Ok(c.post(uri.clone()).json(&body)))
        .await?;
    let json: Value = response.json().await.map_err(|e| {
        StorageError::protocol(format!(
            "Complete upload response for upload id \"{}\" was not valid JSON: {}",
            upload_id, e
        ))
    })?;

    let relative_url = json
        .pointer(RELATIVE_URL_POINTER)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            StorageError::protocol(format!(
                "Unexpected response content for upload id \"{}\". Expected to find JSON path: {}",
                upload_id, RELATIVE_URL_POINTER
            ))
        })?;

    let mut result = service_uri.clone();
    result.set_path(relative_url);
    result.set_query(None);
    result.set_fragment(None);
    Ok(result)
}

#[async_trait]
impl StorageBackend for HttpMultipartBackend {
    fn name(&self) -> &'static str {
        "http_multipart"
    }

    fn can_store(&self, props: &dyn PropertyLookup) -> StorageResult<bool> {
        Ok(Self::service_uri(props)?.is_some())
    }

    async fn store(&self, request: &StoreRequest) -> StorageResult<Url> {
        let started = Instant::now();
        let service_uri = Self::required_service_uri(request.properties.as_ref())?;
        let settings = self.defaults.resolve(request.properties.as_ref())?;

        let reader = request.source.open().await?;
        let result = self.upload(&service_uri, reader, &settings).await;
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
            "Stored output through multipart upload"
        );
        Ok(uri)
    }

    async fn store_artifacts(
        &self,
        request: &ArtifactRequest,
        extractor: &dyn ArtifactExtractor,
    ) -> StorageResult<ArtifactUris> {
        let started = Instant::now();
        let service_uri = Self::required_service_uri(request.properties.as_ref())?;
        let settings = self.defaults.resolve(request.properties.as_ref())?;

        let result = self
            .upload_artifacts(request, extractor, service_uri, settings)
            .await;
        metrics::record_store(
            self.name(),
            result.is_ok(),
            started.elapsed().as_secs_f64() * 1000.0,
        );

        let uris = result?;
        info!(
            job_id = %request.job_id,
            media_id = %request.media_id,
            count = uris.len(),
            "Stored artifacts through multipart upload"
        );
        Ok(uris)
    }
}
