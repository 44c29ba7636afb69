//! Backend selection and local fallback.
//!
//! Each request goes to the first remote backend whose configuration check
//! selects it. When that backend fails, the failure is recorded as a job
//! warning and the output is stored locally instead. A request that no
//! remote backend claims is stored locally without a warning.

use std::sync::Arc;

use mpf_models::{JobId, OutputKind, PropertyLookup};
use tracing::{debug, error, warn};
use url::Url;

use crate::artifacts::ArtifactExtractor;
use crate::backend::{ArtifactRequest, ArtifactUris, StorageBackend, StoreRequest};
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::local::LocalBackend;
use crate::metrics;
use crate::multipart::HttpMultipartBackend;
use crate::s3::{ClientCache, S3Backend};
use crate::warnings::WarningSink;

/// Routes store requests to a remote backend, falling back to local disk.
pub struct StorageRouter {
    remotes: Vec<Arc<dyn StorageBackend>>,
    local: LocalBackend,
    warnings: Arc<dyn WarningSink>,
}

impl StorageRouter {
    /// A router with no remote backends.
    pub fn new(local: LocalBackend, warnings: Arc<dyn WarningSink>) -> Self {
        Self {
            remotes: Vec::new(),
            local,
            warnings,
        }
    }

    /// S3 first, then the multipart upload service.
    pub fn from_config(
        config: &StorageConfig,
        cache: Arc<ClientCache>,
        warnings: Arc<dyn WarningSink>,
    ) -> Self {
        Self::new(LocalBackend::new(&config.local_storage_dir), warnings.clone())
            .with_backend(Arc::new(S3Backend::new(config, cache, warnings.clone())))
            .with_backend(Arc::new(HttpMultipartBackend::new(config, warnings)))
    }

    /// Append a remote backend. Earlier backends take precedence.
    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.remotes.push(backend);
        self
    }

    pub fn local(&self) -> &LocalBackend {
        &self.local
    }

    /// The remote backend selected by `props`, if any.
    pub fn select(&self, props: &dyn PropertyLookup) -> StorageResult<Option<&dyn StorageBackend>> {
        for backend in &self.remotes {
            if backend.can_store(props)? {
                return Ok(Some(backend.as_ref()));
            }
        }
        Ok(None)
    }

    pub async fn store(&self, request: &StoreRequest) -> StorageResult<Url> {
        let remote_error = match self.select(request.properties.as_ref()) {
            Ok(None) => None,
            Ok(Some(backend)) => match backend.store(request).await {
                Ok(uri) => return Ok(uri),
                Err(e) => {
                    warn!(
                        job_id = %request.job_id,
                        kind = %request.kind,
                        backend = backend.name(),
                        "Failed to store output remotely, storing locally instead: {}",
                        e
                    );
                    Some(e)
                }
            },
            Err(e) => {
                warn!(
                    job_id = %request.job_id,
                    kind = %request.kind,
                    "Invalid remote storage configuration, storing locally instead: {}",
                    e
                );
                Some(e)
            }
        };

        if let Some(e) = &remote_error {
            self.report_fallback(&request.job_id, request.kind, e);
        }

        match self.local.store(request).await {
            Ok(uri) => Ok(uri),
            Err(local) => {
                let err = self.local_failure(&request.job_id, local, remote_error);
                if request.kind.is_mandatory() {
                    error!(
                        job_id = %request.job_id,
                        kind = %request.kind,
                        "Mandatory output was lost, the job cannot complete"
                    );
                } else {
                    self.warnings
                        .add_warning(&request.job_id, &lost_output_warning(request.kind, &err));
                }
                Err(err)
            }
        }
    }

    pub async fn store_artifacts(
        &self,
        request: &ArtifactRequest,
        extractor: &dyn ArtifactExtractor,
    ) -> StorageResult<ArtifactUris> {
        let remote_error = match self.select(request.properties.as_ref()) {
            Ok(None) => None,
            Ok(Some(backend)) => match backend.store_artifacts(request, extractor).await {
                Ok(uris) => {
                    self.report_missing(request, &uris);
                    return Ok(uris);
                }
                Err(e) => {
                    warn!(
                        job_id = %request.job_id,
                        media_id = %request.media_id,
                        backend = backend.name(),
                        "Failed to store artifacts remotely, storing locally instead: {}",
                        e
                    );
                    Some(e)
                }
            },
            Err(e) => Some(e),
        };

        if let Some(e) = &remote_error {
            self.report_fallback(&request.job_id, OutputKind::Artifact, e);
        }

        match self.local.store_artifacts(request, extractor).await {
            Ok(uris) => {
                self.report_missing(request, &uris);
                Ok(uris)
            }
            Err(local) => Err(self.local_failure(&request.job_id, local, remote_error)),
        }
    }

    fn report_fallback(&self, job_id: &JobId, kind: OutputKind, remote: &StorageError) {
        metrics::record_local_fallback(kind.as_str());
        self.warnings.add_warning(
            job_id,
            &format!("{}: {}", kind.local_fallback_message(), remote),
        );
    }

    fn report_missing(&self, request: &ArtifactRequest, uris: &ArtifactUris) {
        let missing = request.missing_from(uris);
        if missing.is_empty() {
            return;
        }
        let listed = missing
            .iter()
            .map(|key| key.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        debug!(job_id = %request.job_id, missing = missing.len(), "Artifacts not extracted");
        self.warnings.add_warning(
            &request.job_id,
            &format!(
                "Artifacts for media {} could not be extracted: {}",
                request.media_id, listed
            ),
        );
    }

    fn local_failure(
        &self,
        job_id: &JobId,
        local: StorageError,
        remote: Option<StorageError>,
    ) -> StorageError {
        error!(job_id = %job_id, "Failed to store output locally: {}", local);
        match remote {
            Some(remote) => StorageError::with_suppressed(local, remote),
            None => local,
        }
    }
}

/// Job warning for an optional output that could be stored nowhere.
pub fn lost_output_warning(kind: OutputKind, error: &StorageError) -> String {
    format!("The {} output could not be stored: {}", kind, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{ArtifactStream, StaticArtifactExtractor};
    use crate::warnings::InMemoryWarningSink;
    use async_trait::async_trait;
    use mpf_models::{ArtifactKey, MapProperties, MediaId};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Remote backend that always claims the request and always fails.
    #[derive(Default)]
    struct FailingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StorageBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn can_store(&self, _props: &dyn PropertyLookup) -> StorageResult<bool> {
            Ok(true)
        }

        async fn store(&self, _request: &StoreRequest) -> StorageResult<Url> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::transport("remote PUT", 3, "connection refused"))
        }

        async fn store_artifacts(
            &self,
            _request: &ArtifactRequest,
            _extractor: &dyn ArtifactExtractor,
        ) -> StorageResult<ArtifactUris> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::transport("remote PUT", 3, "connection refused"))
        }
    }

    /// Remote backend whose configuration check is inconsistent.
    struct MisconfiguredBackend;

    #[async_trait]
    impl StorageBackend for MisconfiguredBackend {
        fn name(&self) -> &'static str {
            "misconfigured"
        }

        fn can_store(&self, _props: &dyn PropertyLookup) -> StorageResult<bool> {
            Err(StorageError::config("access key without secret key"))
        }

        async fn store(&self, _request: &StoreRequest) -> StorageResult<Url> {
            unreachable!("never selected")
        }

        async fn store_artifacts(
            &self,
            _request: &ArtifactRequest,
            _extractor: &dyn ArtifactExtractor,
        ) -> StorageResult<ArtifactUris> {
            unreachable!("never selected")
        }
    }

    /// Counts extraction runs. Remote test backends never extract, so every
    /// run is a local one.
    struct CountingExtractor {
        inner: StaticArtifactExtractor,
        runs: AtomicUsize,
    }

    impl CountingExtractor {
        fn new(inner: StaticArtifactExtractor) -> Self {
            Self {
                inner,
                runs: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ArtifactExtractor for CountingExtractor {
        async fn extract(&self, request: &ArtifactRequest) -> StorageResult<ArtifactStream> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.inner.extract(request).await
        }
    }

    fn props() -> Arc<dyn PropertyLookup> {
        Arc::new(MapProperties::new())
    }

    fn files_in(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_unclaimed_request_is_stored_locally_without_warning() {
        let dir = tempfile::tempdir().unwrap();
        let warnings = Arc::new(InMemoryWarningSink::new());
        let router = StorageRouter::new(LocalBackend::new(dir.path()), warnings.clone());

        let request =
            StoreRequest::new(JobId::from("j1"), OutputKind::OutputObject, b"{}".to_vec(), props());
        let uri = router.store(&request).await.unwrap();
        assert_eq!(uri.scheme(), "file");
        assert!(warnings.warnings().is_empty());
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let warnings = Arc::new(InMemoryWarningSink::new());
        let remote = Arc::new(FailingBackend::default());
        let router = StorageRouter::new(LocalBackend::new(dir.path()), warnings.clone())
            .with_backend(remote.clone());

        let request =
            StoreRequest::new(JobId::from("j2"), OutputKind::Markup, b"video".to_vec(), props())
                .with_file_name("out.mp4");
        let uri = router.store(&request).await.unwrap();

        assert_eq!(uri.scheme(), "file");
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(files_in(&dir.path().join("markup/j2")), 1);
        let recorded = warnings.warnings_for(&JobId::from("j2"));
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0]
            .message
            .starts_with("Markup was stored locally because storing it remotely failed due to: "));
        assert!(recorded[0].message.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_configuration_error_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let warnings = Arc::new(InMemoryWarningSink::new());
        let router = StorageRouter::new(LocalBackend::new(dir.path()), warnings.clone())
            .with_backend(Arc::new(MisconfiguredBackend));

        let request =
            StoreRequest::new(JobId::from("j3"), OutputKind::OutputObject, b"{}".to_vec(), props());
        let uri = router.store(&request).await.unwrap();
        assert_eq!(uri.scheme(), "file");
        assert!(warnings.warnings()[0]
            .message
            .contains("access key without secret key"));
    }

    #[tokio::test]
    async fn test_local_failure_after_remote_failure_carries_both() {
        let dir = tempfile::tempdir().unwrap();
        let warnings = Arc::new(InMemoryWarningSink::new());
        let router = StorageRouter::new(LocalBackend::new(dir.path()), warnings)
            .with_backend(Arc::new(FailingBackend::default()));

        let request = StoreRequest::new(
            JobId::from("j4"),
            OutputKind::DerivativeMedia,
            PathBuf::from("/no/such/derivative.mp4"),
            props(),
        );
        let err = router.store(&request).await.unwrap_err();
        assert!(matches!(err, StorageError::LocalFallbackFailed { .. }));
        assert!(matches!(err.suppressed(), Some(StorageError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_lost_optional_output_is_reported_as_warning() {
        let dir = tempfile::tempdir().unwrap();
        let warnings = Arc::new(InMemoryWarningSink::new());
        let router = StorageRouter::new(LocalBackend::new(dir.path()), warnings.clone())
            .with_backend(Arc::new(FailingBackend::default()));

        let request = StoreRequest::new(
            JobId::from("j6"),
            OutputKind::Markup,
            PathBuf::from("/no/such/markup.mp4"),
            props(),
        );
        let err = router.store(&request).await.unwrap_err();

        let messages: Vec<String> = warnings
            .warnings_for(&JobId::from("j6"))
            .into_iter()
            .map(|w| w.message)
            .collect();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].starts_with("Markup was stored locally"));
        assert_eq!(messages[1], lost_output_warning(OutputKind::Markup, &err));
    }

    #[tokio::test]
    async fn test_lost_output_object_is_an_error_without_warning() {
        let dir = tempfile::tempdir().unwrap();
        let warnings = Arc::new(InMemoryWarningSink::new());
        let router = StorageRouter::new(LocalBackend::new(dir.path()), warnings.clone());

        let request = StoreRequest::new(
            JobId::from("j7"),
            OutputKind::OutputObject,
            PathBuf::from("/no/such/output.json"),
            props(),
        );
        tokio_test::assert_err!(router.store(&request).await);
        assert!(warnings.warnings().is_empty());
    }

    #[tokio::test]
    async fn test_artifact_fallback_extracts_locally_once() {
        let dir = tempfile::tempdir().unwrap();
        let warnings = Arc::new(InMemoryWarningSink::new());
        let remote = Arc::new(FailingBackend::default());
        let router = StorageRouter::new(LocalBackend::new(dir.path()), warnings.clone())
            .with_backend(remote.clone());

        let request = ArtifactRequest::new(JobId::from("j8"), MediaId(2), 1, props());
        let extractor = CountingExtractor::new(
            StaticArtifactExtractor::new()
                .with(ArtifactKey::new(0, 4), b"four".to_vec())
                .with(ArtifactKey::new(1, 6), b"six".to_vec()),
        );

        let uris = router.store_artifacts(&request, &extractor).await.unwrap();
        assert_eq!(uris.len(), 2);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(extractor.runs.load(Ordering::SeqCst), 1);
        assert_eq!(files_in(&router.local().artifact_dir(&request)), 2);
        assert_eq!(warnings.warnings_for(&JobId::from("j8")).len(), 1);
    }

    #[tokio::test]
    async fn test_artifact_configuration_error_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let warnings = Arc::new(InMemoryWarningSink::new());
        let router = StorageRouter::new(LocalBackend::new(dir.path()), warnings.clone())
            .with_backend(Arc::new(MisconfiguredBackend));

        let request = ArtifactRequest::new(JobId::from("j9"), MediaId(5), 0, props());
        let extractor = CountingExtractor::new(
            StaticArtifactExtractor::new().with(ArtifactKey::new(0, 1), b"frame".to_vec()),
        );

        let uris = router.store_artifacts(&request, &extractor).await.unwrap();
        assert_eq!(uris[&ArtifactKey::new(0, 1)].scheme(), "file");
        assert_eq!(extractor.runs.load(Ordering::SeqCst), 1);

        let recorded = warnings.warnings_for(&JobId::from("j9"));
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].message.starts_with(
            "Artifacts were stored locally because storing them remotely failed due to: "
        ));
        assert!(recorded[0].message.contains("access key without secret key"));
    }

    #[tokio::test]
    async fn test_artifacts_fall_back_and_report_missing_frames() {
        let dir = tempfile::tempdir().unwrap();
        let warnings = Arc::new(InMemoryWarningSink::new());
        let router = StorageRouter::new(LocalBackend::new(dir.path()), warnings.clone())
            .with_backend(Arc::new(FailingBackend::default()));

        let request = ArtifactRequest::new(JobId::from("j5"), MediaId(9), 0, props())
            .expecting([ArtifactKey::new(0, 1), ArtifactKey::new(0, 2)]);
        let extractor =
            StaticArtifactExtractor::new().with(ArtifactKey::new(0, 1), b"frame".to_vec());

        let uris = router.store_artifacts(&request, &extractor).await.unwrap();
        assert_eq!(uris.len(), 1);
        assert_eq!(uris[&ArtifactKey::new(0, 1)].scheme(), "file");

        let messages: Vec<String> = warnings.warnings().into_iter().map(|w| w.message).collect();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].starts_with("Artifacts were stored locally"));
        assert!(messages[1].contains("track 0 frame 2"));
    }
}
