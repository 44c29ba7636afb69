//! Wiring and command execution.

use std::sync::Arc;

use anyhow::{Context, Result};
use mpf_models::{ArtifactKey, EnvProperties, JobId, MapProperties, MediaId, PropertyLookup};
use mpf_storage::artifacts::FileArtifactExtractor;
use mpf_storage::s3::{AwsClientFactory, ClientFactory, StaticTokenProvider, TokenProvider};
use mpf_storage::{
    ArtifactRequest, ClientCache, HttpMultipartBackend, InMemoryWarningSink, JobWarning,
    LocalBackend, S3Backend, StorageConfig, StorageRouter, StoreRequest,
};
use serde::Serialize;
use tracing::{info, warn};
use url::Url;

use crate::cli::{Cli, Command};

// ============================================================================
// Properties
// ============================================================================

/// Command-line properties layered over the process environment.
#[derive(Debug, Clone, Default)]
pub struct LayeredProperties {
    overrides: MapProperties,
    include_env: bool,
}

impl LayeredProperties {
    pub fn new(pairs: &[(String, String)], include_env: bool) -> Self {
        let mut overrides = MapProperties::new();
        for (name, value) in pairs {
            overrides.insert(name.clone(), value.clone());
        }
        Self {
            overrides,
            include_env,
        }
    }
}

impl PropertyLookup for LayeredProperties {
    fn get(&self, name: &str) -> Option<String> {
        self.overrides
            .get(name)
            .or_else(|| self.include_env.then(|| EnvProperties.get(name)).flatten())
    }
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StoreReport {
    /// Absent when an optional output could not be stored anywhere.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub warnings: Vec<JobWarning>,
}

#[derive(Debug, Serialize)]
pub struct ArtifactEntry {
    pub track: u32,
    pub frame: u32,
    pub uri: String,
}

#[derive(Debug, Serialize)]
pub struct ArtifactsReport {
    pub artifacts: Vec<ArtifactEntry>,
    pub warnings: Vec<JobWarning>,
}

#[derive(Debug, Serialize)]
pub struct CopyEntry {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CopyReport {
    pub complete: bool,
    pub items: Vec<CopyEntry>,
}

#[derive(Debug, Serialize)]
pub struct DownloadReport {
    pub path: String,
    pub bytes: u64,
}

/// Outcome of one command, printed as JSON.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Report {
    Store(StoreReport),
    Artifacts(ArtifactsReport),
    Copy(CopyReport),
    Download(DownloadReport),
}

impl Report {
    /// Whether the command did everything it was asked to.
    pub fn is_success(&self) -> bool {
        match self {
            Report::Store(report) => report.uri.is_some(),
            Report::Copy(report) => report.complete,
            _ => true,
        }
    }
}

// ============================================================================
// Application
// ============================================================================

/// Storage stack for one process.
pub struct StoreApp {
    router: StorageRouter,
    s3: Arc<S3Backend>,
    warnings: Arc<InMemoryWarningSink>,
}

impl StoreApp {
    /// Build against real S3 endpoints, with the optional static auth token
    /// from the environment.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let token = StaticTokenProvider::from_env().context("Invalid S3 token configuration")?;
        let token: Option<Arc<dyn TokenProvider>> = match token {
            Some(provider) => Some(Arc::new(provider)),
            None => None,
        };
        Ok(Self::with_factory(
            config,
            Arc::new(AwsClientFactory::new(config, token)),
        ))
    }

    /// Build with a caller-supplied S3 client factory.
    pub fn with_factory(config: &StorageConfig, factory: Arc<dyn ClientFactory>) -> Self {
        let warnings = Arc::new(InMemoryWarningSink::new());
        let cache = Arc::new(ClientCache::from_config(config, factory));
        let s3 = Arc::new(S3Backend::new(config, cache, warnings.clone()));
        let router = StorageRouter::new(
            LocalBackend::new(&config.local_storage_dir),
            warnings.clone(),
        )
        .with_backend(s3.clone())
        .with_backend(Arc::new(HttpMultipartBackend::new(config, warnings.clone())));

        Self {
            router,
            s3,
            warnings,
        }
    }

    pub async fn execute(&self, command: Command, props: Arc<dyn PropertyLookup>) -> Result<Report> {
        match command {
            Command::Store {
                file,
                job,
                kind,
                media,
                name,
            } => {
                let mut request =
                    StoreRequest::new(JobId::from(job), kind.into(), file.clone(), props);
                if let Some(media) = media {
                    request = request.with_media(MediaId(media));
                }
                if let Some(name) = name {
                    request = request.with_file_name(name);
                }

                match self.router.store(&request).await {
                    Ok(uri) => {
                        info!(job_id = %request.job_id, uri = %uri, "Stored output");
                        Ok(Report::Store(StoreReport {
                            uri: Some(uri.to_string()),
                            error: None,
                            warnings: self.warnings.drain(),
                        }))
                    }
                    Err(e) if !request.kind.is_mandatory() => {
                        warn!(
                            job_id = %request.job_id,
                            kind = %request.kind,
                            "Optional output was not stored: {}",
                            e
                        );
                        Ok(Report::Store(StoreReport {
                            uri: None,
                            error: Some(e.to_string()),
                            warnings: self.warnings.drain(),
                        }))
                    }
                    Err(e) => Err(anyhow::Error::new(e)
                        .context(format!("Failed to store {}", file.display()))),
                }
            }

            Command::Artifacts {
                job,
                media,
                action,
                artifacts,
                expected,
                extension,
            } => {
                let mut request = ArtifactRequest::new(JobId::from(job), MediaId(media), action, props)
                    .expecting(expected);
                request.extension = extension;
                let extractor = FileArtifactExtractor::new(artifacts);

                let uris = self
                    .router
                    .store_artifacts(&request, &extractor)
                    .await
                    .context("Failed to store artifacts")?;
                info!(job_id = %request.job_id, count = uris.len(), "Stored artifacts");
                Ok(Report::Artifacts(ArtifactsReport {
                    artifacts: uris
                        .into_iter()
                        .map(|(key, uri)| artifact_entry(key, &uri))
                        .collect(),
                    warnings: self.warnings.drain(),
                }))
            }

            Command::Copy { uris } => {
                let results = self
                    .s3
                    .copy_results(&uris, props.as_ref())
                    .await
                    .context("Failed to copy results")?;
                if !results.is_complete() {
                    warn!(failed = results.failed.len(), "Some results were not copied");
                }
                let items = uris
                    .iter()
                    .map(|source| CopyEntry {
                        source: source.to_string(),
                        destination: results.destination_of(source).map(|d| d.to_string()),
                        error: results.failed.get(source).map(|e| e.to_string()),
                    })
                    .collect();
                Ok(Report::Copy(CopyReport {
                    complete: results.is_complete(),
                    items,
                }))
            }

            Command::Download { uri, destination } => {
                let bytes = self
                    .s3
                    .download_media(&uri, props.as_ref(), &destination)
                    .await
                    .with_context(|| format!("Failed to download {}", uri))?;
                info!(uri = %uri, bytes, "Downloaded media");
                Ok(Report::Download(DownloadReport {
                    path: destination.display().to_string(),
                    bytes,
                }))
            }
        }
    }
}

fn artifact_entry(key: ArtifactKey, uri: &Url) -> ArtifactEntry {
    ArtifactEntry {
        track: key.track_index,
        frame: key.frame_index,
        uri: uri.to_string(),
    }
}

/// Parse-to-report entry point used by the binary.
pub async fn run(cli: Cli) -> Result<Report> {
    let mut config = StorageConfig::from_env();
    if let Some(dir) = cli.storage_dir {
        config.local_storage_dir = dir;
    }
    let props: Arc<dyn PropertyLookup> =
        Arc::new(LayeredProperties::new(&cli.properties, !cli.no_env));

    let app = StoreApp::from_config(&config)?;
    app.execute(cli.command, props).await
}
