//! Storage configuration.
//!
//! Process-wide defaults come from `MPF_*` environment variables. A job's
//! properties may override the upload tuning knobs, see
//! [`UploadSettings::resolve`].

use std::path::PathBuf;
use std::time::Duration;

use mpf_models::{props, PropertyLookup, PropertyLookupExt};

use crate::error::{StorageError, StorageResult};

/// Upload tuning shared by the remote backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSettings {
    /// Concurrent segment workers per multipart upload
    pub thread_count: usize,
    /// Bytes per multipart segment
    pub segment_size: usize,
    /// Retries per request after the first attempt
    pub retry_count: u32,
    /// Concurrent items per artifact or copy batch
    pub parallel_upload_count: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            thread_count: 8,
            segment_size: 8 * 1024 * 1024, // 8 MiB
            retry_count: 5,
            parallel_upload_count: 10,
        }
    }
}

impl UploadSettings {
    /// Apply the job's `STORAGE_*` overrides on top of these defaults.
    ///
    /// A present but malformed or zero value is a configuration error.
    pub fn resolve(&self, props: &dyn PropertyLookup) -> StorageResult<UploadSettings> {
        let thread_count = props
            .get_parsed::<usize>(props::UPLOAD_THREAD_COUNT)?
            .unwrap_or(self.thread_count);
        let segment_size = props
            .get_parsed::<usize>(props::UPLOAD_SEGMENT_SIZE)?
            .unwrap_or(self.segment_size);
        let retry_count = props
            .get_parsed::<u32>(props::UPLOAD_RETRY_COUNT)?
            .unwrap_or(self.retry_count);
        let parallel_upload_count = props
            .get_parsed::<usize>(props::PARALLEL_UPLOAD_COUNT)?
            .unwrap_or(self.parallel_upload_count);

        for (name, value) in [
            (props::UPLOAD_THREAD_COUNT, thread_count),
            (props::UPLOAD_SEGMENT_SIZE, segment_size),
            (props::PARALLEL_UPLOAD_COUNT, parallel_upload_count),
        ] {
            if value == 0 {
                return Err(StorageError::config(format!("{} must be at least 1", name)));
            }
        }

        Ok(UploadSettings {
            thread_count,
            segment_size,
            retry_count,
            parallel_upload_count,
        })
    }
}

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for local storage
    pub local_storage_dir: PathBuf,
    /// Default upload tuning
    pub upload: UploadSettings,
    /// TCP connect timeout for every remote call
    pub connect_timeout: Duration,
    /// Per-request timeout for every remote call
    pub request_timeout: Duration,
    /// Cached S3 clients unused for this long are evicted
    pub client_cache_idle_timeout: Duration,
    /// Maximum number of cached S3 clients
    pub client_cache_max_size: usize,
    /// Whole-copy retries when a streamed copy is interrupted
    pub copy_retry_count: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_storage_dir: PathBuf::from("./share"),
            upload: UploadSettings::default(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300), // 5 minutes
            client_cache_idle_timeout: Duration::from_secs(600), // 10 minutes
            client_cache_max_size: 32,
            copy_retry_count: 3,
        }
    }
}

impl StorageConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            local_storage_dir: std::env::var("MPF_LOCAL_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.local_storage_dir),
            upload: UploadSettings {
                thread_count: std::env::var("MPF_UPLOAD_THREAD_COUNT")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(defaults.upload.thread_count),
                segment_size: std::env::var("MPF_UPLOAD_SEGMENT_SIZE")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(defaults.upload.segment_size),
                retry_count: std::env::var("MPF_UPLOAD_RETRY_COUNT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.upload.retry_count),
                parallel_upload_count: std::env::var("MPF_PARALLEL_UPLOAD_COUNT")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(defaults.upload.parallel_upload_count),
            },
            connect_timeout: Duration::from_secs(
                std::env::var("MPF_CONNECT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            ),
            request_timeout: Duration::from_secs(
                std::env::var("MPF_REQUEST_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            client_cache_idle_timeout: Duration::from_secs(
                std::env::var("MPF_S3_CLIENT_IDLE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            ),
            client_cache_max_size: std::env::var("MPF_S3_CLIENT_CACHE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(32),
            copy_retry_count: std::env::var("MPF_S3_COPY_RETRY_COUNT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
        }
    }
}
