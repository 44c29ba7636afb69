//! Remote artifact storage.
//!
//! This crate provides:
//! - Content-addressed uploads to S3-compatible object storage
//! - Cross-bucket / cross-account copy of stored results
//! - A chunked multipart HTTP upload client with parallel segment workers
//! - Local filesystem storage used as the fallback for every remote backend
//! - [`StorageRouter`], which picks a backend per request and falls back to
//!   local storage when the remote one fails

pub mod addressing;
pub mod artifacts;
pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hashing;
pub mod http;
pub mod local;
pub mod metrics;
pub mod multipart;
pub mod retry;
pub mod router;
pub mod s3;
pub mod warnings;

pub use addressing::UrlStyle;
pub use artifacts::{ArtifactExtractor, ArtifactStream, ExtractedArtifact};
pub use backend::{ArtifactRequest, ArtifactUris, ByteSource, StorageBackend, StoreRequest};
pub use config::{StorageConfig, UploadSettings};
pub use dispatcher::{Segment, SegmentDispatcher, SegmentResult};
pub use error::{StorageError, StorageResult};
pub use hashing::ContentKey;
pub use local::LocalBackend;
pub use multipart::HttpMultipartBackend;
pub use retry::{RetryDecision, RetryFailure, RetryPolicy};
pub use router::StorageRouter;
pub use s3::{ClientCache, CopyResults, S3Backend};
pub use warnings::{InMemoryWarningSink, JobWarning, TracingWarningSink, WarningSink};
