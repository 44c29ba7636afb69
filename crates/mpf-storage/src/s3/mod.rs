//! S3-compatible object storage.
//!
//! - [`client`]: one-attempt object operations behind [`ObjectClient`]
//! - [`cache`]: clients shared per endpoint, region and retry count
//! - [`copy`]: source/destination settings for copying results
//! - [`backend`]: the [`S3Backend`] storage backend
//! - [`memory`]: an in-memory [`ObjectClient`]

pub mod backend;
pub mod cache;
pub mod client;
pub mod copy;
pub mod memory;
pub mod signing;

pub use backend::{requires_media_download, requires_result_upload, S3Backend};
pub use cache::{AwsClientFactory, ClientCache, ClientFactory, ClientHandle, ClientKey};
pub use client::{AwsObjectClient, ObjectClient, RequestAuth, S3RequestError};
pub use copy::{CopyConfig, CopyResults};
pub use memory::{InMemoryClientFactory, InMemoryObjectClient, ObjectOp};
pub use signing::{StaticTokenProvider, TokenProvider};
