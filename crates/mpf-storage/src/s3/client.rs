//! Object client seam for S3-compatible storage.
//!
//! [`ObjectClient`] performs exactly one attempt per call. Retries are applied
//! by the caller through [`crate::retry`] using [`classify`], so the same
//! policy covers the AWS client and the in-memory client used by tests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::Builder;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use mpf_models::{props, PropertyLookup, PropertyLookupExt};
use tracing::debug;

use super::signing::{AuthHeaderInterceptor, TokenProvider};
use crate::error::{StorageError, StorageResult};
use crate::retry::{RetryDecision, RetryFailure};

/// Region used when the job does not configure one.
pub const DEFAULT_REGION: &str = "us-east-1";

const INCOMPLETE_BODY_CODE: &str = "IncompleteBody";

// =============================================================================
// Request credentials
// =============================================================================

/// Credentials attached to each request rather than to the client, so one
/// cached client serves every set of credentials for its endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct RequestAuth {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    /// Append the token from the configured [`TokenProvider`] after signing.
    pub add_token: bool,
}

impl RequestAuth {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            session_token: None,
            add_token: false,
        }
    }

    /// Credentials from `S3_ACCESS_KEY`, `S3_SECRET_KEY` and
    /// `S3_SESSION_TOKEN`. Both keys are required.
    pub fn from_properties(props: &dyn PropertyLookup) -> StorageResult<Self> {
        Self::from_values(
            props.get_non_blank(props::S3_ACCESS_KEY),
            props.get_non_blank(props::S3_SECRET_KEY),
            props.get_non_blank(props::S3_SESSION_TOKEN),
            props.get_bool(props::S3_ADD_TOKEN),
        )
    }

    pub fn from_values(
        access_key: Option<String>,
        secret_key: Option<String>,
        session_token: Option<String>,
        add_token: bool,
    ) -> StorageResult<Self> {
        match (access_key, secret_key) {
            (Some(access_key), Some(secret_key)) => Ok(Self {
                access_key,
                secret_key,
                session_token: session_token.filter(|t| !t.trim().is_empty()),
                add_token,
            }),
            _ => Err(StorageError::config(format!(
                "Both {} and {} are required to access S3.",
                props::S3_ACCESS_KEY,
                props::S3_SECRET_KEY
            ))),
        }
    }

    fn credentials(&self) -> Credentials {
        Credentials::new(
            &self.access_key,
            &self.secret_key,
            self.session_token.clone(),
            None,
            "mpf-job-properties",
        )
    }
}

impl fmt::Debug for RequestAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestAuth")
            .field("access_key", &self.access_key)
            .field("secret_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .field("add_token", &self.add_token)
            .finish()
    }
}

// =============================================================================
// Errors and classification
// =============================================================================

/// Failure of a single S3 request.
#[derive(Debug, Clone)]
pub enum S3RequestError {
    /// The service answered with a non-2xx status.
    Status {
        status: u16,
        code: Option<String>,
        message: String,
    },
    /// Connect/read failure or timeout.
    Network(String),
    /// The request could not be built or its local body could not be read.
    Request(String),
}

impl S3RequestError {
    pub fn status(status: u16, code: Option<&str>, message: impl Into<String>) -> Self {
        S3RequestError::Status {
            status,
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            S3RequestError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// HTTP 400 `IncompleteBody`: the request body ended before its declared
    /// length.
    pub fn is_incomplete_body(&self) -> bool {
        matches!(
            self,
            S3RequestError::Status { status: 400, code: Some(code), .. } if code == INCOMPLETE_BODY_CODE
        )
    }
}

impl fmt::Display for S3RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            S3RequestError::Status {
                status,
                code,
                message,
            } => match code {
                Some(code) => write!(f, "S3 responded with {} ({}): {}", status, code, message),
                None => write!(f, "S3 responded with {}: {}", status, message),
            },
            S3RequestError::Network(msg) => write!(f, "S3 request failed: {}", msg),
            S3RequestError::Request(msg) => write!(f, "Could not send S3 request: {}", msg),
        }
    }
}

impl<E> From<SdkError<E, HttpResponse>> for S3RequestError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    fn from(err: SdkError<E, HttpResponse>) -> Self {
        let message = DisplayErrorContext(&err).to_string();
        match &err {
            SdkError::ServiceError(ctx) => S3RequestError::Status {
                status: ctx.raw().status().as_u16(),
                code: ctx.err().code().map(str::to_string),
                message,
            },
            SdkError::ResponseError(ctx) => S3RequestError::Status {
                status: ctx.raw().status().as_u16(),
                code: None,
                message,
            },
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
                S3RequestError::Network(message)
            }
            _ => S3RequestError::Request(message),
        }
    }
}

/// What a request is for; changes how its failures are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// HEAD before an upload. A 404 is the expected "absent" answer.
    ExistenceCheck,
    /// PUT whose body is streamed from a source GET.
    CopyDestinationPut,
    Other,
}

/// Network failures and non-2xx statuses are retried, except a 404 on an
/// existence check and an `IncompleteBody` on a copy-destination PUT. The
/// latter is retried by the copy loop with its own budget.
pub fn classify(err: &S3RequestError, kind: RequestKind) -> RetryDecision {
    match err {
        S3RequestError::Request(_) => RetryDecision::Stop,
        S3RequestError::Network(_) => RetryDecision::Retry,
        S3RequestError::Status { status, .. } => {
            if kind == RequestKind::ExistenceCheck && *status == 404 {
                RetryDecision::Stop
            } else if kind == RequestKind::CopyDestinationPut && err.is_incomplete_body() {
                RetryDecision::Stop
            } else {
                RetryDecision::Retry
            }
        }
    }
}

/// Convert the outcome of a retried S3 request into the crate error.
pub fn into_storage_error(
    failure: RetryFailure<S3RequestError>,
    operation: &str,
    kind: RequestKind,
) -> StorageError {
    if kind == RequestKind::CopyDestinationPut && failure.error.is_incomplete_body() {
        return StorageError::CopyInterrupted(format!("{}: {}", operation, failure.error));
    }
    StorageError::transport(operation, failure.attempts, failure.error.to_string())
}

// =============================================================================
// Client seam
// =============================================================================

/// Body of a GET response.
pub struct ObjectBody {
    pub content_length: Option<i64>,
    pub body: ByteStream,
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// One attempt at each object operation the storage layer needs.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// HEAD. A 404 answers `Ok(false)`.
    async fn object_exists(
        &self,
        bucket: &str,
        key: &str,
        auth: &RequestAuth,
    ) -> Result<bool, S3RequestError>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        content_length: Option<i64>,
        auth: &RequestAuth,
    ) -> Result<(), S3RequestError>;

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        auth: &RequestAuth,
    ) -> Result<ObjectBody, S3RequestError>;

    /// Server-side copy within one endpoint and one set of credentials.
    async fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        destination_bucket: &str,
        destination_key: &str,
        auth: &RequestAuth,
    ) -> Result<(), S3RequestError>;
}

/// `CopySource` header value: `bucket/key` with the key percent-encoded.
pub fn copy_source(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket, urlencoding::encode(key).replace("%2F", "/"))
}

// =============================================================================
// AWS SDK implementation
// =============================================================================

/// [`ObjectClient`] backed by `aws-sdk-s3`.
///
/// The SDK's own retries are disabled; retries happen in [`crate::retry`].
#[derive(Clone)]
pub struct AwsObjectClient {
    client: Client,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl AwsObjectClient {
    pub fn new(
        endpoint: &str,
        region: Option<&str>,
        connect_timeout: Duration,
        read_timeout: Duration,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> Self {
        let timeouts = TimeoutConfig::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build();

        let sdk_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(endpoint)
            .region(Region::new(region.unwrap_or(DEFAULT_REGION).to_string()))
            .force_path_style(true)
            .retry_config(RetryConfig::disabled())
            .timeout_config(timeouts)
            .build();

        Self {
            client: Client::from_conf(sdk_config),
            token_provider,
        }
    }

    /// Per-request configuration: credentials, plus the token header
    /// interceptor when requested.
    fn request_config(&self, auth: &RequestAuth) -> Builder {
        let mut builder = Builder::new().credentials_provider(auth.credentials());
        if auth.add_token {
            if let Some(provider) = &self.token_provider {
                builder = builder.interceptor(AuthHeaderInterceptor::new(provider.clone()));
            }
        }
        builder
    }
}

impl fmt::Debug for AwsObjectClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsObjectClient")
            .field("token_provider", &self.token_provider.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ObjectClient for AwsObjectClient {
    async fn object_exists(
        &self,
        bucket: &str,
        key: &str,
        auth: &RequestAuth,
    ) -> Result<bool, S3RequestError> {
        let result = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .customize()
            .config_override(self.request_config(auth))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = S3RequestError::from(err);
                if err.status_code() == Some(404) {
                    debug!(bucket = %bucket, key = %key, "Object does not exist");
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        content_length: Option<i64>,
        auth: &RequestAuth,
    ) -> Result<(), S3RequestError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .set_content_length(content_length)
            .customize()
            .config_override(self.request_config(auth))
            .send()
            .await?;
        Ok(())
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        auth: &RequestAuth,
    ) -> Result<ObjectBody, S3RequestError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .customize()
            .config_override(self.request_config(auth))
            .send()
            .await?;

        Ok(ObjectBody {
            content_length: output.content_length(),
            body: output.body,
        })
    }

    async fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        destination_bucket: &str,
        destination_key: &str,
        auth: &RequestAuth,
    ) -> Result<(), S3RequestError> {
        self.client
            .copy_object()
            .copy_source(copy_source(source_bucket, source_key))
            .bucket(destination_bucket)
            .key(destination_key)
            .customize()
            .config_override(self.request_config(auth))
            .send()
            .await?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mpf_models::MapProperties;

    #[test]
    fn test_auth_requires_both_keys() {
        let props = MapProperties::new()
            .with(props::S3_ACCESS_KEY, "AKIA")
            .with(props::S3_SECRET_KEY, "secret")
            .with(props::S3_SESSION_TOKEN, " ")
            .with(props::S3_ADD_TOKEN, "true");
        let auth = RequestAuth::from_properties(&props).unwrap();
        assert_eq!(auth.access_key, "AKIA");
        assert_eq!(auth.session_token, None);
        assert!(auth.add_token);

        let props = MapProperties::new().with(props::S3_ACCESS_KEY, "AKIA");
        assert!(RequestAuth::from_properties(&props).unwrap_err().is_config_error());
    }

    #[test]
    fn test_auth_debug_hides_secrets() {
        let mut auth = RequestAuth::new("AKIA", "very-secret");
        auth.session_token = Some("token-value".to_string());
        let debug = format!("{:?}", auth);
        assert!(!debug.contains("very-secret"));
        assert!(!debug.contains("token-value"));
    }

    #[test]
    fn test_existence_check_404_is_not_retried() {
        let not_found = S3RequestError::status(404, Some("NotFound"), "missing");
        assert_eq!(
            classify(&not_found, RequestKind::ExistenceCheck),
            RetryDecision::Stop
        );
        assert_eq!(classify(&not_found, RequestKind::Other), RetryDecision::Retry);
    }

    #[test]
    fn test_incomplete_body_only_special_for_copy_destination() {
        let incomplete = S3RequestError::status(400, Some("IncompleteBody"), "short body");
        assert_eq!(
            classify(&incomplete, RequestKind::CopyDestinationPut),
            RetryDecision::Stop
        );
        assert_eq!(classify(&incomplete, RequestKind::Other), RetryDecision::Retry);

        let failure = RetryFailure {
            attempts: 1,
            exhausted: false,
            error: incomplete,
        };
        let err = into_storage_error(failure, "PUT dest", RequestKind::CopyDestinationPut);
        assert!(matches!(err, StorageError::CopyInterrupted(_)));
    }

    #[test]
    fn test_network_and_server_errors_retry() {
        assert_eq!(
            classify(&S3RequestError::Network("reset".into()), RequestKind::Other),
            RetryDecision::Retry
        );
        assert_eq!(
            classify(&S3RequestError::status(503, None, "slow down"), RequestKind::Other),
            RetryDecision::Retry
        );
        assert_eq!(
            classify(&S3RequestError::Request("bad".into()), RequestKind::Other),
            RetryDecision::Stop
        );
    }

    #[test]
    fn test_exhaustion_maps_to_transport_error() {
        let failure = RetryFailure {
            attempts: 6,
            exhausted: true,
            error: S3RequestError::status(500, Some("InternalError"), "oops"),
        };
        match into_storage_error(failure, "S3 PUT", RequestKind::Other) {
            StorageError::Transport { attempts, message, .. } => {
                assert_eq!(attempts, 6);
                assert!(message.contains("InternalError"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_copy_source_encoding() {
        assert_eq!(copy_source("results", "ab/cd/abcd"), "results/ab/cd/abcd");
        assert_eq!(
            copy_source("results", "prefix/with space.json"),
            "results/prefix/with%20space.json"
        );
    }
}
