//! Extra authentication header added to S3 requests after SigV4 signing.
//!
//! Some object stores sit behind a gateway that wants its own token next to
//! the SigV4 signature. The header is attached in `modify_before_transmit`,
//! so it is never part of the signed header set.

use std::fmt;
use std::sync::Arc;

use aws_sdk_s3::config::interceptors::BeforeTransmitInterceptorContextMut;
use aws_sdk_s3::config::{ConfigBag, Intercept, RuntimeComponents};
use aws_sdk_s3::error::BoxError;

use crate::error::{StorageError, StorageResult};

/// Header used when none is configured.
pub const DEFAULT_TOKEN_HEADER: &str = "X-Auth-Token";

/// A header name and value to send with each request.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub header: String,
    pub value: String,
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("header", &self.header)
            .field("value", &"***")
            .finish()
    }
}

/// Source of the token attached to outgoing S3 requests.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> StorageResult<AuthToken>;
}

/// Token fixed at startup.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: AuthToken,
}

impl StaticTokenProvider {
    pub fn new(header: impl Into<String>, value: impl Into<String>) -> StorageResult<Self> {
        let header = header.into();
        if header.trim().is_empty() || header.eq_ignore_ascii_case("authorization") {
            return Err(StorageError::config(format!(
                "\"{}\" cannot be used as the S3 token header",
                header
            )));
        }
        Ok(Self {
            token: AuthToken {
                header,
                value: value.into(),
            },
        })
    }

    /// Reads `MPF_S3_TOKEN` and `MPF_S3_TOKEN_HEADER`. `None` when no token
    /// is configured.
    pub fn from_env() -> StorageResult<Option<Self>> {
        let value = match std::env::var("MPF_S3_TOKEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
        {
            Some(v) => v,
            None => return Ok(None),
        };
        let header = std::env::var("MPF_S3_TOKEN_HEADER")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN_HEADER.to_string());
        Self::new(header, value).map(Some)
    }
}

impl TokenProvider for StaticTokenProvider {
    fn token(&self) -> StorageResult<AuthToken> {
        Ok(self.token.clone())
    }
}

/// SDK interceptor that adds the provider's header to the signed request.
pub struct AuthHeaderInterceptor {
    provider: Arc<dyn TokenProvider>,
}

impl AuthHeaderInterceptor {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self { provider }
    }
}

impl fmt::Debug for AuthHeaderInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthHeaderInterceptor").finish_non_exhaustive()
    }
}

impl Intercept for AuthHeaderInterceptor {
    fn name(&self) -> &'static str {
        "AuthHeaderInterceptor"
    }

    fn modify_before_transmit(
        &self,
        context: &mut BeforeTransmitInterceptorContextMut<'_>,
        _runtime_components: &RuntimeComponents,
        _cfg: &mut ConfigBag,
    ) -> Result<(), BoxError> {
        let token = self.provider.token()?;
        context
            .request_mut()
            .headers_mut()
            .insert(token.header, token.value);
        Ok(())
    }
}
