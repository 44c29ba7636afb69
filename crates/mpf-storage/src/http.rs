//! Retrying HTTP client for the multipart upload service.

use std::fmt;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::retry::{self, RetryDecision, RetryPolicy};

/// Failure of a single attempt.
#[derive(Debug)]
enum AttemptError {
    /// The request could not be built; never retried.
    Build(StorageError),
    Network(reqwest::Error),
    Status { status: StatusCode, url: String },
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Build(e) => write!(f, "{}", e),
            AttemptError::Network(e) => write!(f, "{}", e),
            AttemptError::Status { status, url } => {
                write!(f, "HTTP request for {} failed with status: {}", url, status)
            }
        }
    }
}

fn classify(err: &AttemptError) -> RetryDecision {
    match err {
        AttemptError::Build(_) => RetryDecision::Stop,
        AttemptError::Network(_) | AttemptError::Status { .. } => RetryDecision::Retry,
    }
}

/// Build the underlying reqwest client. Clones share its connection pool.
pub fn build_client(
    pool_size: usize,
    connect_timeout: Duration,
    request_timeout: Duration,
) -> StorageResult<Client> {
    Client::builder()
        .pool_max_idle_per_host(pool_size)
        .connect_timeout(connect_timeout)
        .timeout(request_timeout)
        .build()
        .map_err(|e| StorageError::config(format!("Failed to build HTTP client: {}", e)))
}

/// reqwest client that retries network failures and non-2xx responses.
#[derive(Debug, Clone)]
pub struct RetryingHttpClient {
    client: Client,
    policy: RetryPolicy,
}

impl RetryingHttpClient {
    /// Build a client whose connection pool holds up to `pool_size` idle
    /// connections per host.
    pub fn new(
        policy: RetryPolicy,
        pool_size: usize,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> StorageResult<Self> {
        let client = build_client(pool_size, connect_timeout, request_timeout)?;
        Ok(Self { client, policy })
    }

    pub fn with_client(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send the request built by `build` until it returns a 2xx response.
    ///
    /// `build` runs once per attempt, so request bodies that cannot be
    /// cloned (multipart forms) are recreated for every retry.
    pub async fn execute<F>(&self, operation: &str, build: F) -> StorageResult<Response>
    where
        F: Fn(&Client) -> StorageResult<RequestBuilder>,
    {
        let result = retry::execute(
            &self.policy,
            operation,
            |_| {
                let request = build(&self.client);
                async move {
                    let request = request.map_err(AttemptError::Build)?;
                    let response = request.send().await.map_err(AttemptError::Network)?;
                    let status = response.status();
                    if status.is_success() {
                        debug!(operation = %operation, status = status.as_u16(), "HTTP request succeeded");
                        Ok(response)
                    } else {
                        Err(AttemptError::Status {
                            status,
                            url: response.url().to_string(),
                        })
                    }
                }
            },
            classify,
        )
        .await;

        result.map_err(|failure| match failure.error {
            AttemptError::Build(e) => e,
            other => StorageError::transport(operation, failure.attempts, other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(max_retries: u32) -> RetryingHttpClient {
        RetryingHttpClient::new(
            RetryPolicy::immediate(max_retries),
            2,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/flaky", server.uri());
        let response = client(2)
            .execute("flaky", |c| Ok(c.post(&url)))
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_exhaustion_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let url = format!("{}/down", server.uri());
        let err = client(2)
            .execute("down", |c| Ok(c.post(&url)))
            .await
            .unwrap_err();
        match err {
            StorageError::Transport {
                operation,
                attempts,
                message,
            } => {
                assert_eq!(operation, "down");
                assert_eq!(attempts, 3);
                assert!(message.contains("500"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_build_errors_are_not_retried() {
        let err = client(5)
            .execute("bad", |_| Err(StorageError::protocol("cannot build")))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Protocol(_)));
    }
}
