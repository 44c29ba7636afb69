//! In-memory object store.
//!
//! Speaks the [`ObjectClient`] seam without a network, records every call
//! and can be told to fail specific operations. Used by the test suites and
//! for dry runs of the CLI.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;

use super::cache::{ClientFactory, ClientKey};
use super::client::{ObjectBody, ObjectClient, RequestAuth, S3RequestError};
use crate::error::StorageResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectOp {
    Head,
    Put,
    Get,
    Copy,
}

/// One recorded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub op: ObjectOp,
    pub bucket: String,
    pub key: String,
    pub access_key: String,
}

#[derive(Default)]
struct Store {
    objects: HashMap<(String, String), Bytes>,
    calls: Vec<RecordedCall>,
    queued_failures: HashMap<ObjectOp, VecDeque<S3RequestError>>,
    permanent_failures: HashMap<ObjectOp, S3RequestError>,
}

impl Store {
    fn record(
        &mut self,
        op: ObjectOp,
        bucket: &str,
        key: &str,
        auth: &RequestAuth,
    ) -> Result<(), S3RequestError> {
        self.calls.push(RecordedCall {
            op,
            bucket: bucket.to_string(),
            key: key.to_string(),
            access_key: auth.access_key.clone(),
        });
        if let Some(err) = self.queued_failures.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        if let Some(err) = self.permanent_failures.get(&op) {
            return Err(err.clone());
        }
        Ok(())
    }
}

/// Thread-safe fake object store.
#[derive(Default)]
pub struct InMemoryObjectClient {
    store: Mutex<Store>,
}

impl InMemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.lock()
            .objects
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: ObjectOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Fail the next call of `op` with `err`. Queued failures are used up
    /// in order before any permanent failure applies.
    pub fn fail_next(&self, op: ObjectOp, err: S3RequestError) {
        self.lock()
            .queued_failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Fail every call of `op` with `err`.
    pub fn fail_always(&self, op: ObjectOp, err: S3RequestError) {
        self.lock().permanent_failures.insert(op, err);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn no_such_key(bucket: &str, key: &str) -> S3RequestError {
    S3RequestError::status(
        404,
        Some("NoSuchKey"),
        format!("{}/{} does not exist", bucket, key),
    )
}

#[async_trait]
impl ObjectClient for InMemoryObjectClient {
    async fn object_exists(
        &self,
        bucket: &str,
        key: &str,
        auth: &RequestAuth,
    ) -> Result<bool, S3RequestError> {
        let mut store = self.lock();
        match store.record(ObjectOp::Head, bucket, key, auth) {
            Err(err) if err.status_code() == Some(404) => Ok(false),
            Err(err) => Err(err),
            Ok(()) => Ok(store
                .objects
                .contains_key(&(bucket.to_string(), key.to_string()))),
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
        self.lock().record(ObjectOp::Put, bucket, key, auth)?;

        let data = body
            .collect()
            .await
            .map_err(|e| S3RequestError::Network(e.to_string()))?
            .into_bytes();

        if let Some(expected) = content_length {
            if data.len() as i64 != expected {
                return Err(S3RequestError::status(
                    400,
                    Some("IncompleteBody"),
                    format!("expected {} bytes, received {}", expected, data.len()),
                ));
            }
        }

        self.lock()
            .objects
            .insert((bucket.to_string(), key.to_string()), data);
        Ok(())
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        auth: &RequestAuth,
    ) -> Result<ObjectBody, S3RequestError> {
        let mut store = self.lock();
        store.record(ObjectOp::Get, bucket, key, auth)?;
        let data = store
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| no_such_key(bucket, key))?;
        Ok(ObjectBody {
            content_length: Some(data.len() as i64),
            body: ByteStream::from(data),
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
        let mut store = self.lock();
        store.record(ObjectOp::Copy, destination_bucket, destination_key, auth)?;
        let data = store
            .objects
            .get(&(source_bucket.to_string(), source_key.to_string()))
            .cloned()
            .ok_or_else(|| no_such_key(source_bucket, source_key))?;
        store.objects.insert(
            (destination_bucket.to_string(), destination_key.to_string()),
            data,
        );
        Ok(())
    }
}

/// Hands out the same in-memory client for every endpoint.
#[derive(Clone)]
pub struct InMemoryClientFactory {
    client: Arc<InMemoryObjectClient>,
    created: Arc<Mutex<Vec<ClientKey>>>,
}

impl InMemoryClientFactory {
    pub fn new(client: Arc<InMemoryObjectClient>) -> Self {
        Self {
            client,
            created: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Keys a client was requested for, in order.
    pub fn created_keys(&self) -> Vec<ClientKey> {
        self.created
            .lock()
            .map(|keys| keys.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

impl ClientFactory for InMemoryClientFactory {
    fn create(&self, key: &ClientKey) -> StorageResult<Arc<dyn ObjectClient>> {
        if let Ok(mut created) = self.created.lock() {
            created.push(key.clone());
        }
        Ok(self.client.clone())
    }
}
