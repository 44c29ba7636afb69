//! Shared S3 clients.
//!
//! Clients hold connection pools, so one is kept per
//! `(endpoint, region, retry count)` and reused by every job that targets
//! the same store. Credentials travel with each request, which is what makes
//! sharing safe.
//!
//! Entries unused for longer than the idle timeout are dropped on the next
//! lookup. When the cache is full the least recently used entry goes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::client::{AwsObjectClient, ObjectClient};
use super::signing::TokenProvider;
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::retry::RetryPolicy;

/// Identity of a cached client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    /// `scheme://host[:port]`, without a trailing slash.
    pub endpoint: String,
    pub region: Option<String>,
    pub retry_count: u32,
}

impl ClientKey {
    pub fn new(endpoint: impl Into<String>, region: Option<String>, retry_count: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            region: region.filter(|r| !r.trim().is_empty()),
            retry_count,
        }
    }
}

/// A client plus the retry policy requests through it follow.
pub struct ClientHandle {
    key: ClientKey,
    client: Arc<dyn ObjectClient>,
    retry: RetryPolicy,
}

impl ClientHandle {
    pub fn new(key: ClientKey, client: Arc<dyn ObjectClient>, retry: RetryPolicy) -> Self {
        Self { key, client, retry }
    }

    pub fn key(&self) -> &ClientKey {
        &self.key
    }

    pub fn client(&self) -> &dyn ObjectClient {
        self.client.as_ref()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("key", &self.key)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Builds clients on a cache miss.
pub trait ClientFactory: Send + Sync {
    fn create(&self, key: &ClientKey) -> StorageResult<Arc<dyn ObjectClient>>;

    /// Retry policy for a client created for `key`.
    fn retry_policy(&self, key: &ClientKey) -> RetryPolicy {
        RetryPolicy::s3(key.retry_count)
    }
}

/// Creates [`AwsObjectClient`]s.
pub struct AwsClientFactory {
    connect_timeout: Duration,
    request_timeout: Duration,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl AwsClientFactory {
    pub fn new(config: &StorageConfig, token_provider: Option<Arc<dyn TokenProvider>>) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            token_provider,
        }
    }
}

impl ClientFactory for AwsClientFactory {
    fn create(&self, key: &ClientKey) -> StorageResult<Arc<dyn ObjectClient>> {
        if key.endpoint.is_empty() {
            return Err(StorageError::config("Cannot create an S3 client without an endpoint."));
        }
        Ok(Arc::new(AwsObjectClient::new(
            &key.endpoint,
            key.region.as_deref(),
            self.connect_timeout,
            self.request_timeout,
            self.token_provider.clone(),
        )))
    }
}

struct CacheEntry {
    handle: Arc<ClientHandle>,
    last_used: Instant,
}

/// Bounded, idle-expiring cache of [`ClientHandle`]s.
pub struct ClientCache {
    factory: Arc<dyn ClientFactory>,
    entries: Mutex<HashMap<ClientKey, CacheEntry>>,
    idle_timeout: Duration,
    max_size: usize,
}

impl ClientCache {
    pub fn new(factory: Arc<dyn ClientFactory>, idle_timeout: Duration, max_size: usize) -> Self {
        Self {
            factory,
            entries: Mutex::new(HashMap::new()),
            idle_timeout,
            max_size: max_size.max(1),
        }
    }

    pub fn from_config(config: &StorageConfig, factory: Arc<dyn ClientFactory>) -> Self {
        Self::new(
            factory,
            config.client_cache_idle_timeout,
            config.client_cache_max_size,
        )
    }

    /// Cached handle for `key`, creating the client on a miss.
    pub async fn get(&self, key: ClientKey) -> StorageResult<Arc<ClientHandle>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let idle_timeout = self.idle_timeout;
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.last_used) < idle_timeout);
        if entries.len() < before {
            debug!(evicted = before - entries.len(), "Dropped idle S3 clients");
        }

        if let Some(entry) = entries.get_mut(&key) {
            entry.last_used = now;
            return Ok(entry.handle.clone());
        }

        let client = self.factory.create(&key)?;
        let retry = self.factory.retry_policy(&key);
        let handle = Arc::new(ClientHandle::new(key.clone(), client, retry));

        if entries.len() >= self.max_size {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        info!(
            endpoint = %key.endpoint,
            region = key.region.as_deref().unwrap_or("default"),
            retry_count = key.retry_count,
            "Created S3 client"
        );
        entries.insert(
            key,
            CacheEntry {
                handle: handle.clone(),
                last_used: now,
            },
        );
        Ok(handle)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::memory::InMemoryObjectClient;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
    }

    impl ClientFactory for CountingFactory {
        fn create(&self, _key: &ClientKey) -> StorageResult<Arc<dyn ObjectClient>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(InMemoryObjectClient::new()))
        }
    }

    fn key(endpoint: &str) -> ClientKey {
        ClientKey::new(endpoint, Some("us-east-1".to_string()), 2)
    }

    #[tokio::test]
    async fn test_same_key_reuses_client() {
        let factory = Arc::new(CountingFactory::default());
        let cache = ClientCache::new(factory.clone(), Duration::from_secs(60), 4);

        let a = cache.get(key("http://minio:9000")).await.unwrap();
        let b = cache.get(key("http://minio:9000")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(a.retry_policy().max_retries, 2);
    }

    #[tokio::test]
    async fn test_region_and_retry_count_are_part_of_the_key() {
        let factory = Arc::new(CountingFactory::default());
        let cache = ClientCache::new(factory.clone(), Duration::from_secs(60), 4);

        cache.get(key("http://minio:9000")).await.unwrap();
        cache
            .get(ClientKey::new("http://minio:9000", None, 2))
            .await
            .unwrap();
        cache
            .get(ClientKey::new("http://minio:9000", Some("us-east-1".into()), 5))
            .await
            .unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
        assert_eq!(cache.len().await, 3);
    }

    #[tokio::test]
    async fn test_full_cache_evicts_least_recently_used() {
        let factory = Arc::new(CountingFactory::default());
        let cache = ClientCache::new(factory.clone(), Duration::from_secs(60), 2);

        cache.get(key("http://a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.get(key("http://b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.get(key("http://a")).await.unwrap();
        cache.get(key("http://c")).await.unwrap();

        assert_eq!(cache.len().await, 2);
        cache.get(key("http://a")).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
        cache.get(key("http://b")).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_idle_clients_are_dropped() {
        let factory = Arc::new(CountingFactory::default());
        let cache = ClientCache::new(factory.clone(), Duration::from_millis(10), 4);

        cache.get(key("http://a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.get(key("http://a")).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 1);
    }

    #[test]
    fn test_aws_factory_rejects_empty_endpoint() {
        let factory = AwsClientFactory::new(&StorageConfig::default(), None);
        assert!(factory.create(&ClientKey::new("", None, 0)).is_err());
    }
}
