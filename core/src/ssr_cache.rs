//! Server-side response cache backed by a tag-aware revalidating store.
//!
//! Only GET requests with a non-zero `cache_time` are stored; everything else
//! goes to the network with `CacheMode::NoStore` and never touches the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::client::{decode, ApiClient};
use crate::codec::fingerprint;
use crate::error::ApiError;
use crate::http::{CacheMode, HttpMethod};
use crate::types::{CacheOptions, RequestDescription};

/// External cache keyed by string with tag-based invalidation.
#[async_trait]
pub trait RevalidatingStore: Send + Sync {
    /// Return the stored value for `key` if it is younger than `revalidate`,
    /// otherwise run `fetch` and store a successful result under `tags`.
    async fn get_or_fetch(
        &self,
        key: &str,
        tags: &[String],
        revalidate: Duration,
        fetch: BoxFuture<'static, Result<Value, ApiError>>,
    ) -> Result<Value, ApiError>;

    /// Forget every value stored under `tag`.
    async fn invalidate_tag(&self, tag: &str);
}

struct Stored {
    value: Value,
    stored_at: Instant,
    revalidate: Duration,
    tags: Vec<String>,
}

/// In-process `RevalidatingStore`.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Stored>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RevalidatingStore for MemoryStore {
    async fn get_or_fetch(
        &self,
        key: &str,
        tags: &[String],
        revalidate: Duration,
        fetch: BoxFuture<'static, Result<Value, ApiError>>,
    ) -> Result<Value, ApiError> {
        let fresh = self.entries.lock().get(key).and_then(|stored| {
            (stored.stored_at.elapsed() < stored.revalidate).then(|| stored.value.clone())
        });
        if let Some(value) = fresh {
            debug!(key, "store hit");
            return Ok(value);
        }

        let value = fetch.await?;
        self.entries.lock().insert(
            key.to_string(),
            Stored {
                value: value.clone(),
                stored_at: Instant::now(),
                revalidate,
                tags: tags.to_vec(),
            },
        );
        Ok(value)
    }

    async fn invalidate_tag(&self, tag: &str) {
        self.entries
            .lock()
            .retain(|_, stored| !stored.tags.iter().any(|t| t == tag));
    }
}

/// Server-side cache wrapper around an `ApiClient`.
#[derive(Clone)]
pub struct ServerCache {
    client: ApiClient,
    store: Arc<dyn RevalidatingStore>,
}

impl ServerCache {
    pub fn new(client: ApiClient, store: Arc<dyn RevalidatingStore>) -> Self {
        Self { client, store }
    }

    pub fn call_api<R>(
        &self,
        request: RequestDescription,
        options: &CacheOptions,
    ) -> BoxFuture<'static, Result<R, ApiError>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        if request.method != HttpMethod::Get || options.cache_time.is_zero() {
            let fetch = self.client.fetch_for_server_cache(request, CacheMode::NoStore);
            return async move { decode(fetch.await?) }.boxed();
        }

        let revalidate = revalidate_interval(options.cache_time);
        let key = fingerprint(&options.cache_name, &request);
        let tags = vec![options.cache_name.clone()];
        let fetch = self
            .client
            .fetch_for_server_cache(request, CacheMode::ForceCache { revalidate });
        let store = Arc::clone(&self.store);
        async move {
            let value = store.get_or_fetch(&key, &tags, revalidate, fetch).await?;
            decode(value)
        }
        .boxed()
    }

    /// Invalidate everything cached under `cache_name`.
    pub async fn invalidate(&self, cache_name: &str) {
        self.store.invalidate_tag(cache_name).await;
    }
}

/// `cache_time` rounded up to whole seconds, at least one.
fn revalidate_interval(cache_time: Duration) -> Duration {
    let secs = cache_time.as_millis().div_ceil(1000).max(1);
    Duration::from_secs(u64::try_from(secs).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientConfig, ExecutionContext};
    use crate::testing::ScriptedTransport;
    use crate::transport::Transport;
    use crate::types::Headers;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl RevalidatingStore for CountingStore {
        async fn get_or_fetch(
            &self,
            key: &str,
            tags: &[String],
            revalidate: Duration,
            fetch: BoxFuture<'static, Result<Value, ApiError>>,
        ) -> Result<Value, ApiError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.get_or_fetch(key, tags, revalidate, fetch).await
        }

        async fn invalidate_tag(&self, tag: &str) {
            self.inner.invalidate_tag(tag).await;
        }
    }

    fn setup() -> (Arc<ScriptedTransport>, Arc<CountingStore>, ServerCache) {
        let transport = ScriptedTransport::new();
        let client = ApiClient::builder(
            ClientConfig::new("http://api.test")
                .with_context(ExecutionContext::Server)
                .with_drop_auth_when_cache_control(false),
            Arc::clone(&transport) as Arc<dyn Transport>,
        )
        .with_headers_provider(|| async {
            Headers::from([("Authorization".to_string(), "Bearer s".to_string())])
        })
        .build();
        let store = Arc::new(CountingStore::default());
        let cache = ServerCache::new(client, Arc::clone(&store) as Arc<dyn RevalidatingStore>);
        (transport, store, cache)
    }

    #[test]
    fn revalidate_rounds_up_to_seconds() {
        assert_eq!(revalidate_interval(Duration::from_millis(1)), Duration::from_secs(1));
        assert_eq!(revalidate_interval(Duration::from_millis(1500)), Duration::from_secs(2));
        assert_eq!(revalidate_interval(Duration::from_secs(30)), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn zero_cache_time_always_fetches_fresh() {
        let (transport, store, cache) = setup();
        transport.push_json(200, json!(1));
        transport.push_json(200, json!(2));
        let opts = CacheOptions::new("users", Duration::ZERO);

        let a: Value = cache.call_api(RequestDescription::get("/users"), &opts).await.unwrap();
        let b: Value = cache.call_api(RequestDescription::get("/users"), &opts).await.unwrap();
        assert_eq!((a, b), (json!(1), json!(2)));
        assert_eq!(transport.request(0).cache, CacheMode::NoStore);
        assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_get_bypasses_store() {
        let (transport, store, cache) = setup();
        transport.push_json(200, json!({}));
        let opts = CacheOptions::new("users", Duration::from_secs(10));
        cache
            .call_api::<Value>(RequestDescription::post("/users"), &opts)
            .await
            .unwrap();
        assert_eq!(transport.request(0).cache, CacheMode::NoStore);
        assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn get_is_stored_tagged_and_revalidated() {
        let (transport, store, cache) = setup();
        transport.push_json(200, json!("v1"));
        transport.push_json(200, json!("v2"));
        transport.push_json(200, json!("v3"));
        let opts = CacheOptions::new("users", Duration::from_millis(1500));
        let req = RequestDescription::get("/users");

        let v: Value = cache.call_api(req.clone(), &opts).await.unwrap();
        assert_eq!(v, json!("v1"));
        assert_eq!(
            transport.request(0).cache,
            CacheMode::ForceCache {
                revalidate: Duration::from_secs(2)
            }
        );
        let v: Value = cache.call_api(req.clone(), &opts).await.unwrap();
        assert_eq!(v, json!("v1"));
        assert_eq!(transport.calls(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        let v: Value = cache.call_api(req.clone(), &opts).await.unwrap();
        assert_eq!(v, json!("v2"));

        cache.invalidate("users").await;
        assert!(store.inner.is_empty());
        let v: Value = cache.call_api(req, &opts).await.unwrap();
        assert_eq!(v, json!("v3"));
    }

    #[tokio::test]
    async fn cache_control_always_strips_authorization() {
        let (transport, _, cache) = setup();
        transport.push_json(200, json!({}));
        transport.push_json(200, json!({}));
        let opts = CacheOptions::new("users", Duration::ZERO);

        cache
            .call_api::<Value>(RequestDescription::get("/a").header("Cache-Control", "no-cache"), &opts)
            .await
            .unwrap();
        assert_eq!(transport.request(0).header("Authorization"), None);

        cache.call_api::<Value>(RequestDescription::get("/b"), &opts).await.unwrap();
        assert_eq!(transport.request(1).header("Authorization"), Some("Bearer s"));
    }

    #[tokio::test]
    async fn errors_use_short_message_and_are_not_stored() {
        let (transport, store, cache) = setup();
        transport.push_json(404, json!({"code": "missing"}));
        transport.push_json(200, json!("found"));
        let opts = CacheOptions::new("users", Duration::from_secs(10));

        let err = cache
            .call_api::<Value>(RequestDescription::get("/users/9"), &opts)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "HTTP 404");
        assert!(store.inner.is_empty());

        let v: Value = cache.call_api(RequestDescription::get("/users/9"), &opts).await.unwrap();
        assert_eq!(v, json!("found"));
    }

    #[tokio::test]
    async fn interceptor_result_is_returned_unchanged() {
        let (transport, _, cache) = setup();
        transport.push_json(503, json!({}));
        let opts = CacheOptions::new("health", Duration::ZERO);
        let req = RequestDescription::get("/health")
            .result_interceptor(|res| async move { Ok(json!({"up": res.is_success()})) });
        let v: Value = cache.call_api(req, &opts).await.unwrap();
        assert_eq!(v, json!({"up": false}));
    }
}
