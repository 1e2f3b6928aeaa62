//! Client-side response cache.
//!
//! Identical requests (same fingerprint) share one dispatch: callers that
//! arrive while it runs join it, callers that arrive within `cache_time` of
//! its settlement get the replayed value. Failures are never replayed. Only
//! active in the browser execution context; server calls pass straight
//! through.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::client::{decode, ApiClient, ExecutionContext};
use crate::codec::fingerprint;
use crate::error::ApiError;
use crate::types::{CacheOptions, RequestDescription};

type CachedFlight = Shared<BoxFuture<'static, Result<Value, ApiError>>>;

struct Entry {
    id: u64,
    flight: CachedFlight,
    window: Duration,
    settled_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.settled_at
            .is_some_and(|settled| now.saturating_duration_since(settled) >= self.window)
    }
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, Entry>,
    next_id: u64,
}

/// Fingerprint-keyed replay cache. Clones share entries.
#[derive(Clone)]
pub struct CsrCache {
    context: ExecutionContext,
    entries: Arc<Mutex<Entries>>,
}

impl CsrCache {
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            context,
            entries: Arc::new(Mutex::new(Entries::default())),
        }
    }

    /// Dispatch `request` through `client`, deduplicated and replayed.
    ///
    /// `cache_size` above one has no further effect: a call produces a
    /// single value, so only the latest is ever replayed.
    pub fn call_api<R>(
        &self,
        client: &ApiClient,
        request: RequestDescription,
        options: &CacheOptions,
    ) -> BoxFuture<'static, Result<R, ApiError>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        if self.context != ExecutionContext::Browser {
            return client.call_api(request);
        }
        let key = fingerprint(&options.cache_name, &request);
        let client = client.clone();
        let value = self.cached(key, options.cache_time, move || client.call_api_value(request));
        async move { decode(value.await?) }.boxed()
    }

    /// Share the outcome of `fetch` under `key`. `fetch` only runs when no
    /// live entry exists for the key.
    pub fn cached<F, Fut>(
        &self,
        key: String,
        window: Duration,
        fetch: F,
    ) -> BoxFuture<'static, Result<Value, ApiError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
    {
        let cache = self.clone();
        async move { cache.lookup(key, window, fetch).await }.boxed()
    }

    fn lookup<F, Fut>(&self, key: String, window: Duration, fetch: F) -> CachedFlight
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
    {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let before = entries.map.len();
        entries.map.retain(|_, entry| !entry.expired(now));
        let swept = before - entries.map.len();
        if swept > 0 {
            debug!(swept, "evicted expired cache entries");
        }
        if let Some(entry) = entries.map.get(&key) {
            trace!(%key, "cache hit");
            return entry.flight.clone();
        }

        debug!(%key, "cache miss");
        let id = entries.next_id;
        entries.next_id += 1;
        let work = fetch();
        let owner = Arc::clone(&self.entries);
        let settle_key = key.clone();
        let flight = async move {
            let outcome = work.await;
            let mut entries = owner.lock();
            let current = entries.map.get(&settle_key).is_some_and(|e| e.id == id);
            if current {
                if outcome.is_ok() {
                    if let Some(entry) = entries.map.get_mut(&settle_key) {
                        entry.settled_at = Some(Instant::now());
                    }
                } else {
                    debug!(key = %settle_key, "evicting failed cache entry");
                    entries.map.remove(&settle_key);
                }
            }
            outcome
        }
        .boxed()
        .shared();

        entries.map.insert(
            key,
            Entry {
                id,
                flight: flight.clone(),
                window,
                settled_at: None,
            },
        );
        flight
    }

    /// Drop every entry whose fingerprint starts with `prefix`.
    pub fn remove(&self, prefix: &str) {
        let mut entries = self.entries.lock();
        let before = entries.map.len();
        entries.map.retain(|key, _| !key.starts_with(prefix));
        debug!(prefix, removed = before - entries.map.len(), "invalidated cache entries");
    }

    /// Drop settled entries whose window has lapsed.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.lock().map.retain(|_, entry| !entry.expired(now));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
