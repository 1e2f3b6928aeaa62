//! Default request headers shared by every call of a client.
//!
//! Readers always get a snapshot copy; the live map never leaves the store.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::Headers;

/// Mutable, synchronously readable header set.
#[derive(Debug, Clone)]
pub struct HeaderStore {
    inner: Arc<RwLock<Headers>>,
}

impl Default for HeaderStore {
    /// Seeded with `Content-Type: application/json`.
    fn default() -> Self {
        Self::new(Headers::from([(
            "Content-Type".to_string(),
            "application/json".to_string(),
        )]))
    }
}

impl HeaderStore {
    pub fn new(initial: Headers) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn empty() -> Self {
        Self::new(Headers::new())
    }

    /// Snapshot copy of the current headers.
    pub fn get(&self) -> Headers {
        self.inner.read().clone()
    }

    /// Current value of one header.
    pub fn value(&self, key: &str) -> Option<String> {
        self.inner.read().get(key).cloned()
    }

    /// Replace every header.
    pub fn set(&self, next: Headers) {
        *self.inner.write() = next;
    }

    /// Overlay `next`. Empty values are ignored and never overwrite.
    pub fn merge<I, K, V>(&self, next: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut headers = self.inner.write();
        for (key, value) in next {
            let value = value.into();
            if value.is_empty() {
                continue;
            }
            headers.insert(key.into(), value);
        }
    }

    pub fn remove(&self, key: &str) {
        self.inner.write().remove(key);
    }

    /// Remove the listed keys, or everything when `keys` is `None`.
    pub fn clear(&self, keys: Option<&[&str]>) {
        let mut headers = self.inner.write();
        match keys {
            Some(keys) => {
                for key in keys {
                    headers.remove(*key);
                }
            }
            None => headers.clear(),
        }
    }
}
