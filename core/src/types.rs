//! Request descriptions and the typed endpoint boundary.
//!
//! # Design
//! A `RequestDescription` is built once with consuming builder methods and
//! never mutated by the client afterwards; retries and cache replays clone
//! it. Path variables and query parameters are JSON values so that typed
//! parameter structs can be serialized into them (`Endpoint` helpers) and so
//! that cache fingerprints can be computed from them deterministically.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ApiError;
use crate::http::{HttpMethod, HttpResponse, MultipartForm};

/// Header name to value. Keys are case-sensitive as provided.
pub type Headers = HashMap<String, String>;

/// Path variables or query parameters, in insertion order.
pub type Params = Map<String, Value>;

/// Converts a raw response into the call result, bypassing the standard
/// status and error handling.
pub type ResultInterceptor =
    Arc<dyn Fn(HttpResponse) -> BoxFuture<'static, Result<Value, ApiError>> + Send + Sync>;

/// Request payload before wire encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Serialized as JSON text.
    Json(Value),
    /// Sent as `multipart/form-data`; any `Content-Type` header is dropped.
    Multipart(MultipartForm),
}

/// Everything needed to issue one call.
#[derive(Clone)]
pub struct RequestDescription {
    pub url: String,
    pub method: HttpMethod,
    pub path_variables: Option<Params>,
    pub query: Option<Params>,
    pub body: Option<Body>,
    pub headers: Headers,
    pub result_interceptor: Option<ResultInterceptor>,
}

impl fmt::Debug for RequestDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescription")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("path_variables", &self.path_variables)
            .field("query", &self.query)
            .field("body", &self.body)
            .field("headers", &self.headers)
            .field("result_interceptor", &self.result_interceptor.is_some())
            .finish()
    }
}

impl RequestDescription {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            path_variables: None,
            query: None,
            body: None,
            headers: Headers::new(),
            result_interceptor: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Patch, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    /// Seed method and path template from a typed endpoint.
    pub fn endpoint<E: Endpoint>() -> Self {
        Self::new(E::METHOD, E::PATH)
    }

    #[must_use]
    pub fn path_var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.path_variables
            .get_or_insert_with(Params::new)
            .insert(name.into(), value.into());
        self
    }

    /// Add one query parameter. Arrays expand into repeated pairs, nulls are
    /// skipped when the query string is built.
    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query
            .get_or_insert_with(Params::new)
            .insert(name.into(), value.into());
        self
    }

    /// Replace the whole query map. An empty map still yields a bare `?`.
    #[must_use]
    pub fn query_params(mut self, params: Params) -> Self {
        self.query = Some(params);
        self
    }

    /// Fill path variables from any value serializing to a JSON object.
    pub fn path_variables_from<T: Serialize>(mut self, vars: &T) -> Result<Self, ApiError> {
        self.path_variables = Some(to_params(vars, "path variables")?);
        Ok(self)
    }

    /// Fill the query map from any value serializing to a JSON object.
    pub fn query_from<T: Serialize>(mut self, query: &T) -> Result<Self, ApiError> {
        self.query = Some(to_params(query, "query parameters")?);
        Ok(self)
    }

    #[must_use]
    pub fn body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn json_body<T: Serialize>(self, body: &T) -> Result<Self, ApiError> {
        let value =
            serde_json::to_value(body).map_err(|e| ApiError::SerializationError(e.to_string()))?;
        Ok(self.body(Body::Json(value)))
    }

    #[must_use]
    pub fn multipart(self, form: MultipartForm) -> Self {
        self.body(Body::Multipart(form))
    }

    /// Per-request header; wins over default headers.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn result_interceptor<F, Fut>(mut self, interceptor: F) -> Self
    where
        F: Fn(HttpResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
    {
        self.result_interceptor = Some(Arc::new(move |res| interceptor(res).boxed()));
        self
    }
}

fn to_params<T: Serialize>(value: &T, what: &str) -> Result<Params, ApiError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Params::new()),
        Ok(other) => Err(ApiError::SerializationError(format!(
            "{what} must serialize to an object, got {other}"
        ))),
        Err(e) => Err(ApiError::SerializationError(e.to_string())),
    }
}

/// A typed API operation: method, path template and response shape.
///
/// ```
/// use http_core::{Endpoint, HttpMethod};
///
/// #[derive(serde::Deserialize)]
/// struct User { id: u64 }
///
/// struct GetUser;
/// impl Endpoint for GetUser {
///     const METHOD: HttpMethod = HttpMethod::Get;
///     const PATH: &'static str = "/users/{id}";
///     type Response = User;
/// }
/// ```
pub trait Endpoint {
    const METHOD: HttpMethod;
    const PATH: &'static str;
    type Response: DeserializeOwned + Send + 'static;
}

/// Caching parameters for the client-side and server-side caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Prefix of every fingerprint; also the invalidation tag.
    pub cache_name: String,
    /// Replay window on the client, revalidation interval on the server.
    pub cache_time: Duration,
    /// Number of replayed values, at least one.
    pub cache_size: usize,
}

impl CacheOptions {
    pub fn new(cache_name: impl Into<String>, cache_time: Duration) -> Self {
        Self {
            cache_name: cache_name.into(),
            cache_time,
            cache_size: 1,
        }
    }

    #[must_use]
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size.max(1);
        self
    }
}
