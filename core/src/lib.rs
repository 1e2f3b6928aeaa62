//! Typed HTTP client core with header management, response caching, NDJSON
//! streaming and session-token handling.
//!
//! # Overview
//! Callers describe a request as plain data (`RequestDescription`) and hand
//! it to an `ApiClient`, which merges default headers, builds the URL and
//! body, sends it through a `Transport` and maps the response to a decoded
//! value or an `ApiError`. Caches (`CsrCache`, `ServerCache`) and the session
//! coordinator (`SessionAuth`) wrap those calls without changing them.
//!
//! # Design
//! - The network sits behind the `Transport` trait; `ReqwestTransport` is the
//!   production implementation and tests script their own.
//! - Every operation returns a lazy `'static` future or stream. Nothing is
//!   sent until it is polled; dropping it cancels the call and releases the
//!   body reader.
//! - Concurrent duplicates are collapsed with `SingleFlight` (token fetch,
//!   refresh, logout) or the fingerprint-keyed client cache.
//! - Browser and server deployments differ only by `ExecutionContext` in
//!   `ClientConfig`; nothing is detected at runtime.

pub mod client;
pub mod codec;
pub mod csr_cache;
pub mod error;
pub mod headers;
pub mod http;
pub mod ndjson;
pub mod server;
pub mod service;
pub mod session_auth;
pub mod single_flight;
pub mod sse;
pub mod ssr_cache;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ApiClient, ApiClientBuilder, ClientConfig, ExecutionContext, FileUpload};
pub use csr_cache::CsrCache;
pub use error::{ApiError, HttpResponseError, TransportError};
pub use headers::HeaderStore;
pub use http::{HttpMethod, HttpRequest, HttpResponse, MultipartForm, RequestBody};
pub use server::{CapturedRequest, RequestContext};
pub use service::CommonService;
pub use session_auth::{SessionAuth, SessionAuthConfig};
pub use single_flight::SingleFlight;
pub use ssr_cache::{MemoryStore, RevalidatingStore, ServerCache};
pub use transport::{ReqwestTransport, Transport};
pub use types::{Body, CacheOptions, Endpoint, Headers, Params, RequestDescription};
