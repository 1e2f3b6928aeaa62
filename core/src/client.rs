//! Request dispatcher: one transport call per invocation, mapped to a decoded
//! result or an `ApiError`.
//!
//! # Design
//! `ApiClient` is a cheap handle (`Arc` inside) holding the base URL, the
//! transport and the header sources. Every call resolves headers, builds the
//! final URL and body, dispatches, and then classifies the response in a
//! fixed order: server-side 401 hook, result interceptor, unsuccessful
//! status, success body. Returned futures and streams are `'static` and
//! lazy: nothing happens until they are polled, and each poll of a fresh
//! future issues a fresh request.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, Instrument};

use crate::codec::{build_url, is_truthy, join_url, normalize_body};
use crate::error::{ApiError, HttpResponseError};
use crate::headers::HeaderStore;
use crate::http::{CacheMode, HttpMethod, HttpRequest, HttpResponse, RequestBody, ResponseHead};
use crate::ndjson::NdjsonStream;
use crate::sse;
use crate::transport::Transport;
use crate::types::{Endpoint, Headers, RequestDescription};

/// Computes default headers per request (cookies, tenant headers, ...).
pub type HeadersProvider = Arc<dyn Fn() -> BoxFuture<'static, Headers> + Send + Sync>;

/// Runs when a server-side call receives 401. An `Err` (e.g. a redirect)
/// replaces the call's own error.
pub type Server401Hook = Arc<dyn Fn() -> BoxFuture<'static, Result<(), ApiError>> + Send + Sync>;

/// Maps a status code to the message of a typed error whose payload had none.
pub type ErrorMessageResolver = Arc<dyn Fn(u16) -> String + Send + Sync>;

/// Where the client runs. Browsers get client-side caching; servers get the
/// 401 hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionContext {
    #[default]
    Browser,
    Server,
}

/// Static client settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    /// Strip `Authorization` whenever a `Cache-Control` header is sent, so
    /// shared caches never store an authenticated response.
    pub drop_auth_when_cache_control: bool,
    pub context: ExecutionContext,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            drop_auth_when_cache_control: true,
            context: ExecutionContext::Browser,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn with_drop_auth_when_cache_control(mut self, drop: bool) -> Self {
        self.drop_auth_when_cache_control = drop;
        self
    }
}

/// Raw upload of a file body to an absolute URL.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub url: String,
    pub file: Bytes,
    pub if_none_match: Option<String>,
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    header_store: Option<HeaderStore>,
    headers_provider: Option<HeadersProvider>,
    on_server_401: Option<Server401Hook>,
    error_message: Option<ErrorMessageResolver>,
}

/// Builder for `ApiClient`.
pub struct ApiClientBuilder {
    inner: ClientInner,
}

impl ApiClientBuilder {
    /// Default headers come from this store unless a provider is set.
    #[must_use]
    pub fn with_header_store(mut self, store: HeaderStore) -> Self {
        self.inner.header_store = Some(store);
        self
    }

    /// Default headers are computed per request; takes precedence over the store.
    #[must_use]
    pub fn with_headers_provider<F, Fut>(mut self, provider: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Headers> + Send + 'static,
    {
        self.inner.headers_provider = Some(Arc::new(move || provider().boxed()));
        self
    }

    #[must_use]
    pub fn with_server_401_hook(mut self, hook: Server401Hook) -> Self {
        self.inner.on_server_401 = Some(hook);
        self
    }

    #[must_use]
    pub fn with_error_message<F>(mut self, resolver: F) -> Self
    where
        F: Fn(u16) -> String + Send + Sync + 'static,
    {
        self.inner.error_message = Some(Arc::new(resolver));
        self
    }

    pub fn build(self) -> ApiClient {
        ApiClient {
            inner: Arc::new(self.inner),
        }
    }
}

/// Typed HTTP client.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl ApiClient {
    pub fn builder(config: ClientConfig, transport: Arc<dyn Transport>) -> ApiClientBuilder {
        ApiClientBuilder {
            inner: ClientInner {
                config,
                transport,
                header_store: None,
                headers_provider: None,
                on_server_401: None,
                error_message: None,
            },
        }
    }

    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self::builder(config, transport).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn header_store(&self) -> Option<&HeaderStore> {
        self.inner.header_store.as_ref()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.inner.transport)
    }

    /// Issue the request and decode the JSON success body into `R`.
    pub fn call_api<R>(&self, request: RequestDescription) -> BoxFuture<'static, Result<R, ApiError>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let value = self.call_api_value(request);
        async move { decode(value.await?) }.boxed()
    }

    /// Issue a typed endpoint call.
    pub fn call<E: Endpoint>(
        &self,
        request: RequestDescription,
    ) -> BoxFuture<'static, Result<E::Response, ApiError>> {
        self.call_api::<E::Response>(request)
    }

    /// Issue the request and return the JSON success body untyped.
    pub fn call_api_value(
        &self,
        request: RequestDescription,
    ) -> BoxFuture<'static, Result<Value, ApiError>> {
        let client = self.clone();
        let span = tracing::debug_span!("call_api", method = %request.method, url = %request.url);
        async move {
            let base = client.base_headers().await;
            let http = client.prepare(&request, base, false);
            debug!(url = %http.url, "dispatching request");
            let response = client.inner.transport.send(http).await?;
            client.handle_response(&request, response).await
        }
        .instrument(span)
        .boxed()
    }

    /// Issue the request and decode the success body as NDJSON, one item per
    /// line. Sends `Accept: application/x-ndjson` unless the caller set one.
    pub fn call_api_stream<T>(
        &self,
        request: RequestDescription,
    ) -> BoxStream<'static, Result<T, ApiError>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.clone();
        let span = tracing::debug_span!("call_api_stream", method = %request.method, url = %request.url);
        let opened = async move {
            let base = client.base_headers().await;
            let http = client.prepare(&request, base, true);
            debug!(url = %http.url, "opening ndjson stream");
            let response = client.inner.transport.send(http).await?;
            client.open_stream::<T>(&request, response).await
        }
        .instrument(span);

        stream::once(opened)
            .flat_map(|opened| match opened {
                Ok(items) => items,
                Err(err) => stream::iter([Err(err)]).boxed(),
            })
            .boxed()
    }

    /// PUT raw file bytes to an absolute URL. No default headers and no
    /// status mapping: the raw response is returned.
    pub fn upload_file(&self, upload: FileUpload) -> BoxFuture<'static, Result<HttpResponse, ApiError>> {
        let transport = self.transport();
        async move {
            let mut request = HttpRequest::new(HttpMethod::Put, upload.url);
            request.headers = vec![
                ("Content-Encoding".to_string(), "base64".to_string()),
                ("Content-Type".to_string(), "application/octet-stream".to_string()),
            ];
            if let Some(tag) = upload.if_none_match {
                request.headers.push(("If-None-Match".to_string(), tag));
            }
            request.body = Some(RequestBody::Bytes(upload.file));
            debug!(url = %request.url, "uploading file");
            Ok(transport.send(request).await?)
        }
        .boxed()
    }

    /// Subscribe to a server-sent event feed at the request's URL. Each
    /// message is decoded as JSON; the stream completes on any error.
    pub fn sse<T>(&self, request: RequestDescription) -> BoxStream<'static, T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let url = join_url(
            &self.inner.config.base_url,
            &build_url(
                &request.url,
                request.path_variables.as_ref(),
                request.query.as_ref(),
            ),
        );
        let transport = self.transport();
        let opened = async move {
            let mut http = HttpRequest::new(HttpMethod::Get, url);
            http.headers
                .push(("Accept".to_string(), "text/event-stream".to_string()));
            match transport.send(http).await {
                Ok(res) if res.is_success() => res.into_body_stream(),
                Ok(res) => {
                    debug!(status = res.status, "event stream rejected");
                    None
                }
                Err(err) => {
                    debug!(error = %err, "event stream failed to open");
                    None
                }
            }
        };
        stream::once(opened)
            .flat_map(|body| match body {
                Some(body) => sse::json_events::<T>(body),
                None => stream::empty().boxed(),
            })
            .boxed()
    }

    /// Fetch used by the server-side cache: provider headers only, the
    /// `Cache-Control` rule always applies, interceptor before status checks.
    pub(crate) fn fetch_for_server_cache(
        &self,
        request: RequestDescription,
        cache: CacheMode,
    ) -> BoxFuture<'static, Result<Value, ApiError>> {
        let client = self.clone();
        async move {
            let mut headers = match &client.inner.headers_provider {
                Some(provider) => provider().await,
                None => Headers::new(),
            };
            headers.extend(request.headers.clone());
            if headers.contains_key("Cache-Control") {
                headers.remove("Authorization");
            }
            let mut http = client.to_http_request(&request, headers);
            http.cache = cache;
            debug!(url = %http.url, ?cache, "server cache fetch");
            let response = client.inner.transport.send(http).await?;

            if let Some(interceptor) = &request.result_interceptor {
                return interceptor(response).await;
            }
            if !response.is_success() {
                if response.status == 401 {
                    if let Some(hook) = &client.inner.on_server_401 {
                        hook().await?;
                    }
                }
                let status = response.status;
                return Err(client
                    .error_from_response(&request, response, |_| format!("HTTP {status}"))
                    .await);
            }
            response.json().await
        }
        .boxed()
    }

    async fn base_headers(&self) -> Headers {
        if let Some(provider) = &self.inner.headers_provider {
            return provider().await;
        }
        match &self.inner.header_store {
            Some(store) => store.get(),
            None => Headers::new(),
        }
    }

    fn prepare(&self, request: &RequestDescription, base: Headers, streaming: bool) -> HttpRequest {
        let mut headers = base;
        headers.extend(request.headers.clone());
        if streaming && headers.get("Accept").map_or(true, String::is_empty) {
            headers.insert("Accept".to_string(), "application/x-ndjson".to_string());
        }
        if self.inner.config.drop_auth_when_cache_control
            && headers.get("Cache-Control").is_some_and(|v| !v.is_empty())
        {
            headers.remove("Authorization");
        }
        self.to_http_request(request, headers)
    }

    fn to_http_request(&self, request: &RequestDescription, headers: Headers) -> HttpRequest {
        let path = build_url(
            &request.url,
            request.path_variables.as_ref(),
            request.query.as_ref(),
        );
        let (body, headers) = normalize_body(request.body.as_ref(), headers);
        let mut http = HttpRequest::new(request.method, join_url(&self.inner.config.base_url, &path));
        http.headers = headers.into_iter().collect();
        http.headers.sort();
        http.body = body;
        http
    }

    async fn handle_response(
        &self,
        request: &RequestDescription,
        response: HttpResponse,
    ) -> Result<Value, ApiError> {
        if response.status == 401 {
            self.server_401(request, response.head()).await?;
        }
        if let Some(interceptor) = &request.result_interceptor {
            return interceptor(response).await;
        }
        if !response.is_success() {
            return Err(self.typed_error(request, response).await);
        }
        response.json().await
    }

    async fn open_stream<T>(
        &self,
        request: &RequestDescription,
        response: HttpResponse,
    ) -> Result<BoxStream<'static, Result<T, ApiError>>, ApiError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if response.status == 401 {
            self.server_401(request, response.head()).await?;
        }
        if !response.is_success() {
            return Err(self.typed_error(request, response).await);
        }
        match response.into_body_stream() {
            Some(body) => Ok(NdjsonStream::<T>::new(body).boxed()),
            None => Err(ApiError::MissingBody),
        }
    }

    /// On the server, a 401 runs the hook and then fails without reading
    /// the body.
    async fn server_401(&self, request: &RequestDescription, head: ResponseHead) -> Result<(), ApiError> {
        if self.inner.config.context != ExecutionContext::Server {
            return Ok(());
        }
        let Some(hook) = &self.inner.on_server_401 else {
            return Ok(());
        };
        debug!("running server 401 hook");
        hook().await?;
        Err(HttpResponseError::new(head, Bytes::new(), request.clone(), None, None).into())
    }

    async fn typed_error(&self, request: &RequestDescription, response: HttpResponse) -> ApiError {
        let resolver = self.inner.error_message.clone();
        self.error_from_response(request, response, move |status| match &resolver {
            Some(resolve) => resolve(status),
            None => default_error_message(status),
        })
        .await
    }

    async fn error_from_response(
        &self,
        request: &RequestDescription,
        response: HttpResponse,
        fallback_message: impl FnOnce(u16) -> String,
    ) -> ApiError {
        let head = response.head();
        let body = response.bytes().await.unwrap_or_default();
        let data = parse_error_body(&body);
        debug!(status = head.status, "unsuccessful response");

        if data.get("resultType").is_some_and(is_truthy) {
            return ApiError::Payload(data);
        }

        let message = data
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| fallback_message(head.status));
        let data = (!data.is_null()).then_some(data);
        HttpResponseError::new(head, body, request.clone(), data, Some(message)).into()
    }
}

/// Error payload: JSON if it parses, otherwise the body text, otherwise null.
fn parse_error_body(body: &[u8]) -> Value {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        return value;
    }
    match std::str::from_utf8(body) {
        Ok(text) if !text.is_empty() => Value::String(text.to_string()),
        _ => Value::Null,
    }
}

pub(crate) fn default_error_message(status: u16) -> String {
    if status == 500 {
        return "server error (HTTP 500): check whether the request was processed before retrying"
            .to_string();
    }
    format!("server error (HTTP {status}): please try again later")
}

pub(crate) fn decode<R: DeserializeOwned>(value: Value) -> Result<R, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::DeserializationError(e.to_string()))
}
