//! Session token lifecycle: fetch, refresh, logout.
//!
//! # Overview
//! The current token lives in the `HeaderStore` as the `Authorization`
//! header. `ensure_token` returns it immediately when present and otherwise
//! joins (or starts) the single outstanding token fetch. `refresh_token` and
//! `logout` are single-flight as well, so any number of concurrent callers
//! produce at most one network call of each kind.
//!
//! # Design
//! Token endpoints are called through the bare `Transport`: no default
//! headers and no status mapping. Fetch and refresh failures are absorbed:
//! the header is cleared, the login callback fires with `false` and the
//! caller gets an empty string.
//!
//! `with_session_auth` wraps a request factory. A 401 from the first attempt
//! triggers one refresh; a new token re-runs the factory once, and anything
//! else (no token, or a failing retry) logs out and returns the original
//! 401.

use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn, Instrument};

use crate::codec::join_url;
use crate::error::ApiError;
use crate::headers::HeaderStore;
use crate::http::{HttpMethod, HttpRequest};
use crate::single_flight::SingleFlight;
use crate::transport::Transport;

const AUTHORIZATION: &str = "Authorization";

pub type LoginChangeCallback = Arc<dyn Fn(bool) + Send + Sync>;
pub type AuthorizationFormatter = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Token endpoint locations.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionAuthConfig {
    /// Prefixed to every endpoint when set.
    pub base_url: Option<String>,
    pub token_url: String,
    pub refresh_url: String,
    pub logout_url: String,
}

impl Default for SessionAuthConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token_url: "/api/auth/token".to_string(),
            refresh_url: "/api/auth/token/refresh".to_string(),
            logout_url: "/api/auth/logout".to_string(),
        }
    }
}

impl SessionAuthConfig {
    fn endpoint(&self, path: &str) -> String {
        match &self.base_url {
            Some(base) => join_url(base, path),
            None => path.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct TokenJson {
    #[serde(default)]
    token: Option<String>,
}

/// `Bearer <token>` unless the token already carries the prefix.
pub fn bearer(token: &str) -> String {
    if token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bearer {token}")
    }
}

struct SessionInner {
    config: SessionAuthConfig,
    transport: Arc<dyn Transport>,
    store: HeaderStore,
    on_login_change: Option<LoginChangeCallback>,
    format_authorization: AuthorizationFormatter,
    token_flight: SingleFlight<String>,
    refresh_flight: SingleFlight<String>,
    logout_flight: SingleFlight<Result<(), ApiError>>,
}

pub struct SessionAuthBuilder {
    config: SessionAuthConfig,
    transport: Arc<dyn Transport>,
    store: HeaderStore,
    on_login_change: Option<LoginChangeCallback>,
    format_authorization: AuthorizationFormatter,
}

impl SessionAuthBuilder {
    #[must_use]
    pub fn with_config(mut self, config: SessionAuthConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn on_login_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on_login_change = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn format_authorization<F>(mut self, format: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.format_authorization = Arc::new(format);
        self
    }

    pub fn build(self) -> SessionAuth {
        SessionAuth {
            inner: Arc::new(SessionInner {
                config: self.config,
                transport: self.transport,
                store: self.store,
                on_login_change: self.on_login_change,
                format_authorization: self.format_authorization,
                token_flight: SingleFlight::new(),
                refresh_flight: SingleFlight::new(),
                logout_flight: SingleFlight::new(),
            }),
        }
    }
}

/// Session auth coordinator. Clones share state and in-flight operations.
#[derive(Clone)]
pub struct SessionAuth {
    inner: Arc<SessionInner>,
}

enum Attempt<S> {
    Start,
    First(S),
    Retried(S, ApiError),
    Done,
}

impl SessionAuth {
    pub fn builder(transport: Arc<dyn Transport>, store: HeaderStore) -> SessionAuthBuilder {
        SessionAuthBuilder {
            config: SessionAuthConfig::default(),
            transport,
            store,
            on_login_change: None,
            format_authorization: Arc::new(bearer),
        }
    }

    pub fn new(transport: Arc<dyn Transport>, store: HeaderStore) -> Self {
        Self::builder(transport, store).build()
    }

    pub fn header_store(&self) -> &HeaderStore {
        &self.inner.store
    }

    /// Current non-blank `Authorization` value, if any.
    pub fn current_authorization(&self) -> Option<String> {
        self.inner
            .store
            .value(AUTHORIZATION)
            .filter(|value| !value.trim().is_empty())
    }

    /// The `Authorization` value, fetching a token first when none is set.
    /// Resolves to an empty string when the fetch fails.
    pub fn ensure_token(&self) -> BoxFuture<'static, String> {
        if let Some(current) = self.current_authorization() {
            return future::ready(current).boxed();
        }
        let this = self.clone();
        self.inner
            .token_flight
            .join_or_start(move || {
                let url = this.inner.config.endpoint(&this.inner.config.token_url);
                let span = tracing::debug_span!("token_fetch", %url);
                async move { this.fetch_token(HttpRequest::new(HttpMethod::Get, url)).await }
                    .instrument(span)
            })
            .boxed()
    }

    /// Exchange the current token for a new one. Resolves to the new
    /// `Authorization` value, or an empty string once auth is cleared.
    pub fn refresh_token(&self) -> BoxFuture<'static, String> {
        let this = self.clone();
        self.inner
            .refresh_flight
            .join_or_start(move || async move {
                let current = this.ensure_token().await;
                if current.is_empty() {
                    this.set_auth("");
                    return String::new();
                }
                let url = this.inner.config.endpoint(&this.inner.config.refresh_url);
                let mut request = HttpRequest::new(HttpMethod::Get, url);
                request.headers.push((AUTHORIZATION.to_string(), current));
                this.fetch_token(request)
                    .instrument(tracing::debug_span!("token_refresh"))
                    .await
            })
            .boxed()
    }

    /// Call the logout endpoint. Auth is cleared once the call settles,
    /// whatever its outcome; only a transport failure is reported.
    pub fn logout(&self) -> BoxFuture<'static, Result<(), ApiError>> {
        let this = self.clone();
        self.inner
            .logout_flight
            .join_or_start(move || async move {
                let url = this.inner.config.endpoint(&this.inner.config.logout_url);
                debug!(%url, "logging out");
                let outcome = this
                    .inner
                    .transport
                    .send(HttpRequest::new(HttpMethod::Get, url))
                    .await;
                this.set_auth("");
                match outcome {
                    Ok(res) => {
                        debug!(status = res.status, "logout settled");
                        Ok(())
                    }
                    Err(err) => {
                        warn!(error = %err, "logout request failed");
                        Err(err.into())
                    }
                }
            })
            .boxed()
    }

    /// Run `request()` with a token in place, refreshing and retrying once
    /// on 401.
    pub fn with_session_auth<T, F, Fut>(&self, request: F) -> BoxFuture<'static, Result<T, ApiError>>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let this = self.clone();
        async move {
            this.ensure_token().await;
            let original = match request().await {
                Err(err) if err.is_unauthorized() => err,
                other => return other,
            };

            if this.refresh_token().await.is_empty() {
                debug!("refresh yielded no token");
                return Err(this.logout_then(original).await);
            }
            match request().await {
                Ok(value) => Ok(value),
                Err(err) => {
                    debug!(error = %err, "retry after refresh failed");
                    Err(this.logout_then(original).await)
                }
            }
        }
        .boxed()
    }

    /// Stream form of `with_session_auth`. Items already yielded by a failed
    /// first attempt are not withdrawn; the retry starts the stream over.
    pub fn with_session_auth_stream<T, F, S>(&self, open: F) -> BoxStream<'static, Result<T, ApiError>>
    where
        T: Send + 'static,
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = Result<T, ApiError>> + Send + 'static,
    {
        let start: Attempt<BoxStream<'static, Result<T, ApiError>>> = Attempt::Start;
        let state = (self.clone(), Arc::new(open), start);
        stream::unfold(state, |(this, open, mut attempt)| async move {
            loop {
                attempt = match attempt {
                    Attempt::Start => {
                        this.ensure_token().await;
                        Attempt::First(open().boxed())
                    }
                    Attempt::First(mut source) => match source.next().await {
                        Some(Ok(item)) => {
                            return Some((Ok(item), (this, open, Attempt::First(source))))
                        }
                        Some(Err(err)) if err.is_unauthorized() => {
                            drop(source);
                            if this.refresh_token().await.is_empty() {
                                let err = this.logout_then(err).await;
                                return Some((Err(err), (this, open, Attempt::Done)));
                            }
                            Attempt::Retried(open().boxed(), err)
                        }
                        Some(Err(err)) => return Some((Err(err), (this, open, Attempt::Done))),
                        None => return None,
                    },
                    Attempt::Retried(mut source, original) => match source.next().await {
                        Some(Ok(item)) => {
                            return Some((Ok(item), (this, open, Attempt::Retried(source, original))))
                        }
                        Some(Err(err)) => {
                            debug!(error = %err, "retried stream failed");
                            drop(source);
                            let err = this.logout_then(original).await;
                            return Some((Err(err), (this, open, Attempt::Done)));
                        }
                        None => return None,
                    },
                    Attempt::Done => return None,
                };
            }
        })
        .boxed()
    }

    /// Ensure a token, then run `request`. No 401 handling.
    pub fn with_ensure_token<T, Fut>(&self, request: Fut) -> BoxFuture<'static, Result<T, ApiError>>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let this = self.clone();
        async move {
            this.ensure_token().await;
            request.await
        }
        .boxed()
    }

    pub fn with_ensure_token_stream<T, S>(&self, source: S) -> BoxStream<'static, Result<T, ApiError>>
    where
        T: Send + 'static,
        S: Stream<Item = Result<T, ApiError>> + Send + 'static,
    {
        let this = self.clone();
        stream::once(async move {
            this.ensure_token().await;
            source
        })
        .flatten()
        .boxed()
    }

    async fn logout_then(&self, original: ApiError) -> ApiError {
        if let Err(err) = self.logout().await {
            debug!(error = %err, "logout failed; returning original error");
        }
        original
    }

    async fn fetch_token(&self, request: HttpRequest) -> String {
        let token = match self.request_token(request).await {
            Ok(token) => token,
            Err(err) => {
                warn!(error = %err, "token request failed");
                String::new()
            }
        };
        self.set_auth(&token)
    }

    async fn request_token(&self, request: HttpRequest) -> Result<String, ApiError> {
        let response = self.inner.transport.send(request).await?;
        if !response.is_success() {
            return Err(ApiError::Transport {
                message: format!("token endpoint answered {}", response.status),
                stack: None,
            });
        }
        let json: TokenJson = response.json().await?;
        Ok(json.token.unwrap_or_default())
    }

    /// Store `token` (formatted) or clear auth when it is empty. Returns the
    /// stored `Authorization` value.
    fn set_auth(&self, token: &str) -> String {
        if token.is_empty() {
            self.inner.store.remove(AUTHORIZATION);
            self.notify(false);
            return String::new();
        }
        let value = (self.inner.format_authorization)(token);
        self.inner.store.merge([(AUTHORIZATION, value.clone())]);
        self.notify(true);
        value
    }

    fn notify(&self, logged_in: bool) {
        if let Some(callback) = &self.inner.on_login_change {
            callback(logged_in);
        }
    }
}
