//! Server-side helpers: request-scoped context, the 401 redirect hook and a
//! cookie-backed headers provider.

use std::sync::Arc;

use futures::FutureExt;

use crate::client::{HeadersProvider, Server401Hook};
use crate::codec::encode_component;
use crate::error::ApiError;
use crate::session_auth::bearer;
use crate::types::Headers;

/// Read access to the incoming request being served.
pub trait RequestContext: Send + Sync {
    /// Case-insensitive header lookup.
    fn header(&self, name: &str) -> Option<String>;
    fn cookie(&self, name: &str) -> Option<String>;
}

/// `RequestContext` over a captured list of request headers; cookies come
/// from the `Cookie` header.
#[derive(Debug, Clone, Default)]
pub struct CapturedRequest {
    headers: Vec<(String, String)>,
}

impl CapturedRequest {
    pub fn new(headers: Vec<(String, String)>) -> Self {
        Self { headers }
    }
}

impl RequestContext for CapturedRequest {
    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    fn cookie(&self, name: &str) -> Option<String> {
        let raw = self.header("cookie")?;
        raw.split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.to_string())
    }
}

/// `/unauthorized?redirect_uri=<page>&logout=true`, where the page comes
/// from `x-page-url` and defaults to `/`.
pub fn unauthorized_redirect_location(ctx: &dyn RequestContext) -> String {
    let page = ctx
        .header("x-page-url")
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| "/".to_string());
    format!(
        "/unauthorized?redirect_uri={}&logout=true",
        encode_component(&page)
    )
}

/// Server-401 hook that interrupts the call with a redirect to the
/// unauthorized page.
pub fn redirect_on_server_401(ctx: Arc<dyn RequestContext>) -> Server401Hook {
    Arc::new(move || {
        let location = unauthorized_redirect_location(ctx.as_ref());
        tracing::debug!(%location, "redirecting unauthorized server call");
        async move { Err::<(), ApiError>(ApiError::Redirect { location }) }.boxed()
    })
}

/// Headers provider for server-side calls: JSON content type plus a bearer
/// `Authorization` taken from `cookie` when the request carries it.
pub fn cookie_headers_provider(ctx: Arc<dyn RequestContext>, cookie: impl Into<String>) -> HeadersProvider {
    let cookie = cookie.into();
    Arc::new(move || {
        let mut headers = Headers::from([(
            "Content-Type".to_string(),
            "application/json".to_string(),
        )]);
        if let Some(token) = ctx.cookie(&cookie).filter(|t| !t.is_empty()) {
            headers.insert("Authorization".to_string(), bearer(&token));
        }
        futures::future::ready(headers).boxed()
    })
}
