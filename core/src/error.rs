//! Error types for the HTTP client core.
//!
//! # Design
//! Every failure a caller can observe is an `ApiError`. It is `Clone` because
//! the same outcome is fanned out to every caller sharing a single-flight
//! operation or a cached response. Unsuccessful responses land in
//! `HttpResponseError`, which keeps the response head, the raw body and the
//! request that produced it. Servers that speak the legacy `resultType`
//! convention get their payload passed through untouched as `Payload`.

use bytes::Bytes;
use serde_json::Value;

use crate::http::ResponseHead;
use crate::types::RequestDescription;

/// Errors surfaced by `ApiClient`, the caches and the session coordinator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The server answered with a non-success status.
    #[error(transparent)]
    Http(Box<HttpResponseError>),

    /// The server answered with a legacy structured payload carrying a
    /// `resultType` marker; it is propagated as-is.
    #[error("server returned a structured error payload: {0}")]
    Payload(Value),

    /// The transport failed before a response existed.
    #[error("{message}")]
    Transport {
        message: String,
        stack: Option<String>,
    },

    /// A success body could not be deserialized into the expected type.
    #[error("deserialization failed: {0}")]
    DeserializationError(String),

    /// A request payload could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    SerializationError(String),

    /// One line of an NDJSON stream was not valid JSON.
    #[error("malformed NDJSON line {line:?}: {message}")]
    Ndjson { line: String, message: String },

    /// A successful streaming response arrived without a body.
    #[error("response body stream is missing")]
    MissingBody,

    /// A server-side 401 hook interrupted the call with a redirect.
    #[error("redirect to {location}")]
    Redirect { location: String },

    /// A caller-supplied result interceptor failed.
    #[error("result interceptor failed: {0}")]
    Interceptor(String),
}

impl ApiError {
    /// HTTP status of a typed response error, `None` for every other kind.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http(err) => Some(err.status()),
            _ => None,
        }
    }

    /// True only for a typed response error with status 401.
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// The typed response error, if this is one.
    pub fn as_http(&self) -> Option<&HttpResponseError> {
        match self {
            ApiError::Http(err) => Some(err),
            _ => None,
        }
    }
}

impl From<HttpResponseError> for ApiError {
    fn from(err: HttpResponseError) -> Self {
        ApiError::Http(Box::new(err))
    }
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        ApiError::Transport {
            message: err.message,
            stack: err.stack,
        }
    }
}

/// A response that was not successful and not otherwise special-cased.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HttpResponseError {
    head: ResponseHead,
    body: Bytes,
    request: RequestDescription,
    data: Option<Value>,
    message: String,
}

impl HttpResponseError {
    /// Build an error from a response head and its (possibly unread) body.
    ///
    /// Without an explicit message the text is `HTTP {status} / {status_text}`.
    pub fn new(
        head: ResponseHead,
        body: Bytes,
        request: RequestDescription,
        data: Option<Value>,
        message: Option<String>,
    ) -> Self {
        let message =
            message.unwrap_or_else(|| format!("HTTP {} / {}", head.status, head.status_text));
        Self {
            head,
            body,
            request,
            data,
            message,
        }
    }

    pub fn status(&self) -> u16 {
        self.head.status
    }

    pub fn status_text(&self) -> &str {
        &self.head.status_text
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.head.headers
    }

    /// Case-insensitive response header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }

    /// Raw response body. Empty when the body was never read (401 hook path).
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The request description that produced this response.
    pub fn request(&self) -> &RequestDescription {
        &self.request
    }

    /// Parsed error payload: JSON if it parsed, otherwise the body text.
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failure raised by a `Transport` before any response existed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub stack: Option<String>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Capture `err` and its source chain. The chain stands in for a stack.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\ncaused by: ")),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::from_error(&err)
    }
}
