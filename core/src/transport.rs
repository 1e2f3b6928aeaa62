//! The transport seam: whatever actually moves bytes over the network.
//!
//! The core never opens sockets itself. `ReqwestTransport` is the stock
//! implementation; tests and embedders plug in their own.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::multipart::{Form, Part};
use tracing::trace;

use crate::error::TransportError;
use crate::http::{FormValue, HttpMethod, HttpRequest, HttpResponse, MultipartForm, RequestBody};

/// Executes one HTTP round-trip.
///
/// Implementations return `Ok` for every response the server produced,
/// whatever its status; `Err` is reserved for failures where no response
/// exists (DNS, connect, TLS, aborted body).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// `Transport` backed by a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.request(to_reqwest_method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            Some(RequestBody::Text(text)) => builder.body(text),
            Some(RequestBody::Bytes(bytes)) => builder.body(bytes),
            Some(RequestBody::Multipart(form)) => builder.multipart(to_reqwest_form(form)?),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status();
        trace!(status = status.as_u16(), url = %request.url, "reqwest response");

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes_stream().map_err(TransportError::from).boxed();

        Ok(HttpResponse::streaming(status.as_u16(), headers, body)
            .with_status_text(status.canonical_reason().unwrap_or_default()))
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Options => reqwest::Method::OPTIONS,
    }
}

fn to_reqwest_form(form: MultipartForm) -> Result<Form, TransportError> {
    let mut out = Form::new();
    for (name, value) in form.parts {
        out = match value {
            FormValue::Text(text) => out.text(name, text),
            FormValue::File {
                filename,
                content_type,
                bytes,
            } => {
                let mut part = Part::bytes(bytes.to_vec()).file_name(filename);
                if let Some(mime) = content_type {
                    part = part.mime_str(&mime)?;
                }
                out.part(name, part)
            }
        };
    }
    Ok(out)
}
