//! Scripted transport double for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::TransportError;
use crate::http::{HttpRequest, HttpResponse};
use crate::transport::Transport;

enum Scripted {
    Response(HttpResponse),
    Error(String),
}

/// Replays queued responses in order and records every request it sees.
/// An exhausted script answers 599.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every response is delayed by `delay` (tokio time, so it can be paused).
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub(crate) fn push_response(&self, response: HttpResponse) {
        self.script.lock().push_back(Scripted::Response(response));
    }

    pub(crate) fn push_json(&self, status: u16, body: Value) {
        self.push_response(HttpResponse::new(
            status,
            vec![("Content-Type".to_string(), "application/json".to_string())],
            body.to_string(),
        ));
    }

    pub(crate) fn push_text(&self, status: u16, body: &str) {
        self.push_response(HttpResponse::new(status, Vec::new(), body.to_string()));
    }

    pub(crate) fn push_chunks(&self, status: u16, chunks: Vec<&'static str>) {
        let chunks: Vec<Result<Bytes, TransportError>> = chunks
            .into_iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        self.push_response(HttpResponse::streaming(
            status,
            Vec::new(),
            stream::iter(chunks).boxed(),
        ));
    }

    pub(crate) fn push_error(&self, message: &str) {
        self.script
            .lock()
            .push_back(Scripted::Error(message.to_string()));
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub(crate) fn request(&self, index: usize) -> HttpRequest {
        self.requests.lock()[index].clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request);
        let next = self.script.lock().pop_front();
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match next {
            Some(Scripted::Response(res)) => Ok(res),
            Some(Scripted::Error(message)) => Err(TransportError::new(message)),
            None => Ok(HttpResponse::without_body(599, Vec::new())),
        }
    }
}
