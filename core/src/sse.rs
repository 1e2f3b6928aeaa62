//! Server-sent events as a stream of decoded JSON messages.
//!
//! Only the `data` field matters here: each dispatched event's data is
//! parsed as JSON and yielded. The stream completes quietly on the first
//! transport error, malformed message or end of body; dropping it closes
//! the connection.

use std::collections::VecDeque;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::http::ByteStream;

/// Incremental `text/event-stream` parser.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
    ready: VecDeque<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; completed events become available via `next_event`.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = &line[..pos];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            self.process_line(&String::from_utf8_lossy(line));
        }
    }

    /// Data of the next dispatched event, lines joined with `\n`.
    pub fn next_event(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    fn process_line(&mut self, line: &str) {
        if line.is_empty() {
            if !self.data.is_empty() {
                self.ready.push_back(self.data.join("\n"));
                self.data.clear();
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
    }
}

/// Decode every event of `body` as JSON.
pub fn json_events<T>(body: ByteStream) -> BoxStream<'static, T>
where
    T: DeserializeOwned + Send + 'static,
{
    stream::unfold((body, SseDecoder::new()), |(mut body, mut decoder)| async move {
        loop {
            if let Some(data) = decoder.next_event() {
                return match serde_json::from_str::<T>(&data) {
                    Ok(value) => Some((value, (body, decoder))),
                    Err(err) => {
                        debug!(error = %err, "closing event stream on malformed message");
                        None
                    }
                };
            }
            match body.next().await {
                Some(Ok(chunk)) => decoder.push(&chunk),
                Some(Err(err)) => {
                    debug!(error = %err, "closing event stream on transport error");
                    return None;
                }
                None => return None,
            }
        }
    })
    .boxed()
}
