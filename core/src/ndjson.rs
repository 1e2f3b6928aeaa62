//! # NDJSON stream decoding
//!
//! [`NdjsonStream`] turns a response body into a stream of values, one per
//! line. Lines may span any number of body chunks and one chunk may hold
//! many lines; both `\n` and `\r\n` terminate a line and blank lines are
//! skipped. When the body ends, a non-blank trailing line without a
//! terminator is parsed as the final value.
//!
//! A line that is not valid JSON is terminal: the error is yielded and the
//! stream ends, dropping the body reader. Dropping the stream early also
//! drops the reader.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;

use crate::error::ApiError;
use crate::http::ByteStream;

/// Streaming newline-delimited JSON decoder.
pub struct NdjsonStream<T> {
    /// Body reader; `None` once the body ended or the stream failed.
    body: Option<ByteStream>,
    /// Bytes of the current, not yet terminated line.
    buffer: Vec<u8>,
    /// Decoded values waiting to be yielded.
    queue: VecDeque<Result<T, ApiError>>,
    _marker: PhantomData<fn() -> T>,
}

// No field is structurally pinned.
impl<T> Unpin for NdjsonStream<T> {}

impl<T: DeserializeOwned> NdjsonStream<T> {
    pub fn new(body: ByteStream) -> Self {
        Self {
            body: Some(body),
            buffer: Vec::with_capacity(256),
            queue: VecDeque::new(),
            _marker: PhantomData,
        }
    }

    fn append(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(item) = decode_line(&line[..pos]) {
                let failed = item.is_err();
                self.queue.push_back(item);
                if failed {
                    self.fail();
                    return;
                }
            }
        }
    }

    fn flush(&mut self) {
        let rest = std::mem::take(&mut self.buffer);
        if let Some(item) = decode_line(&rest) {
            self.queue.push_back(item);
        }
    }

    fn fail(&mut self) {
        self.body = None;
        self.buffer.clear();
    }
}

fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Option<Result<T, ApiError>> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(e) => {
            return Some(Err(ApiError::Ndjson {
                line: String::from_utf8_lossy(line).into_owned(),
                message: e.to_string(),
            }))
        }
    };
    if text.trim().is_empty() {
        return None;
    }
    Some(serde_json::from_str(text).map_err(|e| ApiError::Ndjson {
        line: text.to_string(),
        message: e.to_string(),
    }))
}

impl<T: DeserializeOwned> Stream for NdjsonStream<T> {
    type Item = Result<T, ApiError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                if item.is_err() {
                    self.queue.clear();
                }
                return Poll::Ready(Some(item));
            }

            let Some(body) = self.body.as_mut() else {
                return Poll::Ready(None);
            };

            match ready!(body.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => self.append(&chunk),
                Some(Err(err)) => {
                    self.fail();
                    return Poll::Ready(Some(Err(err.into())));
                }
                None => {
                    self.body = None;
                    self.flush();
                }
            }
        }
    }
}
