//! Upstream client: one streamed chat-completion call to the provider.
//!
//! The response body is read lazily. [`SseDecoder`] reassembles SSE lines
//! across TCP chunk boundaries and [`UpstreamClient::complete`] turns each
//! `data:` event into an [`UpstreamChunk`].

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;

use axum::http::{header, HeaderMap};
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::Client;

use super::types::{ChatCompletionChunk, ChatCompletionRequest, Message, UpstreamChunk};
use crate::config::UpstreamConfig;
use crate::error::{Error, Result};

/// Identifies the calling site to the provider.
pub const REFERER_HEADER: &str = "HTTP-Referer";
/// Identifies the app name to the provider.
pub const TITLE_HEADER: &str = "X-Title";

/// Longest SSE line, and longest joined `data:` payload, the decoder accepts.
const MAX_EVENT_BYTES: usize = 64 * 1024;

/// Lazy, non-restartable sequence of chunks from one upstream response.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<UpstreamChunk>> + Send>>;

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
    /// A line or event payload went past [`MAX_EVENT_BYTES`]; carries its size.
    Overflow(usize),
}

/// Incremental SSE decoder.
///
/// Buffers raw bytes across chunk boundaries. Consecutive `data:` lines are
/// joined with `\n` and dispatched as one event at the next blank line. Other
/// fields (`event:`, `id:`, `retry:`) and comment lines are dropped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and collect the events completed by them.
    ///
    /// After an [`SseEvent::Overflow`] the decoder state is reset and the rest
    /// of `bytes` is discarded.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            match self.process_line(&line) {
                Some(event @ SseEvent::Overflow(_)) => {
                    self.reset();
                    events.push(event);
                    return events;
                }
                Some(event) => events.push(event),
                None => {}
            }
        }

        // The unterminated tail can only grow; past the cap it can never fit.
        if self.buffer.len() > MAX_EVENT_BYTES {
            let size = self.buffer.len();
            self.reset();
            events.push(SseEvent::Overflow(size));
        }

        events
    }

    /// Flush a final line that was not newline-terminated and dispatch any
    /// event still being assembled.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.buffer);
        if !line.is_empty() {
            if let Some(event) = self.process_line(&line) {
                self.reset();
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.data = None;
    }

    fn process_line(&mut self, raw: &[u8]) -> Option<SseEvent> {
        let line = raw.strip_suffix(b"\n").unwrap_or(raw);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.len() > MAX_EVENT_BYTES {
            return Some(SseEvent::Overflow(line.len()));
        }
        if line.is_empty() {
            return self.dispatch();
        }

        let Ok(line) = std::str::from_utf8(line) else {
            tracing::warn!(bytes = line.len(), "skipping SSE line that is not UTF-8");
            return None;
        };
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field != "data" {
            return None;
        }

        match self.data.as_mut() {
            Some(data) => {
                data.push('\n');
                data.push_str(value);
            }
            None => self.data = Some(value.to_string()),
        }
        let size = self.data.as_ref().map_or(0, String::len);
        (size > MAX_EVENT_BYTES).then_some(SseEvent::Overflow(size))
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let data = self.data.take()?;
        if data.trim() == "[DONE]" {
            Some(SseEvent::Done)
        } else if data.is_empty() {
            None
        } else {
            Some(SseEvent::Data(data))
        }
    }
}

/// Interpret one `data:` payload.
///
/// Returns `None` for payloads that carry nothing usable (malformed JSON is
/// logged and skipped). A top-level `error` object is a provider failure
/// reported after the response headers were sent.
fn decode_payload(data: &str) -> Option<Result<UpstreamChunk>> {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "skipping malformed SSE payload");
            return None;
        }
    };

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Some(Err(Error::StreamAborted(message)));
    }

    match serde_json::from_value::<ChatCompletionChunk>(value) {
        Ok(chunk) => Some(Ok(UpstreamChunk::from(chunk))),
        Err(e) => {
            tracing::warn!(error = %e, "skipping SSE payload with unexpected shape");
            None
        }
    }
}

/// Pull-driven reader turning a raw byte stream into chunks.
struct ChunkReader {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    finished: bool,
}

impl ChunkReader {
    async fn next_chunk(&mut self) -> Option<Result<UpstreamChunk>> {
        loop {
            while let Some(event) = self.pending.pop_front() {
                match event {
                    SseEvent::Done => {
                        self.finish();
                        return None;
                    }
                    SseEvent::Overflow(size) => {
                        self.finish();
                        tracing::warn!(size, "SSE event exceeds buffer limit, aborting stream");
                        return Some(Err(Error::StreamAborted(format!(
                            "SSE event exceeds {} KiB",
                            MAX_EVENT_BYTES / 1024
                        ))));
                    }
                    SseEvent::Data(data) => {
                        if let Some(item) = decode_payload(&data) {
                            if item.is_err() {
                                self.finish();
                            }
                            return Some(item);
                        }
                    }
                }
            }

            if self.finished {
                return None;
            }

            match self.body.next().await {
                Some(Ok(bytes)) => self.pending.extend(self.decoder.push(&bytes)),
                Some(Err(e)) => {
                    self.finish();
                    return Some(Err(Error::StreamAborted(e.to_string())));
                }
                None => {
                    self.finished = true;
                    self.pending.extend(self.decoder.finish());
                }
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.pending.clear();
    }
}

/// Turn any byte stream carrying an SSE body into a [`ChunkStream`].
pub fn decode_sse_stream(body: BoxStream<'static, reqwest::Result<Bytes>>) -> ChunkStream {
    let reader = ChunkReader {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };
    Box::pin(futures::stream::unfold(reader, |mut reader| async move {
        reader.next_chunk().await.map(|item| (item, reader))
    }))
}

/// Collect response headers into a plain map for error payloads.
fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Extract the human-readable message from a provider error body.
///
/// OpenAI-style bodies look like `{"error": {"message": "..."}}`; anything
/// else is returned verbatim, or the status reason when the body is empty.
fn provider_error_message(status: reqwest::StatusCode, body: &str) -> String {
    let structured = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        });

    match structured {
        Some(message) => message,
        None if !body.trim().is_empty() => body.trim().to_string(),
        None => status
            .canonical_reason()
            .unwrap_or("Upstream error")
            .to_string(),
    }
}

/// Client for the provider's chat-completions endpoint.
#[derive(Clone)]
pub struct UpstreamClient {
    http_client: Client,
    config: UpstreamConfig,
}

impl UpstreamClient {
    pub fn new(http_client: Client, config: UpstreamConfig) -> Self {
        Self {
            http_client,
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    /// Build the request body for `messages` with the fixed decoding settings.
    pub fn request_body<'a>(&'a self, messages: &'a [Message]) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.config.model,
            messages,
            stream: true,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            presence_penalty: self.config.presence_penalty,
            frequency_penalty: self.config.frequency_penalty,
        }
    }

    /// Start a streamed completion.
    ///
    /// Resolves once the provider has answered with response headers. A
    /// non-2xx answer or a connection failure becomes [`Error::Upstream`]
    /// with the provider's status preserved.
    pub async fn complete(&self, messages: &[Message]) -> Result<ChunkStream> {
        let mut request = self
            .http_client
            .post(self.endpoint())
            .header(header::ACCEPT, "text/event-stream")
            .json(&self.request_body(messages));

        if let Some(api_key) = &self.config.api_key {
            request = request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", api_key.expose_secret()),
            );
        }
        if let Some(site_url) = &self.config.site_url {
            request = request.header(REFERER_HEADER, site_url);
        }
        if let Some(site_name) = &self.config.site_name {
            request = request.header(TITLE_HEADER, site_name);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "failed to reach upstream");
            Error::Upstream {
                status: e.status().map(|s| s.as_u16()),
                message: format!("Failed to reach upstream: {}", e),
                headers: BTreeMap::new(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let headers = header_map(response.headers());
            let body = response.text().await.unwrap_or_default();
            let message = provider_error_message(status, &body);
            tracing::error!(
                status = status.as_u16(),
                message = %message,
                "upstream returned error"
            );
            return Err(Error::Upstream {
                status: Some(status.as_u16()),
                message,
                headers,
            });
        }

        tracing::debug!(status = status.as_u16(), "upstream stream opened");
        Ok(decode_sse_stream(response.bytes_stream().boxed()))
    }
}
