use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;

use super::{
    ProviderCall, ProviderChunk, ProviderCompletion, ProviderError, ProviderRequest,
    ProviderResponse, Usage,
};

/// Upstream error bodies are truncated to this many bytes in messages.
const MAX_ERROR_BODY_BYTES: usize = 4 * 1024;
/// A single SSE event larger than this is dropped rather than buffered forever.
const MAX_SSE_EVENT_BYTES: usize = 1024 * 1024;

/// Forwards requests to an Anthropic- or OpenAI-compatible upstream over HTTP.
#[derive(Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    headers: BTreeMap<String, String>,
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("headers", &"<redacted>")
            .finish()
    }
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            headers: BTreeMap::new(),
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl ProviderCall for HttpProvider {
    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut builder = self
            .client
            .post(self.url(&request.path))
            .header("x-request-id", &request.request_id)
            .json(&request.body);
        if let Some(api_key) = self.api_key.as_deref() {
            builder = if request.path.ends_with("/messages") {
                builder.header("x-api-key", api_key)
            } else {
                builder.bearer_auth(api_key)
            };
        }
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| ProviderError::new(None, format!("upstream request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            let end = body.len().min(MAX_ERROR_BODY_BYTES);
            return Err(ProviderError::new(
                Some(status.as_u16()),
                String::from_utf8_lossy(&body[..end]).into_owned(),
            ));
        }

        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));
        if is_event_stream {
            let upstream = response
                .bytes_stream()
                .map(|chunk| {
                    chunk.map_err(|err| {
                        ProviderError::new(None, format!("upstream stream failed: {err}"))
                    })
                })
                .boxed();
            return Ok(ProviderResponse::Stream(sse_chunks(upstream)));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| ProviderError::new(None, format!("invalid upstream json: {err}")))?;
        let usage = Usage::from_json(&body).unwrap_or_default();
        Ok(ProviderResponse::Complete(ProviderCompletion { body, usage }))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    /// Prefix of `buffer` already known to hold no complete delimiter.
    scanned: usize,
    /// Inside an oversized event: input is dropped up to the next delimiter.
    discarding: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every event completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        // A delimiter may straddle the previous scan end by up to three bytes.
        while let Some((pos, delimiter_len)) =
            find_sse_delimiter(self.buffer.as_ref(), self.scanned.saturating_sub(3))
        {
            let event = self.buffer.split_to(pos);
            let _ = self.buffer.split_to(delimiter_len);
            self.scanned = 0;
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if let Some(frame) = parse_sse_event(event.as_ref()) {
                frames.push(frame);
            }
        }
        self.scanned = self.buffer.len();

        if self.buffer.len() > MAX_SSE_EVENT_BYTES {
            if !self.discarding {
                tracing::warn!(bytes = self.buffer.len(), "dropping oversized sse event");
            }
            // Keep the tail so a delimiter split across pushes is still found.
            let tail = self.buffer.split_off(self.buffer.len() - 3);
            self.buffer = tail;
            self.scanned = self.buffer.len();
            self.discarding = true;
        }
        frames
    }

    /// The trailing event of a stream that ended without a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = self.buffer.split();
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        parse_sse_event(rest.as_ref())
    }
}

fn find_sse_delimiter(buf: &[u8], start: usize) -> Option<(usize, usize)> {
    // Single forward scan so mixed newline styles split at the earliest boundary.
    let mut idx = start;
    while idx + 1 < buf.len() {
        if buf[idx] == b'\n' && buf[idx + 1] == b'\n' {
            return Some((idx, 2));
        }
        if idx + 3 < buf.len() && &buf[idx..idx + 4] == b"\r\n\r\n" {
            return Some((idx, 4));
        }
        idx += 1;
    }
    None
}

fn parse_sse_event(event: &[u8]) -> Option<SseFrame> {
    let mut name = None;
    let mut data = Vec::<u8>::new();
    let mut has_data = false;
    for line in event.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if let Some(rest) = line.strip_prefix(b"event:") {
            name = Some(String::from_utf8_lossy(rest.trim_ascii()).into_owned());
        } else if let Some(rest) = line.strip_prefix(b"data:") {
            if has_data {
                data.push(b'\n');
            }
            data.extend_from_slice(rest.strip_prefix(b" ").unwrap_or(rest));
            has_data = true;
        }
    }
    has_data.then(|| SseFrame {
        event: name.filter(|name| !name.is_empty()),
        data: String::from_utf8_lossy(&data).into_owned(),
    })
}

fn frame_to_chunk(frame: SseFrame) -> ProviderChunk {
    let usage = serde_json::from_str::<serde_json::Value>(&frame.data)
        .ok()
        .and_then(|value| Usage::from_json(&value));
    ProviderChunk {
        event: frame.event,
        data: frame.data,
        usage,
    }
}

struct SseChunkState {
    upstream: BoxStream<'static, Result<Bytes, ProviderError>>,
    decoder: SseDecoder,
    pending: VecDeque<SseFrame>,
    done: bool,
}

fn sse_chunks(upstream: BoxStream<'static, Result<Bytes, ProviderError>>) -> super::ProviderStream {
    let state = SseChunkState {
        upstream,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };
    futures_util::stream::try_unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Ok(Some((frame_to_chunk(frame), state)));
            }
            if state.done {
                return Ok(None);
            }
            match state.upstream.next().await {
                Some(Ok(bytes)) => state.pending.extend(state.decoder.push(&bytes)),
                Some(Err(err)) => return Err(err),
                None => {
                    state.done = true;
                    state.pending.extend(state.decoder.finish());
                }
            }
        }
    })
    .boxed()
}
