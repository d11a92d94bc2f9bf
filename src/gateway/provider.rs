//! The upstream LLM call, as seen by the request handler.

mod http;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use http::{HttpProvider, SseDecoder, SseFrame};

/// Token usage reported by a provider. Streaming providers report cumulative
/// values, so a later observation replaces an earlier one field by field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens: Some(input_tokens),
            output_tokens: Some(output_tokens),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none()
    }

    pub fn merge(&mut self, other: Usage) {
        if other.input_tokens.is_some() {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens.is_some() {
            self.output_tokens = other.output_tokens;
        }
    }

    /// Reads `usage` from an Anthropic or OpenAI response body or stream event.
    /// Anthropic's `message_start` nests it under `message`.
    pub fn from_json(value: &Value) -> Option<Self> {
        let usage = value
            .get("usage")
            .or_else(|| value.get("message").and_then(|message| message.get("usage")))?;
        let read = |keys: [&str; 2]| {
            keys.iter()
                .find_map(|key| usage.get(*key).and_then(|value| value.as_u64()))
        };
        let parsed = Self {
            input_tokens: read(["input_tokens", "prompt_tokens"]),
            output_tokens: read(["output_tokens", "completion_tokens"]),
        };
        (!parsed.is_empty()).then_some(parsed)
    }
}

#[derive(Clone, Debug)]
pub struct ProviderRequest {
    pub request_id: String,
    pub product: String,
    pub model: String,
    /// Upstream path, e.g. `/v1/messages`.
    pub path: String,
    pub stream: bool,
    pub body: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProviderCompletion {
    pub body: Value,
    pub usage: Usage,
}

/// One server-sent event from the provider.
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderChunk {
    pub event: Option<String>,
    pub data: String,
    pub usage: Option<Usage>,
}

impl ProviderChunk {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
            usage: None,
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

pub type ProviderStream = BoxStream<'static, Result<ProviderChunk, ProviderError>>;

pub enum ProviderResponse {
    Complete(ProviderCompletion),
    Stream(ProviderStream),
}

impl std::fmt::Debug for ProviderResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(completion) => f.debug_tuple("Complete").field(completion).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProviderError {
    /// Upstream HTTP status, when the provider answered at all.
    pub status_code: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ProviderCall: Send + Sync {
    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}
