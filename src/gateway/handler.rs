//! Per-request state machine: validate, gate, admit, call the provider, reconcile.
//!
//! ```text
//! Received -> Admitted -> InFlight -> {Completed | Failed | TimedOut | Cancelled}
//!          -> Reconciled -> Done
//! ```
//!
//! Everything up to `Admitted` happens before any provider call, so rejections cost
//! nothing upstream. Once admitted, a [`UsageReconciler`] owns the request's throttle
//! context and reconciles exactly once on every exit path, including a client that
//! disconnects mid-stream.

mod reconcile;
mod stream;

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::Value;
use tokio::time::Instant;
use tracing::Instrument;

use super::auth::AuthenticatedUser;
use super::context::AppContext;
use super::provider::{ProviderChunk, ProviderError, ProviderRequest, ProviderResponse, ProviderStream};
use super::throttle::ThrottleContext;
use super::token_count::count_input_tokens;
use super::{GatewayError, TimeoutPhase};

pub use reconcile::UsageReconciler;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Admitted,
    InFlight,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    Reconciled,
    Done,
}

impl RequestPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Admitted => "admitted",
            Self::InFlight => "in_flight",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Reconciled => "reconciled",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an admitted request left the provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl RequestOutcome {
    pub fn as_str(self) -> &'static str {
        self.phase().as_str()
    }

    pub fn phase(self) -> RequestPhase {
        match self {
            Self::Completed => RequestPhase::Completed,
            Self::Failed => RequestPhase::Failed,
            Self::TimedOut => RequestPhase::TimedOut,
            Self::Cancelled => RequestPhase::Cancelled,
        }
    }
}

pub(crate) fn log_phase(request_id: &str, phase: RequestPhase) {
    tracing::debug!(request_id, phase = phase.as_str(), "request phase");
}

/// An authenticated request as handed over by the HTTP layer.
#[derive(Clone, Debug)]
pub struct InboundRequest {
    pub user: AuthenticatedUser,
    pub product: String,
    /// Upstream path the body is forwarded to, e.g. `/v1/messages`.
    pub path: String,
    pub body: Bytes,
    pub request_id: String,
    pub end_user_id: Option<String>,
}

pub type GatewayStream = BoxStream<'static, Result<ProviderChunk, GatewayError>>;

pub enum HandlerResponse {
    Json { status: u16, body: Value },
    Stream(GatewayStream),
}

impl std::fmt::Debug for HandlerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json { status, body } => f
                .debug_struct("Json")
                .field("status", status)
                .field("body", body)
                .finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
struct ParsedBody {
    body: Value,
    model: String,
    stream: bool,
    max_tokens: Option<u64>,
}

fn parse_body(raw: &[u8]) -> Result<ParsedBody, GatewayError> {
    let body: Value = serde_json::from_slice(raw)
        .map_err(|err| GatewayError::invalid_request(format!("body is not valid json: {err}")))?;
    let Some(obj) = body.as_object() else {
        return Err(GatewayError::invalid_request("body must be a JSON object"));
    };
    let model = obj
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .ok_or_else(|| GatewayError::invalid_request("`model` must be a non-empty string"))?
        .to_string();
    if obj.get("messages").is_some_and(|messages| !messages.is_array()) {
        return Err(GatewayError::invalid_request("`messages` must be an array"));
    }
    let stream = obj.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let max_tokens = obj
        .get("max_tokens")
        .or_else(|| obj.get("max_completion_tokens"))
        .and_then(Value::as_u64);
    Ok(ParsedBody {
        body,
        model,
        stream,
        max_tokens,
    })
}

#[derive(Clone, Debug)]
pub struct RequestHandler {
    context: Arc<AppContext>,
}

impl RequestHandler {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.context
    }

    pub async fn handle(&self, request: InboundRequest) -> Result<HandlerResponse, GatewayError> {
        let span = tracing::info_span!(
            "request",
            request_id = %request.request_id,
            product = %request.product,
            model = tracing::field::Empty,
        );
        self.handle_inner(request).instrument(span).await
    }

    async fn handle_inner(&self, request: InboundRequest) -> Result<HandlerResponse, GatewayError> {
        let InboundRequest {
            user,
            product,
            path,
            body,
            request_id,
            end_user_id,
        } = request;
        log_phase(&request_id, RequestPhase::Received);

        let parsed = parse_body(&body)?;
        tracing::Span::current().record("model", parsed.model.as_str());

        let products = self.context.products();
        if !products.validate_product(&product) {
            return Err(GatewayError::ProductNotFound { product });
        }
        products
            .check_product_access(
                &product,
                user.auth_method,
                user.application_id.as_deref(),
                Some(&parsed.model),
            )
            .map_err(|reason| GatewayError::Forbidden { reason })?;

        let input_tokens = count_input_tokens(&parsed.model, &parsed.body).await;
        let mut throttle_context = ThrottleContext::new(user, product.clone())
            .with_model(parsed.model.clone())
            .with_input_tokens(input_tokens)
            .with_request_id(request_id.clone());
        if let Some(max_tokens) = parsed.max_tokens {
            throttle_context = throttle_context.with_max_output_tokens(max_tokens);
        }
        if let Some(end_user_id) = end_user_id {
            throttle_context = throttle_context.with_end_user(end_user_id);
        }

        let metrics = self.context.metrics();
        metrics.record_request(&parsed.model);
        let verdict = self.context.runner().check(&throttle_context).await;
        if !verdict.allowed {
            let scope = verdict.scope.unwrap_or_default();
            metrics.record_denial(&scope);
            return Err(GatewayError::ThrottleDenied {
                status: verdict.status_code,
                detail: verdict
                    .detail
                    .unwrap_or_else(|| format!("rate limited by {scope}")),
                scope,
                retry_after: verdict.retry_after,
            });
        }
        log_phase(&request_id, RequestPhase::Admitted);

        metrics.in_flight_inc();
        let mut reconciler = UsageReconciler::new(self.context.clone(), throttle_context);

        let timeouts = self.context.timeouts();
        let started = Instant::now();
        let total_deadline = started + timeouts.total();
        let first_byte_deadline = (started + timeouts.first_byte()).min(total_deadline);
        let (call_deadline, call_phase) = if parsed.stream {
            (first_byte_deadline, TimeoutPhase::FirstByte)
        } else {
            (total_deadline, TimeoutPhase::Total)
        };

        let provider_request = ProviderRequest {
            request_id: request_id.clone(),
            product,
            model: parsed.model,
            path,
            stream: parsed.stream,
            body: parsed.body,
        };
        log_phase(&request_id, RequestPhase::InFlight);
        let call = self.context.provider().call(provider_request);
        let response = match tokio::time::timeout_at(call_deadline, call).await {
            Err(_) => {
                tracing::warn!(phase = %call_phase, "provider call timed out");
                reconciler.finalize(RequestOutcome::TimedOut).await;
                return Err(GatewayError::Timeout { phase: call_phase });
            }
            Ok(Err(err)) => {
                tracing::warn!(status = err.status_code, error = %err, "provider call failed");
                reconciler.finalize(RequestOutcome::Failed).await;
                return Err(err.into());
            }
            Ok(Ok(response)) => response,
        };

        match response {
            ProviderResponse::Complete(completion) => {
                reconciler.observe(completion.usage);
                reconciler.finalize(RequestOutcome::Completed).await;
                Ok(HandlerResponse::Json {
                    status: 200,
                    body: completion.body,
                })
            }
            ProviderResponse::Stream(upstream) if !parsed.stream => {
                let drained =
                    tokio::time::timeout_at(total_deadline, drain(upstream, &mut reconciler)).await;
                match drained {
                    Err(_) => {
                        reconciler.finalize(RequestOutcome::TimedOut).await;
                        Err(GatewayError::Timeout {
                            phase: TimeoutPhase::Total,
                        })
                    }
                    Ok(Err(err)) => {
                        reconciler.finalize(RequestOutcome::Failed).await;
                        Err(err.into())
                    }
                    Ok(Ok(events)) => {
                        reconciler.finalize(RequestOutcome::Completed).await;
                        Ok(HandlerResponse::Json {
                            status: 200,
                            body: Value::Array(events),
                        })
                    }
                }
            }
            ProviderResponse::Stream(upstream) => Ok(HandlerResponse::Stream(
                stream::reconciled_stream(upstream, reconciler, first_byte_deadline, total_deadline),
            )),
        }
    }
}

/// Collects a stream the client did not ask for into the JSON array of its events.
async fn drain(
    mut upstream: ProviderStream,
    reconciler: &mut UsageReconciler,
) -> Result<Vec<Value>, ProviderError> {
    let mut events = Vec::new();
    while let Some(chunk) = upstream.next().await {
        let chunk = chunk?;
        if let Some(usage) = chunk.usage {
            reconciler.observe(usage);
        }
        match serde_json::from_str::<Value>(&chunk.data) {
            Ok(value) => events.push(value),
            Err(_) if chunk.data.trim() == "[DONE]" => {}
            Err(_) => events.push(Value::String(chunk.data)),
        }
    }
    Ok(events)
}
