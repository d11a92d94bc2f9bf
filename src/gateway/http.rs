//! Inbound HTTP surface (axum).

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use futures_util::StreamExt;
use serde::Serialize;

use super::GatewayError;
use super::context::AppContext;
use super::handler::{HandlerResponse, InboundRequest, RequestHandler};

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

impl ErrorResponse {
    fn from_error(err: &GatewayError) -> Self {
        Self {
            error: ErrorDetail {
                kind: err.kind(),
                scope: err.scope().map(str::to_string),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    redis_connected: Option<bool>,
}

pub fn router(context: Arc<AppContext>) -> Router {
    let max_body_bytes = context.max_body_bytes();
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/messages", post(handle_default_product))
        .route("/v1/chat/completions", post(handle_default_product))
        .route("/:product/v1/messages", post(handle_product))
        .route("/:product/v1/chat/completions", post(handle_product))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(RequestHandler::new(context))
}

async fn health(State(handler): State<RequestHandler>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        redis_connected: handler.context().redis_connected().await,
    })
}

async fn metrics(State(handler): State<RequestHandler>) -> impl IntoResponse {
    let rendered = handler.context().render_metrics().await;
    (
        [(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"))],
        rendered,
    )
}

async fn handle_default_product(
    State(handler): State<RequestHandler>,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let product = handler.context().default_product().to_string();
    dispatch(&handler, product, &uri, &headers, body).await
}

async fn handle_product(
    State(handler): State<RequestHandler>,
    Path(product): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    dispatch(&handler, product, &uri, &headers, body).await
}

async fn dispatch(
    handler: &RequestHandler,
    product: String,
    uri: &Uri,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let request_id = extract_header(headers, "x-request-id").unwrap_or_else(generate_request_id);
    let result = serve(handler, product, uri, headers, body, &request_id).await;
    let mut response = match result {
        Ok(HandlerResponse::Json { status, body }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            (status, Json(body)).into_response()
        }
        Ok(HandlerResponse::Stream(stream)) => {
            let frames = stream.map(|item| {
                Ok::<_, Infallible>(match item {
                    Ok(chunk) => sse_frame(chunk.event.as_deref(), &chunk.data),
                    Err(err) => error_frame(&err),
                })
            });
            let mut response = Response::new(Body::from_stream(frames));
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            response
        }
        Err(err) => {
            if err.status() >= 500 {
                tracing::warn!(request_id, status = err.status(), error = %err, "request failed");
            } else {
                tracing::debug!(request_id, status = err.status(), error = %err, "request rejected");
            }
            error_response(&err)
        }
    };
    insert_request_id(response.headers_mut(), &request_id);
    handler
        .context()
        .metrics()
        .record_response_status(response.status().as_u16());
    response
}

async fn serve(
    handler: &RequestHandler,
    product: String,
    uri: &Uri,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
    request_id: &str,
) -> Result<HandlerResponse, GatewayError> {
    let token = extract_bearer(headers).ok_or(GatewayError::Unauthorized)?;
    let user = handler
        .context()
        .authenticator()
        .authenticate(&token)
        .await
        .ok_or(GatewayError::Unauthorized)?;
    let body = body.map_err(|rejection| GatewayError::Validation {
        status: rejection.status().as_u16(),
        reason: rejection.body_text(),
    })?;

    handler
        .handle(InboundRequest {
            user,
            product,
            path: upstream_path(uri.path()).to_string(),
            body,
            request_id: request_id.to_string(),
            end_user_id: extract_header(headers, "x-end-user-id"),
        })
        .await
}

fn error_response(err: &GatewayError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(ErrorResponse::from_error(err))).into_response();
    if let Some(retry_after) = err.retry_after() {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(retry_after));
    }
    response
}

fn upstream_path(path: &str) -> &'static str {
    if path.ends_with("/chat/completions") {
        "/v1/chat/completions"
    } else {
        "/v1/messages"
    }
}

fn sse_frame(event: Option<&str>, data: &str) -> Bytes {
    let mut out = String::new();
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

fn error_frame(err: &GatewayError) -> Bytes {
    let data = serde_json::to_string(&ErrorResponse::from_error(err))
        .unwrap_or_else(|_| "{\"error\":{\"type\":\"api_error\"}}".to_string());
    sse_frame(Some("error"), &data)
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = extract_header(headers, "authorization")?;
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("gk-{ts_ms}-{seq}")
}

fn insert_request_id(headers: &mut HeaderMap, request_id: &str) {
    let Ok(value) = HeaderValue::from_str(request_id) else {
        return;
    };
    headers.insert("x-request-id", value);
}
