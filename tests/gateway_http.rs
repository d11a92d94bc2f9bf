use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use futures_util::StreamExt;
use llm_gatekeeper::gateway::model_limits::{ModelTokenLimits, StaticModelLimits};
use llm_gatekeeper::gateway::products::ProductConfig;
use llm_gatekeeper::gateway::{
    AppContext, AuthMethod, AuthenticatedUser, Clock, CounterBackend, FallbackCounters,
    LocalCounters, ProviderCall, ProviderChunk,
    ProviderCompletion, ProviderError, ProviderRequest, ProviderResponse, RecordedUsage,
    StaticKeyAuthenticator, StaticProductPolicy, SystemClock, Throttle, ThrottleContext,
    ThrottleResult, ThrottleRunner, ThrottleScope, TimeoutsConfig, TokenThrottle, Usage, http,
};
use serde_json::{Value, json};
use tower::util::ServiceExt;

#[derive(Clone)]
enum Script {
    Complete(Value, Usage),
    Fail(Option<u16>, &'static str),
    Hang,
    /// Emits the chunks, then never ends.
    OpenStream(Vec<ProviderChunk>),
    Stream(Vec<ProviderChunk>),
}

struct FakeProvider {
    script: Script,
    calls: AtomicUsize,
    last_request: Mutex<Option<ProviderRequest>>,
}

impl FakeProvider {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ProviderCall for FakeProvider {
    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request);
        match self.script.clone() {
            Script::Complete(body, usage) => {
                Ok(ProviderResponse::Complete(ProviderCompletion { body, usage }))
            }
            Script::Fail(status, message) => Err(ProviderError::new(status, message)),
            Script::Hang => {
                futures_util::future::pending::<()>().await;
                unreachable!()
            }
            Script::OpenStream(chunks) => Ok(ProviderResponse::Stream(
                futures_util::stream::iter(chunks.into_iter().map(Ok))
                    .chain(futures_util::stream::pending())
                    .boxed(),
            )),
            Script::Stream(chunks) => Ok(ProviderResponse::Stream(
                futures_util::stream::iter(chunks.into_iter().map(Ok)).boxed(),
            )),
        }
    }
}

/// Records every reconciliation it sees.
#[derive(Default)]
struct Recording {
    reconciled: Mutex<Vec<RecordedUsage>>,
}

impl Recording {
    fn count(&self) -> usize {
        self.reconciled.lock().unwrap().len()
    }

    fn last(&self) -> Option<RecordedUsage> {
        self.reconciled.lock().unwrap().last().copied()
    }

    async fn wait_for(&self, count: usize) {
        for _ in 0..200 {
            if self.count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Throttle for Recording {
    fn name(&self) -> &str {
        "recording"
    }

    async fn allow_request(&self, _context: &ThrottleContext) -> ThrottleResult {
        ThrottleResult::allow()
    }

    async fn record_usage(&self, _context: &ThrottleContext, usage: &RecordedUsage) {
        self.reconciled.lock().unwrap().push(*usage);
    }
}

struct Harness {
    context: Arc<AppContext>,
    provider: Arc<FakeProvider>,
    recording: Arc<Recording>,
}

impl Harness {
    fn new(script: Script) -> Self {
        Self::with(script, |context| context)
    }

    fn with(script: Script, configure: impl FnOnce(AppContext) -> AppContext) -> Self {
        let provider = FakeProvider::new(script);
        let recording = Arc::new(Recording::default());
        let authenticator = StaticKeyAuthenticator::new()
            .with_key(
                "sk-user",
                AuthenticatedUser::new("u-1", AuthMethod::PersonalApiKey),
            )
            .with_key(
                "sk-oauth",
                AuthenticatedUser::new("u-2", AuthMethod::OauthAccessToken),
            );
        let context = AppContext::new(provider.clone())
            .with_authenticator(Arc::new(authenticator))
            .with_runner(ThrottleRunner::default().with_throttle(recording.clone()));
        Self {
            context: Arc::new(configure(context)),
            provider,
            recording,
        }
    }

    async fn send(&self, request: Request<Body>) -> axum::response::Response {
        http::router(self.context.clone())
            .oneshot(request)
            .await
            .unwrap()
    }
}

fn post(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn message(stream: bool) -> Value {
    json!({
        "model": "claude-sonnet",
        "max_tokens": 100,
        "stream": stream,
        "messages": [{"role": "user", "content": "hello there"}]
    })
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn missing_or_unknown_token_is_unauthorized() {
    let harness = Harness::new(Script::Complete(json!({}), Usage::default()));

    let response = harness.send(post("/v1/messages", None, message(false))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let request_id = response.headers()["x-request-id"].to_str().unwrap().to_string();
    assert!(request_id.starts_with("gk-"));
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "authentication_error");

    let response = harness
        .send(post("/v1/messages", Some("sk-nope"), message(false)))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(harness.provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn completes_and_reconciles_reported_usage() {
    let harness = Harness::new(Script::Complete(
        json!({"id": "msg_1", "content": [{"type": "text", "text": "hi"}]}),
        Usage::new(12, 7),
    ));

    let mut request = post("/wizard/v1/messages", Some("sk-user"), message(false));
    request
        .headers_mut()
        .insert("x-request-id", "req-fixed".parse().unwrap());
    request
        .headers_mut()
        .insert("x-end-user-id", "end-9".parse().unwrap());
    let response = harness.send(request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "req-fixed");
    assert_eq!(json_body(response).await["id"], "msg_1");

    let forwarded = harness.provider.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(forwarded.product, "wizard");
    assert_eq!(forwarded.path, "/v1/messages");
    assert_eq!(forwarded.request_id, "req-fixed");

    assert_eq!(harness.recording.count(), 1);
    let usage = harness.recording.last().unwrap();
    assert_eq!((usage.input_tokens, usage.output_tokens), (12, 7));
    assert_eq!(harness.context.metrics().outcome_count("completed"), 1);
    assert_eq!(harness.context.metrics().in_flight(), 0);
}

#[tokio::test]
async fn invalid_bodies_are_rejected_before_the_provider() {
    let harness = Harness::with(Script::Complete(json!({}), Usage::default()), |context| {
        context.with_max_body_bytes(256)
    });

    let response = harness
        .send(post("/v1/messages", Some("sk-user"), json!({"messages": []})))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["type"], "invalid_request_error");

    let big = json!({"model": "m", "messages": [{"role": "user", "content": "x".repeat(1024)}]});
    let response = harness.send(post("/v1/messages", Some("sk-user"), big)).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    assert_eq!(harness.provider.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.recording.count(), 0);
}

#[tokio::test]
async fn product_policy_maps_to_404_and_403() {
    let harness = Harness::with(Script::Complete(json!({}), Usage::default()), |context| {
        let policy = StaticProductPolicy::default().with_product(
            "wizard",
            ProductConfig {
                auth_methods: vec![AuthMethod::OauthAccessToken],
                ..ProductConfig::default()
            },
        );
        context.with_product_policy(Arc::new(policy))
    });

    let response = harness
        .send(post("/nope/v1/messages", Some("sk-user"), message(false)))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"]["type"], "not_found_error");

    let response = harness
        .send(post("/wizard/v1/messages", Some("sk-user"), message(false)))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = harness
        .send(post("/wizard/v1/messages", Some("sk-oauth"), message(false)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(harness.provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn throttled_requests_get_429_with_retry_after() {
    let counters = Arc::new(FallbackCounters::local_only(Arc::new(SystemClock)));
    let model_limits = Arc::new(StaticModelLimits::new(ModelTokenLimits::new(1_000, 1_000)));
    // 1000 / 10 while degraded leaves room for 100 input tokens.
    let runner = ThrottleRunner::default().with_throttle(Arc::new(TokenThrottle::input(
        ThrottleScope::User,
        counters.clone(),
        model_limits,
    )));
    let harness = Harness::with(Script::Complete(json!({}), Usage::default()), |context| {
        context.with_counters(counters).with_runner(runner)
    });

    let huge = json!({
        "model": "claude-sonnet",
        "messages": [{"role": "user", "content": "word ".repeat(200)}]
    });
    let response = harness.send(post("/v1/messages", Some("sk-user"), huge)).await;

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 3600);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "rate_limit_error");
    assert_eq!(body["error"]["scope"], "user_input_tokens");
    assert_eq!(harness.provider.calls.load(Ordering::SeqCst), 0);

    let metrics = harness.context.render_metrics().await;
    assert!(metrics.contains("gatekeeper_throttle_denials_by_scope{scope=\"user_input_tokens\"} 1"));
}

#[tokio::test]
async fn provider_timeout_is_504_and_reconciled() {
    let harness = Harness::with(Script::Hang, |context| {
        context.with_timeouts(TimeoutsConfig {
            first_byte_timeout_ms: 20,
            total_timeout_ms: 50,
        })
    });

    let response = harness
        .send(post("/v1/messages", Some("sk-user"), message(false)))
        .await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json_body(response).await["error"]["type"], "timeout_error");

    assert_eq!(harness.recording.count(), 1);
    let usage = harness.recording.last().unwrap();
    assert!(usage.input_tokens > 0);
    assert_eq!(usage.output_tokens, 0);
    assert_eq!(harness.context.metrics().outcome_count("timed_out"), 1);
}

#[tokio::test]
async fn provider_errors_pass_their_status_through() {
    let harness = Harness::new(Script::Fail(Some(503), "overloaded"));
    let response = harness
        .send(post("/v1/chat/completions", Some("sk-user"), message(false)))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "api_error");
    assert_eq!(
        harness
            .provider
            .last_request
            .lock()
            .unwrap()
            .as_ref()
            .map(|request| request.path.clone()),
        Some("/v1/chat/completions".to_string())
    );
    assert_eq!(harness.context.metrics().outcome_count("failed"), 1);

    let harness = Harness::new(Script::Fail(None, "connection refused"));
    let response = harness
        .send(post("/v1/messages", Some("sk-user"), message(false)))
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(harness.recording.count(), 1);
}

#[tokio::test]
async fn streams_sse_frames_and_reconciles_on_completion() {
    let harness = Harness::new(Script::Stream(vec![
        ProviderChunk::new(r#"{"type":"message_start"}"#)
            .with_event("message_start")
            .with_usage(Usage::new(30, 1)),
        ProviderChunk::new(r#"{"type":"message_delta"}"#)
            .with_event("message_delta")
            .with_usage(Usage {
                input_tokens: None,
                output_tokens: Some(9),
            }),
    ]));

    let response = harness
        .send(post("/v1/messages", Some("sk-user"), message(true)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.starts_with("event: message_start\ndata: {\"type\":\"message_start\"}\n\n"));
    assert!(text.contains("event: message_delta\n"));

    harness.recording.wait_for(1).await;
    let usage = harness.recording.last().unwrap();
    assert_eq!((usage.input_tokens, usage.output_tokens), (30, 9));
    assert_eq!(harness.context.metrics().outcome_count("completed"), 1);
}

#[tokio::test]
async fn non_streaming_request_drains_a_streamed_answer() {
    let harness = Harness::new(Script::Stream(vec![
        ProviderChunk::new(r#"{"n":1}"#),
        ProviderChunk::new(r#"{"n":2}"#).with_usage(Usage::new(5, 4)),
        ProviderChunk::new("[DONE]"),
    ]));

    let response = harness
        .send(post("/v1/chat/completions", Some("sk-user"), message(false)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!([{"n": 1}, {"n": 2}]));
    assert_eq!(harness.recording.last().map(|usage| usage.output_tokens), Some(4));
}

#[tokio::test]
async fn client_disconnect_mid_stream_reconciles_once_with_partial_usage() {
    let chunks = (1..=3)
        .map(|n| {
            ProviderChunk::new(format!("{{\"n\":{n}}}")).with_usage(Usage {
                input_tokens: Some(20),
                output_tokens: Some(n * 10),
            })
        })
        .collect();
    let harness = Harness::new(Script::OpenStream(chunks));

    let response = harness
        .send(post("/v1/messages", Some("sk-user"), message(true)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut frames = response.into_body().into_data_stream();
    for _ in 0..3 {
        frames.next().await.expect("frame").expect("bytes");
    }
    assert_eq!(harness.recording.count(), 0);
    drop(frames);

    harness.recording.wait_for(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.recording.count(), 1);
    let usage = harness.recording.last().unwrap();
    assert_eq!((usage.input_tokens, usage.output_tokens), (20, 30));
    assert_eq!(harness.context.metrics().outcome_count("cancelled"), 1);
    assert_eq!(harness.context.metrics().in_flight(), 0);
}

#[tokio::test]
async fn mid_stream_error_becomes_a_final_error_frame() {
    struct Broken(Mutex<Option<Vec<Result<ProviderChunk, ProviderError>>>>);

    #[async_trait]
    impl ProviderCall for Broken {
        async fn call(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            let items = self.0.lock().unwrap().take().unwrap_or_default();
            Ok(ProviderResponse::Stream(futures_util::stream::iter(items).boxed()))
        }
    }

    let items = vec![
        Ok(ProviderChunk::new("{\"n\":1}")),
        Err(ProviderError::new(Some(502), "upstream reset")),
    ];
    let recording = Arc::new(Recording::default());
    let context = AppContext::new(Arc::new(Broken(Mutex::new(Some(items)))))
        .with_authenticator(Arc::new(StaticKeyAuthenticator::new().with_key(
            "sk-user",
            AuthenticatedUser::new("u-1", AuthMethod::PersonalApiKey),
        )))
        .with_runner(ThrottleRunner::default().with_throttle(recording.clone()));
    let context = Arc::new(context);

    let response = http::router(context.clone())
        .oneshot(post("/v1/messages", Some("sk-user"), message(true)))
        .await
        .unwrap();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.starts_with("data: {\"n\":1}\n\n"));
    assert!(text.ends_with("\n\n"));
    assert!(text.contains("event: error\ndata: {\"error\":{\"type\":\"api_error\""));

    recording.wait_for(1).await;
    assert_eq!(recording.count(), 1);
    assert_eq!(context.metrics().outcome_count("failed"), 1);
}

#[tokio::test]
async fn metrics_and_health_endpoints() {
    let harness = Harness::new(Script::Complete(json!({}), Usage::new(3, 2)));
    let response = harness
        .send(post("/v1/messages", Some("sk-user"), message(false)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = harness
        .send(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("gatekeeper_requests_total 1\n"));
    assert!(text.contains("gatekeeper_requests_by_model{model=\"claude-sonnet\"} 1\n"));
    assert!(text.contains("gatekeeper_output_tokens_by_model{model=\"claude-sonnet\"} 2\n"));
    assert!(text.contains("gatekeeper_responses_total{status=\"200\"} 1\n"));

    let response = harness
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"status": "ok"}));
}

/// Output-token accounting through a real reserving throttle.
struct Reserving {
    harness: Harness,
    output: Arc<TokenThrottle>,
}

impl Reserving {
    fn new(script: Script, timeouts: TimeoutsConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let primary: Arc<dyn CounterBackend> = Arc::new(LocalCounters::new(clock.clone()));
        let counters = Arc::new(FallbackCounters::new(Some(primary), clock));
        let output = Arc::new(TokenThrottle::output(
            ThrottleScope::User,
            counters.clone(),
            Arc::new(StaticModelLimits::new(ModelTokenLimits::new(100_000, 10_000))),
        ));
        let recording = Arc::new(Recording::default());
        let runner = ThrottleRunner::default()
            .with_throttle(output.clone())
            .with_throttle(recording.clone());
        let mut harness = Harness::with(script, |context| {
            context
                .with_counters(counters)
                .with_runner(runner)
                .with_timeouts(timeouts)
        });
        harness.recording = recording;
        Self { harness, output }
    }

    async fn charged(&self, user_id: &str) -> u64 {
        let context = ThrottleContext::new(
            AuthenticatedUser::new(user_id, AuthMethod::PersonalApiKey),
            "llm_gateway",
        );
        let (key, limiter) = self.output.limiter_for(&context, "claude-sonnet");
        limiter.get_current(&key).await
    }

    fn open(&self) -> usize {
        self.output.open_reservations()
    }

    /// Waits for `count` background reconciliations to finish.
    async fn settled(&self, count: usize) {
        self.harness.recording.wait_for(count).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn forecast_request(token: &str, stream: bool) -> Request<Body> {
    post(
        "/v1/messages",
        Some(token),
        json!({
            "model": "claude-sonnet",
            "max_tokens": 2000,
            "stream": stream,
            "messages": [{"role": "user", "content": "hello there"}]
        }),
    )
}

fn counting_chunks() -> Vec<ProviderChunk> {
    (1..=3)
        .map(|n| {
            ProviderChunk::new(format!("{{\"n\":{n}}}")).with_usage(Usage {
                input_tokens: Some(20),
                output_tokens: Some(n * 10),
            })
        })
        .collect()
}

#[tokio::test]
async fn disconnect_nets_the_output_reservation_to_partial_usage() {
    let reserving = Reserving::new(Script::OpenStream(counting_chunks()), TimeoutsConfig::default());

    let response = reserving.harness.send(forecast_request("sk-user", true)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut frames = response.into_body().into_data_stream();
    for _ in 0..3 {
        frames.next().await.expect("frame").expect("bytes");
    }
    assert_eq!(reserving.charged("u-1").await, 2000);
    assert_eq!(reserving.open(), 1);

    drop(frames);
    reserving.settled(1).await;
    assert_eq!(reserving.charged("u-1").await, 30);
    assert_eq!(reserving.open(), 0);
    assert_eq!(reserving.harness.context.runner().open_reservations(), 0);
}

#[tokio::test]
async fn stream_timeout_nets_the_output_reservation_to_partial_usage() {
    let chunks = counting_chunks().into_iter().take(2).collect();
    let reserving = Reserving::new(
        Script::OpenStream(chunks),
        TimeoutsConfig {
            first_byte_timeout_ms: 50,
            total_timeout_ms: 100,
        },
    );

    let response = reserving.harness.send(forecast_request("sk-user", true)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("event: error\ndata: {\"error\":{\"type\":\"timeout_error\""));

    reserving.settled(1).await;
    assert_eq!(reserving.charged("u-1").await, 20);
    assert_eq!(reserving.open(), 0);
    assert_eq!(reserving.harness.context.metrics().outcome_count("timed_out"), 1);
}

#[tokio::test]
async fn provider_timeout_releases_the_whole_output_reservation() {
    let reserving = Reserving::new(
        Script::Hang,
        TimeoutsConfig {
            first_byte_timeout_ms: 20,
            total_timeout_ms: 50,
        },
    );

    let response = reserving.harness.send(forecast_request("sk-user", false)).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(reserving.charged("u-1").await, 0);
    assert_eq!(reserving.open(), 0);
}

#[tokio::test]
async fn provider_error_releases_the_whole_output_reservation() {
    let reserving = Reserving::new(
        Script::Fail(Some(503), "overloaded"),
        TimeoutsConfig::default(),
    );

    let response = reserving.harness.send(forecast_request("sk-user", false)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(reserving.charged("u-1").await, 0);
    assert_eq!(reserving.open(), 0);
}

#[tokio::test]
async fn callers_sharing_a_request_id_are_charged_separately() {
    let reserving = Reserving::new(Script::OpenStream(counting_chunks()), TimeoutsConfig::default());

    let mut streams = Vec::new();
    for token in ["sk-user", "sk-oauth"] {
        let mut request = forecast_request(token, true);
        request
            .headers_mut()
            .insert("x-request-id", "shared".parse().unwrap());
        let response = reserving.harness.send(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        streams.push(response.into_body().into_data_stream());
    }
    assert_eq!(reserving.open(), 2);

    // u-1 reads every chunk, u-2 only the first.
    for (frames, take) in streams.iter_mut().zip([3, 1]) {
        for _ in 0..take {
            frames.next().await.expect("frame").expect("bytes");
        }
    }
    drop(streams);

    reserving.settled(2).await;
    assert_eq!(reserving.charged("u-1").await, 30);
    assert_eq!(reserving.charged("u-2").await, 10);
    assert_eq!(reserving.open(), 0);
}
