//! Prometheus text exposition for the gateway.
//!
//! Label families whose values come from callers (models, products, throttle names)
//! go through [`TopKCounter`] so the number of series stays bounded.

mod topk;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use topk::TopKCounter;

const DEFAULT_TOP_K: usize = 50;

/// Process state sampled at scrape time rather than recorded as events.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuntimeSnapshot {
    pub counter_fallbacks: u64,
    pub local_counter_entries: usize,
    pub open_reservations: usize,
    /// `None` when no Redis is configured.
    pub redis_connected: Option<bool>,
}

#[derive(Debug)]
struct MetricsState {
    requests_total: u64,
    requests_by_model: TopKCounter,
    input_tokens_by_model: TopKCounter,
    output_tokens_by_model: TopKCounter,
    cost_usd_by_product: TopKCounter,
    denials_by_scope: TopKCounter,
    outcomes: BTreeMap<&'static str, u64>,
    responses_by_status: BTreeMap<u16, u64>,
}

#[derive(Debug)]
pub struct GatewayMetrics {
    state: Mutex<MetricsState>,
    in_flight: AtomicI64,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_K)
    }
}

impl GatewayMetrics {
    pub fn new(top_k: usize) -> Self {
        Self {
            state: Mutex::new(MetricsState {
                requests_total: 0,
                requests_by_model: TopKCounter::new(top_k),
                input_tokens_by_model: TopKCounter::new(top_k),
                output_tokens_by_model: TopKCounter::new(top_k),
                cost_usd_by_product: TopKCounter::new(top_k),
                denials_by_scope: TopKCounter::new(top_k),
                outcomes: BTreeMap::new(),
                responses_by_status: BTreeMap::new(),
            }),
            in_flight: AtomicI64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_request(&self, model: &str) {
        let mut state = self.lock();
        state.requests_total = state.requests_total.saturating_add(1);
        state.requests_by_model.inc(model, 1.0);
    }

    pub fn record_denial(&self, scope: &str) {
        self.lock().denials_by_scope.inc(scope, 1.0);
    }

    pub fn record_usage(&self, model: &str, input_tokens: u64, output_tokens: u64) {
        let mut state = self.lock();
        state.input_tokens_by_model.inc(model, input_tokens as f64);
        state.output_tokens_by_model.inc(model, output_tokens as f64);
    }

    pub fn record_cost(&self, product: &str, cost_usd: f64) {
        self.lock().cost_usd_by_product.inc(product, cost_usd);
    }

    pub fn record_outcome(&self, outcome: &'static str) {
        *self.lock().outcomes.entry(outcome).or_default() += 1;
    }

    pub fn record_response_status(&self, status: u16) {
        *self.lock().responses_by_status.entry(status).or_default() += 1;
    }

    pub fn outcome_count(&self, outcome: &str) -> u64 {
        self.lock().outcomes.get(outcome).copied().unwrap_or(0)
    }

    pub fn in_flight_inc(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_flight_dec(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn render(&self, snapshot: RuntimeSnapshot) -> String {
        let state = self.lock();
        let mut out = String::new();

        out.push_str("# HELP gatekeeper_requests_total Requests that passed validation.\n");
        out.push_str("# TYPE gatekeeper_requests_total counter\n");
        out.push_str(&format!("gatekeeper_requests_total {}\n", state.requests_total));

        state.requests_by_model.render_gauge(
            &mut out,
            "gatekeeper_requests_by_model",
            "Requests grouped by model (top-k).",
            "model",
        );
        state.input_tokens_by_model.render_gauge(
            &mut out,
            "gatekeeper_input_tokens_by_model",
            "Reconciled input tokens grouped by model (top-k).",
            "model",
        );
        state.output_tokens_by_model.render_gauge(
            &mut out,
            "gatekeeper_output_tokens_by_model",
            "Reconciled output tokens grouped by model (top-k).",
            "model",
        );
        state.cost_usd_by_product.render_gauge(
            &mut out,
            "gatekeeper_cost_usd_by_product",
            "Reconciled spend in USD grouped by product (top-k).",
            "product",
        );
        state.denials_by_scope.render_gauge(
            &mut out,
            "gatekeeper_throttle_denials_by_scope",
            "Throttle denials grouped by denying throttle (top-k).",
            "scope",
        );

        write_counter_map(
            &mut out,
            "gatekeeper_request_outcomes_total",
            "Reconciled requests grouped by terminal outcome.",
            "outcome",
            state.outcomes.iter().map(|(outcome, count)| (outcome.to_string(), *count)),
        );
        write_counter_map(
            &mut out,
            "gatekeeper_responses_total",
            "HTTP responses grouped by status code.",
            "status",
            state
                .responses_by_status
                .iter()
                .map(|(status, count)| (status.to_string(), *count)),
        );

        write_gauge(
            &mut out,
            "gatekeeper_in_flight_requests",
            "Admitted requests not yet reconciled.",
            self.in_flight().max(0) as u64,
        );
        write_gauge(
            &mut out,
            "gatekeeper_open_reservations",
            "Output-token reservations awaiting reconciliation.",
            snapshot.open_reservations as u64,
        );
        write_gauge(
            &mut out,
            "gatekeeper_local_counter_entries",
            "Live entries in the process-local fallback counters.",
            snapshot.local_counter_entries as u64,
        );

        out.push_str(
            "# HELP gatekeeper_counter_fallbacks_total Counter operations served locally after a backend failure.\n",
        );
        out.push_str("# TYPE gatekeeper_counter_fallbacks_total counter\n");
        out.push_str(&format!(
            "gatekeeper_counter_fallbacks_total {}\n",
            snapshot.counter_fallbacks
        ));

        if let Some(connected) = snapshot.redis_connected {
            write_gauge(
                &mut out,
                "gatekeeper_redis_connected",
                "Whether a Redis connection is currently established.",
                u64::from(connected),
            );
        }

        out
    }
}

fn write_gauge(out: &mut String, metric: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} gauge\n"));
    out.push_str(&format!("{metric} {value}\n"));
}

fn write_counter_map(
    out: &mut String,
    metric: &str,
    help: &str,
    label: &str,
    entries: impl Iterator<Item = (String, u64)>,
) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} counter\n"));
    for (value, count) in entries {
        out.push_str(&format!(
            "{metric}{{{label}=\"{}\"}} {count}\n",
            escape_label_value(&value)
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::new();
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}
