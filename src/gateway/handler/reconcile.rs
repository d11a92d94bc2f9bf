use std::sync::Arc;

use super::{RequestOutcome, RequestPhase, log_phase};
use crate::gateway::context::AppContext;
use crate::gateway::provider::Usage;
use crate::gateway::throttle::{RecordedUsage, ThrottleContext};

/// Owns an admitted request's throttle context until its usage is folded back.
///
/// [`UsageReconciler::finalize`] consumes the guard. A guard dropped without being
/// finalized reconciles as [`RequestOutcome::Cancelled`] on a spawned task, with
/// whatever usage was observed so far.
#[derive(Debug)]
pub struct UsageReconciler {
    job: Option<ReconcileJob>,
}

#[derive(Debug)]
struct ReconcileJob {
    context: Arc<AppContext>,
    throttle_context: ThrottleContext,
    observed: Usage,
}

impl UsageReconciler {
    pub fn new(context: Arc<AppContext>, throttle_context: ThrottleContext) -> Self {
        Self {
            job: Some(ReconcileJob {
                context,
                throttle_context,
                observed: Usage::default(),
            }),
        }
    }

    pub fn observe(&mut self, usage: Usage) {
        if let Some(job) = self.job.as_mut() {
            job.observed.merge(usage);
        }
    }

    pub fn observed(&self) -> Usage {
        self.job.as_ref().map(|job| job.observed).unwrap_or_default()
    }

    pub async fn finalize(mut self, outcome: RequestOutcome) {
        if let Some(job) = self.job.take() {
            job.run(outcome).await;
        }
    }
}

impl Drop for UsageReconciler {
    fn drop(&mut self) {
        let Some(job) = self.job.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(job.run(RequestOutcome::Cancelled));
            }
            Err(_) => {
                let spawned = std::thread::Builder::new()
                    .name("gatekeeper-reconcile".to_string())
                    .spawn(move || {
                        let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        else {
                            return;
                        };
                        runtime.block_on(job.run(RequestOutcome::Cancelled));
                    });
                if let Err(err) = spawned {
                    tracing::error!(error = %err, "failed to reconcile dropped request");
                }
            }
        }
    }
}

impl ReconcileJob {
    fn recorded_usage(&self) -> RecordedUsage {
        let input_tokens = self
            .observed
            .input_tokens
            .or(self.throttle_context.input_tokens)
            .unwrap_or(0);
        let output_tokens = self.observed.output_tokens.unwrap_or(0);
        let cost_usd = if self.observed.is_empty() {
            None
        } else {
            self.throttle_context.model.as_deref().and_then(|model| {
                self.context
                    .pricing()
                    .estimate_cost_usd(model, input_tokens, output_tokens)
            })
        };
        RecordedUsage {
            input_tokens,
            output_tokens,
            cost_usd,
        }
    }

    async fn run(self, outcome: RequestOutcome) {
        let request_id = self
            .throttle_context
            .request_id
            .clone()
            .unwrap_or_default();
        log_phase(&request_id, outcome.phase());

        let usage = self.recorded_usage();
        self.context
            .runner()
            .record_usage(&self.throttle_context, &usage)
            .await;
        log_phase(&request_id, RequestPhase::Reconciled);

        let metrics = self.context.metrics();
        let model = self.throttle_context.model.as_deref().unwrap_or_default();
        metrics.record_usage(model, usage.input_tokens, usage.output_tokens);
        if let Some(cost_usd) = usage.cost_usd {
            metrics.record_cost(&self.throttle_context.product, cost_usd);
        }
        metrics.record_outcome(outcome.as_str());
        metrics.in_flight_dec();

        tracing::info!(
            request_id,
            outcome = outcome.as_str(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cost_usd = usage.cost_usd,
            "request reconciled"
        );
        log_phase(&request_id, RequestPhase::Done);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::gateway::auth::{AuthMethod, AuthenticatedUser};
    use crate::gateway::costing::{ModelPricing, PricingTable};
    use crate::gateway::provider::{ProviderCall, ProviderError, ProviderRequest, ProviderResponse};
    use crate::gateway::throttle::{Throttle, ThrottleResult, ThrottleRunner};

    struct Unused;

    #[async_trait]
    impl ProviderCall for Unused {
        async fn call(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Err(ProviderError::new(None, "unused"))
        }
    }

    #[derive(Default)]
    struct Recording {
        calls: AtomicUsize,
        last: Mutex<Option<RecordedUsage>>,
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
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(*usage);
        }
    }

    fn setup() -> (Arc<AppContext>, Arc<Recording>, ThrottleContext) {
        let recording = Arc::new(Recording::default());
        let context = AppContext::new(Arc::new(Unused))
            .with_runner(ThrottleRunner::default().with_throttle(recording.clone()))
            .with_pricing(PricingTable::new().with_model(
                "claude",
                ModelPricing {
                    input_usd_per_token: 0.001,
                    output_usd_per_token: 0.002,
                },
            ));
        let throttle_context = ThrottleContext::new(
            AuthenticatedUser::new("u-1", AuthMethod::PersonalApiKey),
            "wizard",
        )
        .with_model("claude")
        .with_input_tokens(40)
        .with_request_id("req-1");
        (Arc::new(context), recording, throttle_context)
    }

    #[tokio::test]
    async fn finalize_records_observed_usage_and_cost() {
        let (context, recording, throttle_context) = setup();
        context.metrics().in_flight_inc();
        let mut reconciler = UsageReconciler::new(context.clone(), throttle_context);
        reconciler.observe(Usage {
            input_tokens: None,
            output_tokens: Some(10),
        });
        reconciler.finalize(RequestOutcome::Completed).await;

        let usage = recording.last.lock().unwrap().expect("usage");
        assert_eq!(usage.input_tokens, 40);
        assert_eq!(usage.output_tokens, 10);
        let cost = usage.cost_usd.expect("priced");
        assert!((cost - 0.06).abs() < 1e-9);
        assert_eq!(recording.calls.load(Ordering::SeqCst), 1);
        assert_eq!(context.metrics().outcome_count("completed"), 1);
        assert_eq!(context.metrics().in_flight(), 0);
    }

    #[tokio::test]
    async fn unobserved_usage_charges_no_cost() {
        let (context, recording, throttle_context) = setup();
        UsageReconciler::new(context, throttle_context)
            .finalize(RequestOutcome::Failed)
            .await;
        let usage = recording.last.lock().unwrap().expect("usage");
        assert_eq!(usage.output_tokens, 0);
        assert_eq!(usage.cost_usd, None);
    }

    #[tokio::test]
    async fn drop_reconciles_once_as_cancelled() {
        let (context, recording, throttle_context) = setup();
        let mut reconciler = UsageReconciler::new(context.clone(), throttle_context);
        reconciler.observe(Usage::new(40, 3));
        drop(reconciler);

        for _ in 0..100 {
            if recording.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(recording.calls.load(Ordering::SeqCst), 1);
        assert_eq!(context.metrics().outcome_count("cancelled"), 1);
        assert_eq!(
            recording.last.lock().unwrap().map(|usage| usage.output_tokens),
            Some(3)
        );
    }
}
