use std::sync::Arc;

use futures_util::future::join_all;

use super::{
    CostThrottle, RecordedUsage, TeamMultipliers, Throttle, ThrottleContext, ThrottleResult,
    TokenKind, TokenThrottle,
};
use crate::gateway::config::ThrottleConfig;
use crate::gateway::limits::FallbackCounters;
use crate::gateway::model_limits::ModelLimits;

/// Evaluates every registered throttle for a request.
///
/// Throttles run concurrently, but the reported denial is always the first one in
/// registration order so callers see a deterministic scope.
#[derive(Clone, Default)]
pub struct ThrottleRunner {
    throttles: Vec<Arc<dyn Throttle>>,
}

impl std::fmt::Debug for ThrottleRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleRunner")
            .field("throttles", &self.names())
            .finish()
    }
}

impl ThrottleRunner {
    pub fn new(throttles: Vec<Arc<dyn Throttle>>) -> Self {
        Self { throttles }
    }

    pub fn from_config(
        configs: &[ThrottleConfig],
        counters: Arc<FallbackCounters>,
        model_limits: Arc<dyn ModelLimits>,
        team_multipliers: &TeamMultipliers,
    ) -> Self {
        let throttles = configs
            .iter()
            .map(|config| -> Arc<dyn Throttle> {
                match config {
                    ThrottleConfig::InputTokens {
                        scope,
                        name,
                        limit_multiplier,
                        window_seconds,
                    }
                    | ThrottleConfig::OutputTokens {
                        scope,
                        name,
                        limit_multiplier,
                        window_seconds,
                    } => {
                        let kind = match config {
                            ThrottleConfig::OutputTokens { .. } => TokenKind::Output,
                            _ => TokenKind::Input,
                        };
                        let mut throttle =
                            TokenThrottle::new(kind, *scope, counters.clone(), model_limits.clone())
                                .with_team_multipliers(team_multipliers.clone())
                                .with_window_seconds(*window_seconds);
                        if let Some(name) = name {
                            throttle = throttle.with_name(name.clone());
                        }
                        if let Some(multiplier) = limit_multiplier {
                            throttle = throttle.with_limit_multiplier(*multiplier);
                        }
                        Arc::new(throttle)
                    }
                    ThrottleConfig::Cost {
                        scope,
                        name,
                        budget_usd,
                        product_budgets,
                        window_seconds,
                    } => {
                        let mut throttle = CostThrottle::new(*scope, counters.clone(), *budget_usd)
                            .with_team_multipliers(team_multipliers.clone())
                            .with_window_seconds(*window_seconds);
                        for (product, budget) in product_budgets {
                            throttle = throttle.with_product_budget(product.clone(), *budget);
                        }
                        if let Some(name) = name {
                            throttle = throttle.with_name(name.clone());
                        }
                        Arc::new(throttle)
                    }
                }
            })
            .collect();
        Self { throttles }
    }

    pub fn with_throttle(mut self, throttle: Arc<dyn Throttle>) -> Self {
        self.throttles.push(throttle);
        self
    }

    pub fn len(&self) -> usize {
        self.throttles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.throttles.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.throttles.iter().map(|throttle| throttle.name()).collect()
    }

    /// Not idempotent: input throttles charge on every call.
    pub async fn check(&self, context: &ThrottleContext) -> ThrottleResult {
        let results = join_all(
            self.throttles
                .iter()
                .map(|throttle| throttle.allow_request(context)),
        )
        .await;
        let Some(denial) = results.into_iter().find(|result| !result.allowed) else {
            return ThrottleResult::allow();
        };

        join_all(self.throttles.iter().map(|throttle| throttle.release(context))).await;
        tracing::info!(
            request_id = context.request_id.as_deref().unwrap_or_default(),
            scope = denial.scope.as_deref().unwrap_or_default(),
            status = denial.status_code,
            retry_after = denial.retry_after,
            "request throttled"
        );
        denial
    }

    pub async fn record_usage(&self, context: &ThrottleContext, usage: &RecordedUsage) {
        join_all(
            self.throttles
                .iter()
                .map(|throttle| throttle.record_usage(context, usage)),
        )
        .await;
    }

    /// Admission-time reservations not yet reconciled, across all throttles.
    pub fn open_reservations(&self) -> usize {
        self.throttles
            .iter()
            .map(|throttle| throttle.open_reservations())
            .sum()
    }
}
