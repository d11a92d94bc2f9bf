use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    DEFAULT_WINDOW_SECONDS, RecordedUsage, TeamMultipliers, Throttle, ThrottleContext,
    ThrottleResult, ThrottleScope, cache_key, retry_after_seconds,
};
use crate::gateway::limits::{CostRateLimiter, FallbackCounters};

/// USD budget per scope identity and window. Spend is only known after the
/// response, so admission checks what is already spent and `record_cost` charges
/// unconditionally.
pub struct CostThrottle {
    name: String,
    scope: ThrottleScope,
    counters: Arc<FallbackCounters>,
    budget_usd: f64,
    product_budgets: HashMap<String, f64>,
    team_multipliers: TeamMultipliers,
    window_seconds: u64,
}

impl std::fmt::Debug for CostThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostThrottle")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("budget_usd", &self.budget_usd)
            .field("product_budgets", &self.product_budgets)
            .field("window_seconds", &self.window_seconds)
            .finish()
    }
}

impl CostThrottle {
    pub fn new(scope: ThrottleScope, counters: Arc<FallbackCounters>, budget_usd: f64) -> Self {
        Self {
            name: format!("{}_cost", scope.as_str()),
            scope,
            counters,
            budget_usd,
            product_budgets: HashMap::new(),
            team_multipliers: TeamMultipliers::default(),
            window_seconds: DEFAULT_WINDOW_SECONDS,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_product_budget(mut self, product: impl Into<String>, budget_usd: f64) -> Self {
        self.product_budgets.insert(product.into(), budget_usd);
        self
    }

    pub fn with_team_multipliers(mut self, team_multipliers: TeamMultipliers) -> Self {
        self.team_multipliers = team_multipliers;
        self
    }

    pub fn with_window_seconds(mut self, window_seconds: u64) -> Self {
        self.window_seconds = window_seconds.max(1);
        self
    }

    pub fn limiter_for(&self, context: &ThrottleContext) -> (String, CostRateLimiter) {
        let team_multiplier = self
            .team_multipliers
            .for_team(context.user.team_id.as_deref());
        let budget = self
            .product_budgets
            .get(&context.product)
            .copied()
            .unwrap_or(self.budget_usd);
        let budget = (budget * team_multiplier).max(0.0);
        let key = cache_key(&[&self.name, self.scope.identity(context)], team_multiplier);
        (
            key,
            CostRateLimiter::new(self.counters.clone(), budget, self.window_seconds),
        )
    }

    pub async fn record_cost(&self, context: &ThrottleContext, cost_usd: f64) {
        if !cost_usd.is_finite() || cost_usd <= 0.0 {
            return;
        }
        let (key, limiter) = self.limiter_for(context);
        limiter.consume(&key, cost_usd).await;
    }
}

#[async_trait]
impl Throttle for CostThrottle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn allow_request(&self, context: &ThrottleContext) -> ThrottleResult {
        let (key, limiter) = self.limiter_for(context);
        if limiter.get_remaining(&key).await > 0.0 {
            return ThrottleResult::allow();
        }
        let ttl = limiter.get_ttl(&key).await;
        tracing::info!(throttle = %self.name, key, budget_usd = limiter.limit(), "cost budget exhausted");
        ThrottleResult::deny(
            self.name.clone(),
            format!(
                "{} cost budget of ${:.2} exhausted for this window",
                self.scope,
                limiter.limit()
            ),
        )
        .with_retry_after(retry_after_seconds(ttl, limiter.window_seconds()))
    }

    async fn record_usage(&self, context: &ThrottleContext, usage: &RecordedUsage) {
        if let Some(cost_usd) = usage.cost_usd {
            self.record_cost(context, cost_usd).await;
        }
    }
}
