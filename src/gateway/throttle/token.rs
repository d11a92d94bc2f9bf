use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    DEFAULT_WINDOW_SECONDS, RecordedUsage, TeamMultipliers, Throttle, ThrottleContext,
    ThrottleResult, ThrottleScope, cache_key, retry_after_seconds,
};
use crate::gateway::limits::{FallbackCounters, TokenRateLimiter};
use crate::gateway::model_limits::ModelLimits;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Input,
    Output,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

/// Forecast charged at admission and still awaiting reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reservation {
    pub cache_key: String,
    pub reserved: u64,
    pub limit: u64,
    /// [`ThrottleContext::admission_id`] of the admitting request.
    pub admission_id: u64,
}

/// Client request ids are not unique, so reservations are grouped per
/// `(request_id, cache_key)` and told apart by admission id.
type ReservationKey = (String, String);

/// Token throttle over `model_base_limit × limit_multiplier × team_multiplier`.
///
/// Input throttles charge the exact prompt size at admission. Output throttles only
/// know a forecast (`max_output_tokens`): admission checks it against the window,
/// charges it as a reservation owned by the admitting request, and `record_usage`
/// later nets the counter to the actual completion size.
pub struct TokenThrottle {
    name: String,
    kind: TokenKind,
    scope: ThrottleScope,
    counters: Arc<FallbackCounters>,
    model_limits: Arc<dyn ModelLimits>,
    limit_multiplier: f64,
    team_multipliers: TeamMultipliers,
    window_seconds: u64,
    reservations: Mutex<HashMap<ReservationKey, Vec<Reservation>>>,
}

impl std::fmt::Debug for TokenThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenThrottle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("scope", &self.scope)
            .field("limit_multiplier", &self.limit_multiplier)
            .field("window_seconds", &self.window_seconds)
            .field("open_reservations", &self.open_reservations())
            .finish()
    }
}

impl TokenThrottle {
    pub fn new(
        kind: TokenKind,
        scope: ThrottleScope,
        counters: Arc<FallbackCounters>,
        model_limits: Arc<dyn ModelLimits>,
    ) -> Self {
        Self {
            name: format!("{}_{}_tokens", scope.as_str(), kind.as_str()),
            kind,
            scope,
            counters,
            model_limits,
            limit_multiplier: scope.default_limit_multiplier(),
            team_multipliers: TeamMultipliers::default(),
            window_seconds: DEFAULT_WINDOW_SECONDS,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    pub fn input(
        scope: ThrottleScope,
        counters: Arc<FallbackCounters>,
        model_limits: Arc<dyn ModelLimits>,
    ) -> Self {
        Self::new(TokenKind::Input, scope, counters, model_limits)
    }

    pub fn output(
        scope: ThrottleScope,
        counters: Arc<FallbackCounters>,
        model_limits: Arc<dyn ModelLimits>,
    ) -> Self {
        Self::new(TokenKind::Output, scope, counters, model_limits)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_limit_multiplier(mut self, multiplier: f64) -> Self {
        self.limit_multiplier = multiplier;
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

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn scope(&self) -> ThrottleScope {
        self.scope
    }

    /// Counter key and limiter for a request against `model`.
    pub fn limiter_for(&self, context: &ThrottleContext, model: &str) -> (String, TokenRateLimiter) {
        let team_multiplier = self
            .team_multipliers
            .for_team(context.user.team_id.as_deref());
        let base = self.model_limits.limits(model);
        let base = match self.kind {
            TokenKind::Input => base.input_limit,
            TokenKind::Output => base.output_limit,
        };
        let limit = (base as f64 * self.limit_multiplier * team_multiplier).round();
        let limit = if limit.is_finite() && limit > 0.0 {
            limit as u64
        } else {
            0
        };
        let key = cache_key(
            &[&self.name, self.scope.identity(context), model],
            team_multiplier,
        );
        (
            key,
            TokenRateLimiter::new(self.counters.clone(), limit, self.window_seconds),
        )
    }

    /// The reservation `context`'s own admission opened, if still open.
    pub fn reservation(&self, context: &ThrottleContext) -> Option<Reservation> {
        let key = self.reservation_key(context)?;
        self.lock_reservations()
            .get(&key)?
            .iter()
            .find(|reservation| reservation.admission_id == context.admission_id())
            .cloned()
    }

    fn lock_reservations(&self) -> MutexGuard<'_, HashMap<ReservationKey, Vec<Reservation>>> {
        self.reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn reservation_key(&self, context: &ThrottleContext) -> Option<ReservationKey> {
        let request_id = context.request_id.as_deref()?;
        let model = context.model.as_deref()?;
        let (cache_key, _) = self.limiter_for(context, model);
        Some((request_id.to_string(), cache_key))
    }

    /// Removes the reservation opened by `context`'s admission. Unless `exact`, a
    /// rebuilt context for the same request and counter takes the oldest one instead;
    /// each reservation is still netted exactly once.
    fn take_reservation(&self, context: &ThrottleContext, exact: bool) -> Option<Reservation> {
        let key = self.reservation_key(context)?;
        let mut reservations = self.lock_reservations();
        let open = reservations.get_mut(&key)?;
        let index = open
            .iter()
            .position(|reservation| reservation.admission_id == context.admission_id())
            .or((!exact).then_some(0))?;
        let reservation = open.remove(index);
        if open.is_empty() {
            reservations.remove(&key);
        }
        Some(reservation)
    }

    async fn deny(&self, key: &str, limiter: &TokenRateLimiter, model: &str) -> ThrottleResult {
        let ttl = limiter.get_ttl(key).await;
        tracing::info!(
            throttle = %self.name,
            key,
            limit = limiter.limit(),
            "token throttle denied request"
        );
        ThrottleResult::deny(
            self.name.clone(),
            format!(
                "{} {} token limit exceeded for model {model}",
                self.scope,
                self.kind.as_str()
            ),
        )
        .with_retry_after(retry_after_seconds(ttl, limiter.window_seconds()))
    }

    async fn admit_input(&self, context: &ThrottleContext) -> ThrottleResult {
        let (Some(model), Some(tokens)) = (context.model.as_deref(), context.input_tokens) else {
            return ThrottleResult::allow();
        };
        let (key, limiter) = self.limiter_for(context, model);
        if limiter.consume(&key, tokens).await {
            ThrottleResult::allow()
        } else {
            self.deny(&key, &limiter, model).await
        }
    }

    async fn admit_output(&self, context: &ThrottleContext) -> ThrottleResult {
        let (Some(model), Some(forecast)) =
            (context.model.as_deref(), context.max_output_tokens)
        else {
            return ThrottleResult::allow();
        };
        let (key, limiter) = self.limiter_for(context, model);
        if !limiter.would_allow(&key, forecast).await {
            return self.deny(&key, &limiter, model).await;
        }
        let Some(request_id) = context.request_id.as_deref() else {
            return ThrottleResult::allow();
        };

        limiter.consume(&key, forecast).await;
        let reservation = Reservation {
            cache_key: key.clone(),
            reserved: forecast,
            limit: limiter.limit(),
            admission_id: context.admission_id(),
        };
        self.lock_reservations()
            .entry((request_id.to_string(), key))
            .or_default()
            .push(reservation);
        tracing::debug!(
            throttle = %self.name,
            request_id,
            reserved = forecast,
            "output tokens reserved"
        );
        ThrottleResult::allow()
    }
}

#[async_trait]
impl Throttle for TokenThrottle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn allow_request(&self, context: &ThrottleContext) -> ThrottleResult {
        match self.kind {
            TokenKind::Input => self.admit_input(context).await,
            TokenKind::Output => self.admit_output(context).await,
        }
    }

    async fn record_usage(&self, context: &ThrottleContext, usage: &RecordedUsage) {
        if self.kind == TokenKind::Input {
            return;
        }
        let actual = usage.output_tokens;
        let Some(reservation) = self.take_reservation(context, false) else {
            let Some(model) = context.model.as_deref() else {
                return;
            };
            if actual > 0 {
                let (key, limiter) = self.limiter_for(context, model);
                limiter.consume(&key, actual).await;
            }
            return;
        };

        let limiter =
            TokenRateLimiter::new(self.counters.clone(), reservation.limit, self.window_seconds);
        if reservation.reserved > actual {
            limiter
                .release(&reservation.cache_key, reservation.reserved - actual)
                .await;
        } else if actual > reservation.reserved {
            limiter
                .consume(&reservation.cache_key, actual - reservation.reserved)
                .await;
        }
        tracing::debug!(
            throttle = %self.name,
            request_id = context.request_id.as_deref().unwrap_or_default(),
            reserved = reservation.reserved,
            actual,
            "output reservation reconciled"
        );
    }

    async fn release(&self, context: &ThrottleContext) {
        let Some(reservation) = self.take_reservation(context, true) else {
            return;
        };
        let limiter =
            TokenRateLimiter::new(self.counters.clone(), reservation.limit, self.window_seconds);
        limiter
            .release(&reservation.cache_key, reservation.reserved)
            .await;
    }

    fn open_reservations(&self) -> usize {
        self.lock_reservations().values().map(Vec::len).sum()
    }
}
