//! Admission throttles.
//!
//! A throttle answers one question per request (admit or deny) against a single
//! fixed-window counter namespace, and later folds the request's actual usage back
//! into that namespace. Throttles are scoped to the caller, the product or the whole
//! deployment; the scope decides which identity lands in the counter key.

mod cost;
mod runner;
mod token;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::auth::AuthenticatedUser;

pub use cost::CostThrottle;
pub use runner::ThrottleRunner;
pub use token::{Reservation, TokenKind, TokenThrottle};

/// Window used when a throttle does not configure one.
pub const DEFAULT_WINDOW_SECONDS: u64 = 3600;

/// Immutable per-request view handed to every throttle.
#[derive(Clone, Debug)]
pub struct ThrottleContext {
    pub user: AuthenticatedUser,
    pub product: String,
    pub model: Option<String>,
    /// Exact prompt size, known before the provider call.
    pub input_tokens: Option<u64>,
    /// Upper bound on the completion; only a forecast.
    pub max_output_tokens: Option<u64>,
    pub end_user_id: Option<String>,
    /// Caller-supplied correlation id. Not unique: clients may reuse it.
    pub request_id: Option<String>,
    admission_id: u64,
}

impl ThrottleContext {
    pub fn new(user: AuthenticatedUser, product: impl Into<String>) -> Self {
        Self {
            user,
            product: product.into(),
            model: None,
            input_tokens: None,
            max_output_tokens: None,
            end_user_id: None,
            request_id: None,
            admission_id: next_admission_id(),
        }
    }

    /// Process-unique id of this context; clones share it.
    pub fn admission_id(&self) -> u64 {
        self.admission_id
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_input_tokens(mut self, tokens: u64) -> Self {
        self.input_tokens = Some(tokens);
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u64) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    pub fn with_end_user(mut self, end_user_id: impl Into<String>) -> Self {
        self.end_user_id = Some(end_user_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

fn next_admission_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Debug, PartialEq)]
pub struct ThrottleResult {
    pub allowed: bool,
    pub status_code: u16,
    pub detail: Option<String>,
    /// Name of the denying throttle.
    pub scope: Option<String>,
    pub retry_after: Option<u64>,
}

impl ThrottleResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            status_code: 200,
            detail: None,
            scope: None,
            retry_after: None,
        }
    }

    pub fn deny(scope: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            allowed: false,
            status_code: 429,
            detail: Some(detail.into()),
            scope: Some(scope.into()),
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleScope {
    User,
    Product,
    Global,
}

impl ThrottleScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Product => "product",
            Self::Global => "global",
        }
    }

    /// The counter identity this scope charges for a request.
    pub fn identity<'a>(self, context: &'a ThrottleContext) -> &'a str {
        match self {
            Self::User => context
                .end_user_id
                .as_deref()
                .unwrap_or(context.user.user_id.as_str()),
            Self::Product => context.product.as_str(),
            Self::Global => "global",
        }
    }

    pub fn default_limit_multiplier(self) -> f64 {
        match self {
            Self::User => 1.0,
            Self::Product | Self::Global => 10.0,
        }
    }
}

impl std::fmt::Display for ThrottleScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage charged back to throttles once a request has finished.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RecordedUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// `None` when the model has no price.
    pub cost_usd: Option<f64>,
}

/// Per-team limit scaling. Teams without an entry get 1.0.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TeamMultipliers(HashMap<String, f64>);

impl TeamMultipliers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_team(mut self, team_id: impl Into<String>, multiplier: f64) -> Self {
        self.0.insert(team_id.into(), multiplier);
        self
    }

    pub fn for_team(&self, team_id: Option<&str>) -> f64 {
        team_id
            .and_then(|team_id| self.0.get(team_id))
            .copied()
            .filter(|multiplier| multiplier.is_finite() && *multiplier >= 0.0)
            .unwrap_or(1.0)
    }
}

/// `segments` joined by `:`, with a `tm{multiplier}` suffix when the team multiplier
/// is not 1 so tenants with different limits never share a counter.
pub(crate) fn cache_key(segments: &[&str], team_multiplier: f64) -> String {
    let mut key = segments.join(":");
    if team_multiplier != 1.0 {
        key.push_str(&format!(":tm{team_multiplier}"));
    }
    key
}

pub(crate) fn retry_after_seconds(ttl: u64, window_seconds: u64) -> u64 {
    if ttl == 0 { window_seconds } else { ttl }
}

#[async_trait]
pub trait Throttle: Send + Sync {
    fn name(&self) -> &str;

    async fn allow_request(&self, context: &ThrottleContext) -> ThrottleResult;

    async fn record_usage(&self, _context: &ThrottleContext, _usage: &RecordedUsage) {}

    /// Drops an admission-time reservation for a request that another throttle denied.
    async fn release(&self, _context: &ThrottleContext) {}

    fn open_reservations(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::auth::AuthMethod;

    fn context() -> ThrottleContext {
        ThrottleContext::new(
            AuthenticatedUser::new("u-1", AuthMethod::PersonalApiKey),
            "wizard",
        )
    }

    #[test]
    fn scope_identity_prefers_end_user() {
        let ctx = context();
        assert_eq!(ThrottleScope::User.identity(&ctx), "u-1");
        assert_eq!(ThrottleScope::Product.identity(&ctx), "wizard");
        assert_eq!(ThrottleScope::Global.identity(&ctx), "global");

        let ctx = ctx.with_end_user("customer-7");
        assert_eq!(ThrottleScope::User.identity(&ctx), "customer-7");
    }

    #[test]
    fn cache_key_marks_team_multiplier() {
        assert_eq!(cache_key(&["user_input_tokens", "u-1", "m"], 1.0), "user_input_tokens:u-1:m");
        assert_eq!(
            cache_key(&["user_input_tokens", "u-1", "m"], 2.5),
            "user_input_tokens:u-1:m:tm2.5"
        );
    }

    #[test]
    fn team_multipliers_default_to_one() {
        let teams = TeamMultipliers::new().with_team("big", 4.0);
        assert_eq!(teams.for_team(Some("big")), 4.0);
        assert_eq!(teams.for_team(Some("small")), 1.0);
        assert_eq!(teams.for_team(None), 1.0);
    }

    #[test]
    fn deny_defaults_to_429() {
        let denied = ThrottleResult::deny("user_cost", "over budget").with_retry_after(12);
        assert!(!denied.allowed);
        assert_eq!(denied.status_code, 429);
        assert_eq!(denied.scope.as_deref(), Some("user_cost"));
        assert_eq!(denied.retry_after, Some(12));
        assert_eq!(denied.with_status(403).status_code, 403);
        assert!(ThrottleResult::allow().allowed);
    }
}
