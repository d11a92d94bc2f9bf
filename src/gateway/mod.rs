//! Gateway admission control, request handling and the HTTP surface.

pub mod auth;
pub mod config;
pub mod context;
pub mod costing;
pub mod handler;
pub mod http;
pub mod limits;
pub mod logging;
pub mod metrics_prometheus;
pub mod model_limits;
pub mod products;
pub mod provider;
#[cfg(feature = "store-redis")]
pub mod redis_store;
pub mod throttle;
pub mod token_count;

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

pub use auth::{AuthMethod, AuthenticatedUser, Authenticator, StaticKeyAuthenticator};
pub use config::{GatewayConfig, ThrottleConfig, TimeoutsConfig};
pub use context::AppContext;
pub use costing::PricingTable;
pub use handler::{HandlerResponse, InboundRequest, RequestHandler, RequestOutcome, RequestPhase};
pub use limits::{
    CostRateLimiter, CounterBackend, CounterError, CounterReading, FallbackCounters,
    LocalCounters, RateLimiter, TokenRateLimiter,
};
pub use metrics_prometheus::{GatewayMetrics, TopKCounter};
pub use model_limits::{ModelLimits, ModelTokenLimits, StaticModelLimits};
pub use products::{ProductPolicy, StaticProductPolicy};
pub use provider::{
    ProviderCall, ProviderChunk, ProviderCompletion, ProviderError, ProviderRequest,
    ProviderResponse, ProviderStream, Usage,
};
#[cfg(feature = "store-redis")]
pub use redis_store::RedisStore;
pub use throttle::{
    CostThrottle, RecordedUsage, TeamMultipliers, Throttle, ThrottleContext, ThrottleResult,
    ThrottleRunner, ThrottleScope, TokenKind, TokenThrottle,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutPhase {
    FirstByte,
    Total,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FirstByte => f.write_str("first byte"),
            Self::Total => f.write_str("total"),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing or invalid bearer token")]
    Unauthorized,
    #[error("unknown product: {product}")]
    ProductNotFound { product: String },
    #[error("access denied: {reason}")]
    Forbidden { reason: String },
    #[error("invalid request: {reason}")]
    Validation { status: u16, reason: String },
    #[error("{detail}")]
    ThrottleDenied {
        status: u16,
        scope: String,
        detail: String,
        retry_after: Option<u64>,
    },
    #[error("provider error ({status}): {message}")]
    Provider { status: u16, message: String },
    #[error("provider timed out ({phase} budget elapsed)")]
    Timeout { phase: TimeoutPhase },
}

impl GatewayError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::Validation {
            status: 400,
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::ProductNotFound { .. } => 404,
            Self::Forbidden { .. } => 403,
            Self::Validation { status, .. } => *status,
            Self::ThrottleDenied { status, .. } => *status,
            Self::Provider { status, .. } => *status,
            Self::Timeout { .. } => 504,
        }
    }

    /// Stable machine-readable error type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized => "authentication_error",
            Self::ProductNotFound { .. } => "not_found_error",
            Self::Forbidden { .. } => "permission_error",
            Self::Validation { .. } => "invalid_request_error",
            Self::ThrottleDenied { .. } => "rate_limit_error",
            Self::Provider { .. } => "api_error",
            Self::Timeout { .. } => "timeout_error",
        }
    }

    pub fn scope(&self) -> Option<&str> {
        match self {
            Self::ThrottleDenied { scope, .. } => Some(scope),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::ThrottleDenied { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<ProviderError> for GatewayError {
    /// Upstream statuses pass through; a provider that never answered maps to 500.
    fn from(err: ProviderError) -> Self {
        Self::Provider {
            status: err
                .status_code
                .filter(|status| (400..=599).contains(status))
                .unwrap_or(500),
            message: err.message,
        }
    }
}

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_secs()
    }
}

/// Clock driven by hand, for exercising window expiry.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_epoch_seconds: u64) -> Self {
        Self {
            now: AtomicU64::new(now_epoch_seconds),
        }
    }

    pub fn advance(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_seconds(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
