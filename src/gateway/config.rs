use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::auth::AuthenticatedUser;
use super::costing::ModelPricing;
use super::model_limits::{ModelTokenLimits, StaticModelLimits};
use super::products::ProductConfig;
use super::throttle::{DEFAULT_WINDOW_SECONDS, TeamMultipliers, ThrottleScope};
use crate::{GatekeeperError, Result};

/// Gateway configuration. Every field has a default, so an empty file is valid.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: String,
    pub max_body_bytes: usize,
    pub json_logs: bool,
    /// Product charged by the unprefixed `/v1/...` routes.
    pub default_product: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
    pub timeouts: TimeoutsConfig,
    pub metrics: MetricsConfig,
    pub team_multipliers: TeamMultipliers,
    pub model_limits: ModelLimitsConfig,
    /// Evaluated in this order; the first denial wins.
    pub throttles: Vec<ThrottleConfig>,
    pub products: BTreeMap<String, ProductConfig>,
    /// Bearer token -> user.
    pub api_keys: BTreeMap<String, AuthenticatedUser>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamConfig>,
    pub pricing: PricingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            max_body_bytes: 4 * 1024 * 1024,
            json_logs: false,
            default_product: "llm_gateway".to_string(),
            redis: None,
            timeouts: TimeoutsConfig::default(),
            metrics: MetricsConfig::default(),
            team_multipliers: TeamMultipliers::default(),
            model_limits: ModelLimitsConfig::default(),
            throttles: default_throttles(),
            products: BTreeMap::new(),
            api_keys: BTreeMap::new(),
            upstream: None,
            pricing: PricingConfig::default(),
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("listen", &self.listen)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("json_logs", &self.json_logs)
            .field("default_product", &self.default_product)
            .field("redis", &self.redis)
            .field("timeouts", &self.timeouts)
            .field("metrics", &self.metrics)
            .field("team_multipliers", &self.team_multipliers)
            .field("model_limits", &self.model_limits)
            .field("throttles", &self.throttles)
            .field("products", &self.products)
            .field("api_keys", &format_args!("<{} redacted>", self.api_keys.len()))
            .field("upstream", &self.upstream)
            .field("pricing", &self.pricing)
            .finish()
    }
}

impl GatewayConfig {
    /// Loads `.json` files with serde_json and everything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json_str(&raw)?
        } else {
            Self::from_toml_str(&raw)?
        };
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_body_bytes == 0 {
            return Err(GatekeeperError::Config("max_body_bytes must be > 0".to_string()));
        }
        if self.default_product.trim().is_empty() {
            return Err(GatekeeperError::Config(
                "default_product must not be empty".to_string(),
            ));
        }
        if self.timeouts.first_byte_timeout_ms == 0 || self.timeouts.total_timeout_ms == 0 {
            return Err(GatekeeperError::Config("timeouts must be > 0".to_string()));
        }
        for throttle in &self.throttles {
            throttle.validate()?;
        }
        Ok(())
    }

    pub fn static_model_limits(&self) -> StaticModelLimits {
        self.model_limits.models.iter().fold(
            StaticModelLimits::new(self.model_limits.default),
            |limits, (model, model_limits)| limits.with_model(model.clone(), *model_limits),
        )
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
    #[serde(default = "default_redis_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

fn default_redis_prefix() -> String {
    "gatekeeper".to_string()
}

fn default_redis_op_timeout_ms() -> u64 {
    250
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            prefix: default_redis_prefix(),
            op_timeout_ms: default_redis_op_timeout_ms(),
        }
    }
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &"<redacted>")
            .field("prefix", &self.prefix)
            .field("op_timeout_ms", &self.op_timeout_ms)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Budget until the provider answers (or the first stream chunk arrives).
    pub first_byte_timeout_ms: u64,
    /// Budget for the whole provider exchange.
    pub total_timeout_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            first_byte_timeout_ms: 60_000,
            total_timeout_ms: 600_000,
        }
    }
}

impl TimeoutsConfig {
    pub fn first_byte(&self) -> Duration {
        Duration::from_millis(self.first_byte_timeout_ms)
    }

    pub fn total(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Series exported per label family.
    pub top_k: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { top_k: 50 }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelLimitsConfig {
    pub default: ModelTokenLimits,
    pub models: BTreeMap<String, ModelTokenLimits>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThrottleConfig {
    InputTokens {
        scope: ThrottleScope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit_multiplier: Option<f64>,
        #[serde(default = "default_window_seconds")]
        window_seconds: u64,
    },
    OutputTokens {
        scope: ThrottleScope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit_multiplier: Option<f64>,
        #[serde(default = "default_window_seconds")]
        window_seconds: u64,
    },
    Cost {
        scope: ThrottleScope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        budget_usd: f64,
        #[serde(default)]
        product_budgets: BTreeMap<String, f64>,
        #[serde(default = "default_window_seconds")]
        window_seconds: u64,
    },
}

fn default_window_seconds() -> u64 {
    DEFAULT_WINDOW_SECONDS
}

impl ThrottleConfig {
    pub fn scope(&self) -> ThrottleScope {
        match self {
            Self::InputTokens { scope, .. }
            | Self::OutputTokens { scope, .. }
            | Self::Cost { scope, .. } => *scope,
        }
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(GatekeeperError::Config(format!(
                "{} throttle: {reason}",
                self.scope()
            )))
        };
        match self {
            Self::InputTokens {
                limit_multiplier,
                window_seconds,
                ..
            }
            | Self::OutputTokens {
                limit_multiplier,
                window_seconds,
                ..
            } => {
                if *window_seconds == 0 {
                    return invalid("window_seconds must be > 0");
                }
                if limit_multiplier.is_some_and(|m| !m.is_finite() || m < 0.0) {
                    return invalid("limit_multiplier must be a non-negative number");
                }
            }
            Self::Cost {
                budget_usd,
                product_budgets,
                window_seconds,
                ..
            } => {
                if *window_seconds == 0 {
                    return invalid("window_seconds must be > 0");
                }
                let budgets_ok = std::iter::once(budget_usd)
                    .chain(product_budgets.values())
                    .all(|budget| budget.is_finite() && *budget >= 0.0);
                if !budgets_ok {
                    return invalid("budgets must be non-negative numbers");
                }
            }
        }
        Ok(())
    }
}

/// Token throttles on every scope: input and output for users and products, input
/// for the deployment as a whole.
pub fn default_throttles() -> Vec<ThrottleConfig> {
    let tokens = |scope, output: bool| {
        if output {
            ThrottleConfig::OutputTokens {
                scope,
                name: None,
                limit_multiplier: None,
                window_seconds: DEFAULT_WINDOW_SECONDS,
            }
        } else {
            ThrottleConfig::InputTokens {
                scope,
                name: None,
                limit_multiplier: None,
                window_seconds: DEFAULT_WINDOW_SECONDS,
            }
        }
    };
    vec![
        tokens(ThrottleScope::User, false),
        tokens(ThrottleScope::User, true),
        tokens(ThrottleScope::Product, false),
        tokens(ThrottleScope::Product, true),
        tokens(ThrottleScope::Global, false),
    ]
}

#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("headers", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// LiteLLM `model_prices_and_context_window.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub litellm_path: Option<PathBuf>,
    pub models: BTreeMap<String, ModelPricing>,
}
