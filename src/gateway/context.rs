use std::sync::Arc;

use super::auth::{Authenticator, StaticKeyAuthenticator};
use super::config::{GatewayConfig, TimeoutsConfig, default_throttles};
use super::costing::PricingTable;
use super::limits::{CounterBackend, FallbackCounters};
use super::metrics_prometheus::{GatewayMetrics, RuntimeSnapshot};
use super::model_limits::{ModelLimits, StaticModelLimits};
use super::products::{ProductPolicy, StaticProductPolicy};
use super::provider::{HttpProvider, ProviderCall};
#[cfg(feature = "store-redis")]
use super::redis_store::RedisStore;
use super::throttle::{TeamMultipliers, ThrottleRunner};
use super::{Clock, SystemClock};
use crate::{GatekeeperError, Result};

/// Everything a request needs, built once at startup and shared by reference.
///
/// Construction never touches the network; [`AppContext::start`] and
/// [`AppContext::shutdown`] bracket the lifetime of shared connections.
pub struct AppContext {
    counters: Arc<FallbackCounters>,
    #[cfg(feature = "store-redis")]
    redis: Option<RedisStore>,
    authenticator: Arc<dyn Authenticator>,
    products: Arc<dyn ProductPolicy>,
    runner: ThrottleRunner,
    provider: Arc<dyn ProviderCall>,
    pricing: PricingTable,
    metrics: GatewayMetrics,
    timeouts: TimeoutsConfig,
    default_product: String,
    max_body_bytes: usize,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("counters", &self.counters)
            .field("runner", &self.runner)
            .field("pricing_models", &self.pricing.len())
            .field("timeouts", &self.timeouts)
            .field("default_product", &self.default_product)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

impl AppContext {
    /// Local-only counters, the default throttle set, no API keys and an open
    /// product policy.
    pub fn new(provider: Arc<dyn ProviderCall>) -> Self {
        let defaults = GatewayConfig::default();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let counters = Arc::new(FallbackCounters::local_only(clock));
        let model_limits: Arc<dyn ModelLimits> = Arc::new(StaticModelLimits::default());
        let runner = ThrottleRunner::from_config(
            &default_throttles(),
            counters.clone(),
            model_limits,
            &TeamMultipliers::default(),
        );
        Self {
            counters,
            #[cfg(feature = "store-redis")]
            redis: None,
            authenticator: Arc::new(StaticKeyAuthenticator::new()),
            products: Arc::new(StaticProductPolicy::default()),
            runner,
            provider,
            pricing: PricingTable::default(),
            metrics: GatewayMetrics::new(defaults.metrics.top_k),
            timeouts: defaults.timeouts,
            default_product: defaults.default_product,
            max_body_bytes: defaults.max_body_bytes,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        config.validate()?;
        let upstream = config.upstream.as_ref().ok_or_else(|| {
            GatekeeperError::Config("upstream.base_url is required".to_string())
        })?;
        let mut provider = HttpProvider::new(upstream.base_url.clone())?
            .with_headers(upstream.headers.clone());
        if let Some(api_key) = upstream.api_key.as_deref() {
            provider = provider.with_api_key(api_key);
        }
        Self::from_config_with_provider(config, Arc::new(provider))
    }

    /// Like [`AppContext::from_config`] but with a caller-supplied provider.
    pub fn from_config_with_provider(
        config: &GatewayConfig,
        provider: Arc<dyn ProviderCall>,
    ) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        #[cfg(feature = "store-redis")]
        let redis = match config.redis.as_ref() {
            Some(redis) => Some(
                RedisStore::new(&redis.url)?
                    .with_prefix(redis.prefix.clone())
                    .with_op_timeout(std::time::Duration::from_millis(redis.op_timeout_ms)),
            ),
            None => None,
        };
        #[cfg(feature = "store-redis")]
        let primary = redis
            .clone()
            .map(|store| Arc::new(store) as Arc<dyn CounterBackend>);
        #[cfg(not(feature = "store-redis"))]
        let primary: Option<Arc<dyn CounterBackend>> = {
            if config.redis.is_some() {
                tracing::warn!("redis configured but the store-redis feature is disabled");
            }
            None
        };

        let counters = Arc::new(FallbackCounters::new(primary, clock));
        let model_limits: Arc<dyn ModelLimits> = Arc::new(config.static_model_limits());
        let runner = ThrottleRunner::from_config(
            &config.throttles,
            counters.clone(),
            model_limits,
            &config.team_multipliers,
        );

        let mut pricing = match config.pricing.litellm_path.as_ref() {
            Some(path) => PricingTable::from_litellm_file(path)?,
            None => PricingTable::default(),
        };
        pricing.extend_from_config(&config.pricing.models)?;

        Ok(Self {
            counters,
            #[cfg(feature = "store-redis")]
            redis,
            authenticator: Arc::new(StaticKeyAuthenticator::from_config(&config.api_keys)),
            products: Arc::new(StaticProductPolicy::new(config.products.clone())),
            runner,
            provider,
            pricing,
            metrics: GatewayMetrics::new(config.metrics.top_k),
            timeouts: config.timeouts,
            default_product: config.default_product.clone(),
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Replaces the counters. Throttles built from the previous counters keep them, so
    /// pair this with [`AppContext::with_runner`].
    pub fn with_counters(mut self, counters: Arc<FallbackCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn with_runner(mut self, runner: ThrottleRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_product_policy(mut self, products: Arc<dyn ProductPolicy>) -> Self {
        self.products = products;
        self
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutsConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_default_product(mut self, product: impl Into<String>) -> Self {
        self.default_product = product.into();
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes.max(1);
        self
    }

    pub fn with_metrics_top_k(mut self, top_k: usize) -> Self {
        self.metrics = GatewayMetrics::new(top_k);
        self
    }

    pub fn counters(&self) -> &Arc<FallbackCounters> {
        &self.counters
    }

    pub fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    pub fn products(&self) -> &dyn ProductPolicy {
        self.products.as_ref()
    }

    pub fn runner(&self) -> &ThrottleRunner {
        &self.runner
    }

    pub fn provider(&self) -> &dyn ProviderCall {
        self.provider.as_ref()
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    pub fn timeouts(&self) -> TimeoutsConfig {
        self.timeouts
    }

    pub fn default_product(&self) -> &str {
        &self.default_product
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// `None` when no Redis is configured.
    pub async fn redis_connected(&self) -> Option<bool> {
        #[cfg(feature = "store-redis")]
        if let Some(redis) = self.redis.as_ref() {
            return Some(redis.is_connected().await);
        }
        None
    }

    pub async fn runtime_snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            counter_fallbacks: self.counters.fallback_count(),
            local_counter_entries: self.counters.local_entries(),
            open_reservations: self.runner.open_reservations(),
            redis_connected: self.redis_connected().await,
        }
    }

    pub async fn render_metrics(&self) -> String {
        let snapshot = self.runtime_snapshot().await;
        self.metrics.render(snapshot)
    }

    /// Establishes shared connections. An unreachable Redis is not fatal: the
    /// gateway starts degraded and reconnects on later operations.
    pub async fn start(&self) {
        #[cfg(feature = "store-redis")]
        if let Some(redis) = self.redis.as_ref() {
            match redis.ping().await {
                Ok(()) => tracing::info!(prefix = redis.prefix(), "redis counters connected"),
                Err(err) => tracing::warn!(
                    error = %err,
                    "redis unreachable at startup, limits run degraded until it recovers"
                ),
            }
        }
        tracing::info!(
            throttles = ?self.runner.names(),
            distributed = self.counters.has_primary(),
            "gateway context started"
        );
    }

    pub async fn shutdown(&self) {
        #[cfg(feature = "store-redis")]
        if let Some(redis) = self.redis.as_ref() {
            redis.close().await;
        }
        let open = self.runner.open_reservations();
        if open > 0 {
            tracing::warn!(open_reservations = open, "shutting down with open reservations");
        }
        tracing::info!("gateway context stopped");
    }
}
