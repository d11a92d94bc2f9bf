use thiserror::Error;

use crate::gateway::costing::PricingTableError;

#[derive(Debug, Error)]
pub enum GatekeeperError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("pricing error: {0}")]
    Pricing(#[from] PricingTableError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[cfg(feature = "store-redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, GatekeeperError>;
