use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Per-window base token limits for one model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTokenLimits {
    pub input_limit: u64,
    pub output_limit: u64,
}

impl ModelTokenLimits {
    /// Applied to models without an explicit entry.
    pub const CONSERVATIVE: Self = Self {
        input_limit: 1_000_000,
        output_limit: 200_000,
    };

    pub fn new(input_limit: u64, output_limit: u64) -> Self {
        Self {
            input_limit,
            output_limit,
        }
    }
}

impl Default for ModelTokenLimits {
    fn default() -> Self {
        Self::CONSERVATIVE
    }
}

pub trait ModelLimits: Send + Sync {
    /// Never unlimited: unknown models receive a conservative default.
    fn limits(&self, model: &str) -> ModelTokenLimits;
}

#[derive(Clone, Debug, Default)]
pub struct StaticModelLimits {
    default: ModelTokenLimits,
    models: HashMap<String, ModelTokenLimits>,
}

impl StaticModelLimits {
    pub fn new(default: ModelTokenLimits) -> Self {
        Self {
            default,
            models: HashMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, limits: ModelTokenLimits) -> Self {
        self.models.insert(model.into(), limits);
        self
    }
}

impl ModelLimits for StaticModelLimits {
    fn limits(&self, model: &str) -> ModelTokenLimits {
        self.models.get(model).copied().unwrap_or(self.default)
    }
}
