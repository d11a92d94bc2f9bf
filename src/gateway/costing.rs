use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// USD prices per model, used to turn token usage into spend for cost throttles.
#[derive(Clone, Debug, Default)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_usd_per_token: f64,
    #[serde(default)]
    pub output_usd_per_token: f64,
}

#[derive(Debug, Error)]
pub enum PricingTableError {
    #[error("invalid pricing json: expected object at root")]
    InvalidRoot,
    #[error("invalid pricing entry for model {model}: expected object")]
    InvalidModelEntry { model: String },
    #[error("invalid pricing entry for model {model}: missing both input/output cost")]
    MissingCosts { model: String },
    #[error("invalid pricing entry for model {model}: invalid cost value for {field}")]
    InvalidCostValue { model: String, field: &'static str },
    #[error("read pricing file failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the LiteLLM `model_prices_and_context_window.json` layout. Entries
    /// without any price (LiteLLM's `sample_spec`, embedding-only rows) are skipped.
    pub fn from_litellm_json_str(raw: &str) -> Result<Self, PricingTableError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        Self::from_litellm_json_value(&value)
    }

    pub fn from_litellm_file(path: impl AsRef<Path>) -> Result<Self, PricingTableError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_litellm_json_str(&raw)
    }

    pub fn from_litellm_json_value(value: &serde_json::Value) -> Result<Self, PricingTableError> {
        let Some(root) = value.as_object() else {
            return Err(PricingTableError::InvalidRoot);
        };

        let mut models = HashMap::new();
        for (model, entry) in root {
            let Some(obj) = entry.as_object() else {
                return Err(PricingTableError::InvalidModelEntry {
                    model: model.clone(),
                });
            };

            let input = cost_per_token(obj, "input_cost_per_token", "input_cost_per_1k_tokens")
                .map(|usd| validate_cost(usd, model, "input_cost"))
                .transpose()?;
            let output = cost_per_token(obj, "output_cost_per_token", "output_cost_per_1k_tokens")
                .map(|usd| validate_cost(usd, model, "output_cost"))
                .transpose()?;

            if input.is_none() && output.is_none() {
                continue;
            }
            models.insert(
                model.clone(),
                ModelPricing {
                    input_usd_per_token: input.unwrap_or(0.0),
                    output_usd_per_token: output.unwrap_or(0.0),
                },
            );
        }

        Ok(Self { models })
    }

    /// Adds inline `[pricing.models]` entries, overriding file entries of the same name.
    pub fn extend_from_config(
        &mut self,
        entries: &BTreeMap<String, ModelPricing>,
    ) -> Result<(), PricingTableError> {
        for (model, pricing) in entries {
            validate_cost(pricing.input_usd_per_token, model, "input_cost")?;
            validate_cost(pricing.output_usd_per_token, model, "output_cost")?;
            self.models.insert(model.clone(), *pricing);
        }
        Ok(())
    }

    pub fn with_model(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.insert(model.into(), pricing);
        self
    }

    pub fn model_pricing(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// `None` when the model has no price.
    pub fn estimate_cost_usd(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
        let pricing = self.model_pricing(model)?;
        Some(
            input_tokens as f64 * pricing.input_usd_per_token
                + output_tokens as f64 * pricing.output_usd_per_token,
        )
    }
}

fn cost_per_token(
    obj: &serde_json::Map<String, serde_json::Value>,
    per_token_key: &'static str,
    per_1k_key: &'static str,
) -> Option<f64> {
    obj.get(per_token_key)
        .and_then(|value| value.as_f64())
        .or_else(|| {
            obj.get(per_1k_key)
                .and_then(|value| value.as_f64())
                .map(|per_1k| per_1k / 1000.0)
        })
}

fn validate_cost(usd_per_token: f64, model: &str, field: &'static str) -> Result<f64, PricingTableError> {
    if !usd_per_token.is_finite() || usd_per_token < 0.0 {
        return Err(PricingTableError::InvalidCostValue {
            model: model.to_string(),
            field,
        });
    }
    Ok(usd_per_token)
}
