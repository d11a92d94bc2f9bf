use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::auth::AuthMethod;

/// Product and access policy consulted before admission control.
pub trait ProductPolicy: Send + Sync {
    fn validate_product(&self, name: &str) -> bool;

    fn check_product_access(
        &self,
        product: &str,
        auth_method: AuthMethod,
        application_id: Option<&str>,
        model: Option<&str>,
    ) -> Result<(), String>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProductConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Empty allows every method.
    #[serde(default)]
    pub auth_methods: Vec<AuthMethod>,
    /// Empty allows any (or no) application.
    #[serde(default)]
    pub application_ids: Vec<String>,
    /// Empty allows every model. Entries ending in `*` match by prefix.
    #[serde(default)]
    pub models: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for ProductConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auth_methods: Vec::new(),
            application_ids: Vec::new(),
            models: Vec::new(),
        }
    }
}

/// Policy from the `[products]` table. With no products configured every product
/// name is accepted.
#[derive(Clone, Debug, Default)]
pub struct StaticProductPolicy {
    products: BTreeMap<String, ProductConfig>,
}

impl StaticProductPolicy {
    pub fn new(products: BTreeMap<String, ProductConfig>) -> Self {
        Self { products }
    }

    pub fn with_product(mut self, name: impl Into<String>, config: ProductConfig) -> Self {
        self.products.insert(name.into(), config);
        self
    }
}

fn model_matches(pattern: &str, model: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => model.starts_with(prefix),
        None => pattern == model,
    }
}

impl ProductPolicy for StaticProductPolicy {
    fn validate_product(&self, name: &str) -> bool {
        self.products.is_empty() || self.products.contains_key(name)
    }

    fn check_product_access(
        &self,
        product: &str,
        auth_method: AuthMethod,
        application_id: Option<&str>,
        model: Option<&str>,
    ) -> Result<(), String> {
        let Some(config) = self.products.get(product) else {
            return Ok(());
        };
        if !config.enabled {
            return Err(format!("product '{product}' is disabled"));
        }
        if !config.auth_methods.is_empty() && !config.auth_methods.contains(&auth_method) {
            return Err(format!(
                "product '{product}' does not accept {} credentials",
                auth_method.as_str()
            ));
        }
        if !config.application_ids.is_empty() {
            let allowed = application_id
                .is_some_and(|id| config.application_ids.iter().any(|allowed| allowed == id));
            if !allowed {
                return Err(format!(
                    "application is not authorized for product '{product}'"
                ));
            }
        }
        if let Some(model) = model {
            if !config.models.is_empty()
                && !config
                    .models
                    .iter()
                    .any(|pattern| model_matches(pattern, model))
            {
                return Err(format!(
                    "model '{model}' is not available for product '{product}'"
                ));
            }
        }
        Ok(())
    }
}
