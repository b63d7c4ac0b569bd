use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

// Per-model limits loaded from the pricing file. Unknown fields are ignored
// so the table can carry cost data the relay does not use.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
}

#[derive(Debug, Default)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

impl PricingTable {
    // A missing or malformed pricing file degrades to an empty table; the
    // relay then skips max_tokens enforcement for every model.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(value) => Self::from_json(&value),
                Err(e) => {
                    tracing::warn!("[Pricing] Failed to parse {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("[Pricing] Failed to read {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn from_json(value: &Value) -> Self {
        let mut models = HashMap::new();
        if let Some(object) = value.as_object() {
            for (model, entry) in object {
                if let Ok(pricing) = serde_json::from_value::<ModelPricing>(entry.clone()) {
                    models.insert(model.clone(), pricing);
                }
            }
        }
        Self { models }
    }

    pub fn contains(&self, model: &str) -> bool {
        self.models.contains_key(model)
    }

    // Output-token ceiling for a model; `max_tokens` wins over
    // `max_output_tokens` when both are present.
    pub fn output_token_limit(&self, model: &str) -> Option<u64> {
        self.models
            .get(model)
            .and_then(|pricing| pricing.max_tokens.or(pricing.max_output_tokens))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
