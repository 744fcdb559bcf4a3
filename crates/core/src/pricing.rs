// Model pricing
//
// Prices are USD per million tokens, keyed by model name. Lookups fall back
// to the longest configured prefix so dated snapshots ("gpt-4o-2024-08-06")
// price like their family.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::llm_driver::TokenUsage;
use crate::run::Cost;

/// Cost information for a model (USD per million tokens)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

impl ModelPrice {
    pub fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (f64::from(usage.prompt_tokens) * self.input
            + f64::from(usage.completion_tokens) * self.output)
            / 1_000_000.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PriceTableError {
    #[error("failed to read price table {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse price table: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Per-model price table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceTable {
    models: HashMap<String, ModelPrice>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in prices for common OpenAI models
    pub fn with_defaults() -> Self {
        Self::new()
            .with_price("gpt-4o", ModelPrice::new(2.5, 10.0))
            .with_price("gpt-4o-mini", ModelPrice::new(0.15, 0.6))
            .with_price("gpt-4.1", ModelPrice::new(2.0, 8.0))
            .with_price("gpt-4.1-mini", ModelPrice::new(0.4, 1.6))
            .with_price("gpt-4.1-nano", ModelPrice::new(0.1, 0.4))
            .with_price("o3-mini", ModelPrice::new(1.1, 4.4))
    }

    /// Parse a YAML (or JSON) mapping of model name to `{input, output}`
    pub fn from_yaml_str(contents: &str) -> Result<Self, PriceTableError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PriceTableError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| PriceTableError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn with_price(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.models.insert(model.into(), price);
        self
    }

    /// Overlay another table; entries in `other` win
    pub fn merge(mut self, other: PriceTable) -> Self {
        self.models.extend(other.models);
        self
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn price_for(&self, model: &str) -> Option<&ModelPrice> {
        if let Some(price) = self.models.get(model) {
            return Some(price);
        }
        self.models
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, price)| price)
    }

    /// Cost of one turn. Missing usage or an unpriced model is `Cost::Unknown`.
    pub fn cost(&self, model: &str, usage: Option<&TokenUsage>) -> Cost {
        match (usage, self.price_for(model)) {
            (Some(usage), Some(price)) => Cost::Known {
                usd: price.cost(usage),
            },
            _ => Cost::Unknown,
        }
    }
}
