//! Per-model token prices
//!
//! Prices are USD per million tokens. Dated model snapshots such as
//! `gpt-4o-mini-2024-07-18` resolve to the longest configured name that
//! prefixes them.

use super::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPrice {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 * self.input_per_million
            + usage.completion_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PricingTable {
    prices: BTreeMap<String, ModelPrice>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new(BTreeMap::from([
            ("gpt-4o-mini".to_string(), ModelPrice::new(0.15, 0.60)),
            ("gpt-4o".to_string(), ModelPrice::new(2.50, 10.00)),
            ("gpt-4.1-mini".to_string(), ModelPrice::new(0.40, 1.60)),
            ("gpt-4.1".to_string(), ModelPrice::new(2.00, 8.00)),
        ]))
    }
}

impl PricingTable {
    pub fn new(prices: BTreeMap<String, ModelPrice>) -> Self {
        Self { prices }
    }

    /// Builtin prices with `overrides` layered on top
    pub fn with_overrides(overrides: BTreeMap<String, ModelPrice>) -> Self {
        let mut table = Self::default();
        table.prices.extend(overrides);
        table
    }

    pub fn price_for(&self, model: &str) -> Option<ModelPrice> {
        if let Some(price) = self.prices.get(model) {
            return Some(*price);
        }
        self.prices
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, price)| *price)
    }

    /// USD cost of one call; unknown models cost 0 and are logged
    pub fn cost_usd(&self, model: &str, usage: &TokenUsage) -> f64 {
        match self.price_for(model) {
            Some(price) => price.cost(usage),
            None => {
                tracing::debug!(model = %model, "No price configured for model, recording zero cost");
                0.0
            }
        }
    }
}
