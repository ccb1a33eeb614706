//! Token usage counters and derived cost.

use serde::{Deserialize, Serialize};

use crate::bot::registry::Registry;

/// Input/output token counts for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub n_input_tokens: u64,
    pub n_output_tokens: u64,
}

impl TokenUsage {
    pub fn new(n_input_tokens: u64, n_output_tokens: u64) -> Self {
        Self {
            n_input_tokens,
            n_output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.n_input_tokens + self.n_output_tokens
    }
}

/// Cost in USD for the given usage of one model. Cost is always derived
/// from the registry's price table, never stored.
pub fn token_cost_usd(registry: &Registry, model_key: &str, usage: TokenUsage) -> f64 {
    let Some(model) = registry.model(model_key) else {
        return 0.0;
    };
    model.price_per_1000_input_tokens * (usage.n_input_tokens as f64 / 1000.0)
        + model.price_per_1000_output_tokens * (usage.n_output_tokens as f64 / 1000.0)
}

pub fn image_cost_usd(registry: &Registry, n_generated_images: u64) -> f64 {
    registry.price_per_image * n_generated_images as f64
}

pub fn transcription_cost_usd(registry: &Registry, n_transcribed_seconds: f64) -> f64 {
    registry.price_per_transcription_minute * (n_transcribed_seconds / 60.0)
}
