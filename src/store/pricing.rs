use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::Pricing;

/// USD rates per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelRates {
    pub input_per_million_usd: f64,
    pub output_per_million_usd: f64,
}

impl ModelRates {
    pub fn new(input_per_million_usd: f64, output_per_million_usd: f64) -> Self {
        Self {
            input_per_million_usd,
            output_per_million_usd,
        }
    }

    fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 * self.input_per_million_usd
            + completion_tokens as f64 * self.output_per_million_usd)
            / 1_000_000.0
    }
}

/// Static rate table keyed by provider and model.
///
/// A provider-wide entry (registered with [`RateTablePricing::with_provider_default`])
/// prices models without their own row; anything else costs nothing, which is
/// what local models should report.
#[derive(Debug, Clone, Default)]
pub struct RateTablePricing {
    models: HashMap<(String, String), ModelRates>,
    providers: HashMap<String, ModelRates>,
}

impl RateTablePricing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(
        mut self,
        provider: impl Into<String>,
        model: impl Into<String>,
        rates: ModelRates,
    ) -> Self {
        self.models.insert((provider.into(), model.into()), rates);
        self
    }

    pub fn with_provider_default(mut self, provider: impl Into<String>, rates: ModelRates) -> Self {
        self.providers.insert(provider.into(), rates);
        self
    }
}

impl Pricing for RateTablePricing {
    fn cost(&self, provider: &str, model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        self.models
            .get(&(provider.to_string(), model.to_string()))
            .or_else(|| self.providers.get(provider))
            .map(|rates| rates.cost(prompt_tokens, completion_tokens))
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prices_per_million_tokens() {
        let pricing = RateTablePricing::new()
            .with_model("openai", "gpt-4.1-mini", ModelRates::new(0.4, 1.6))
            .with_provider_default("anthropic", ModelRates::new(3.0, 15.0));

        let cost = pricing.cost("openai", "gpt-4.1-mini", 1_000_000, 500_000);
        assert!((cost - 1.2).abs() < 1e-9);

        let cost = pricing.cost("anthropic", "claude-any", 2_000, 1_000);
        assert!((cost - 0.021).abs() < 1e-9);

        assert_eq!(pricing.cost("ollama", "llama3.2", 10_000, 10_000), 0.0);
    }
}
