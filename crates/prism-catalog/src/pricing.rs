use serde::{Deserialize, Serialize};

use prism_common::{ApiFormat, DataFormat};

/// Which token classes feed tier selection. The templates differ only in
/// whether cache-creation tokens count toward the input context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingTemplate {
    Claude,
    OpenAi,
    Gemini,
}

impl BillingTemplate {
    pub fn for_format(format: ApiFormat) -> Self {
        match format.data_format() {
            DataFormat::Claude => BillingTemplate::Claude,
            DataFormat::OpenAiChat | DataFormat::OpenAiResponses => BillingTemplate::OpenAi,
            DataFormat::Gemini => BillingTemplate::Gemini,
        }
    }

    pub fn includes_cache_creation(self) -> bool {
        matches!(self, BillingTemplate::Claude)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceTier {
    /// Inclusive upper bound on input context; `None` is the open tier.
    pub up_to: Option<u64>,
    pub input_per_million: f64,
    pub output_per_million: f64,
    #[serde(default)]
    pub cache_read_per_million: f64,
    #[serde(default)]
    pub cache_creation_per_million: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    pub input_per_million: f64,
    pub output_per_million: f64,
    #[serde(default)]
    pub cache_read_per_million: f64,
    #[serde(default)]
    pub cache_creation_per_million: f64,
    pub per_request: Option<f64>,
    pub tiers: Option<Vec<PriceTier>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenBreakdown {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl TokenBreakdown {
    fn tier_context(&self, template: BillingTemplate) -> u64 {
        let mut context = self.input_tokens + self.cache_read_tokens;
        if template.includes_cache_creation() {
            context += self.cache_creation_tokens;
        }
        context
    }
}

/// Cost in USD for one request. Free-tier callers pass `free_tier = true`
/// and get zero while token counts still land in the usage row.
pub fn compute_cost(
    pricing: Option<&PricingTable>,
    tokens: &TokenBreakdown,
    template: BillingTemplate,
    rate_multiplier: f64,
    free_tier: bool,
) -> f64 {
    if free_tier {
        return 0.0;
    }
    let Some(pricing) = pricing else {
        return 0.0;
    };

    let (input_rate, output_rate, cache_read_rate, cache_creation_rate) =
        match pricing.tiers.as_deref() {
            Some(tiers) if !tiers.is_empty() => {
                let context = tokens.tier_context(template);
                let tier = tiers
                    .iter()
                    .find(|tier| tier.up_to.is_none_or(|up_to| context <= up_to))
                    .unwrap_or(&tiers[tiers.len() - 1]);
                (
                    tier.input_per_million,
                    tier.output_per_million,
                    tier.cache_read_per_million,
                    tier.cache_creation_per_million,
                )
            }
            _ => (
                pricing.input_per_million,
                pricing.output_per_million,
                pricing.cache_read_per_million,
                pricing.cache_creation_per_million,
            ),
        };

    let per_million = |count: u64, rate: f64| (count as f64) * rate / 1_000_000.0;
    let cost = per_million(tokens.input_tokens, input_rate)
        + per_million(tokens.output_tokens, output_rate)
        + per_million(tokens.cache_read_tokens, cache_read_rate)
        + per_million(tokens.cache_creation_tokens, cache_creation_rate)
        + pricing.per_request.unwrap_or(0.0);

    cost * rate_multiplier
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_pricing() -> PricingTable {
        PricingTable {
            input_per_million: 3.0,
            output_per_million: 15.0,
            cache_read_per_million: 0.3,
            cache_creation_per_million: 3.75,
            per_request: None,
            tiers: None,
        }
    }

    #[test]
    fn flat_cost_sums_all_four_classes() {
        let tokens = TokenBreakdown {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            cache_read_tokens: 1_000_000,
            cache_creation_tokens: 1_000_000,
        };
        let cost = compute_cost(
            Some(&flat_pricing()),
            &tokens,
            BillingTemplate::Claude,
            1.0,
            false,
        );
        assert!((cost - (3.0 + 15.0 + 0.3 + 3.75)).abs() < 1e-9);
    }

    #[test]
    fn missing_pricing_is_zero() {
        let tokens = TokenBreakdown {
            input_tokens: 10,
            ..TokenBreakdown::default()
        };
        assert_eq!(
            compute_cost(None, &tokens, BillingTemplate::OpenAi, 1.0, false),
            0.0
        );
    }

    #[test]
    fn free_tier_overrides_cost() {
        let tokens = TokenBreakdown {
            input_tokens: 1_000_000,
            ..TokenBreakdown::default()
        };
        assert_eq!(
            compute_cost(
                Some(&flat_pricing()),
                &tokens,
                BillingTemplate::Claude,
                1.0,
                true
            ),
            0.0
        );
    }

    #[test]
    fn tier_selection_respects_billing_template() {
        let pricing = PricingTable {
            tiers: Some(vec![
                PriceTier {
                    up_to: Some(100),
                    input_per_million: 1.0,
                    output_per_million: 1.0,
                    ..PriceTier::default()
                },
                PriceTier {
                    up_to: None,
                    input_per_million: 2.0,
                    output_per_million: 2.0,
                    ..PriceTier::default()
                },
            ]),
            ..PricingTable::default()
        };
        let tokens = TokenBreakdown {
            input_tokens: 60,
            cache_read_tokens: 20,
            cache_creation_tokens: 30,
            output_tokens: 1_000_000,
        };
        // Claude counts cache creation: 60 + 20 + 30 = 110 > 100 -> tier 2.
        let claude = compute_cost(
            Some(&pricing),
            &tokens,
            BillingTemplate::Claude,
            1.0,
            false,
        );
        // OpenAI does not: 60 + 20 = 80 <= 100 -> tier 1.
        let openai = compute_cost(
            Some(&pricing),
            &tokens,
            BillingTemplate::OpenAi,
            1.0,
            false,
        );
        assert!(claude > openai);
    }

    #[test]
    fn rate_multiplier_scales_cost() {
        let tokens = TokenBreakdown {
            input_tokens: 1_000_000,
            ..TokenBreakdown::default()
        };
        let base = compute_cost(
            Some(&flat_pricing()),
            &tokens,
            BillingTemplate::Claude,
            1.0,
            false,
        );
        let doubled = compute_cost(
            Some(&flat_pricing()),
            &tokens,
            BillingTemplate::Claude,
            2.0,
            false,
        );
        assert!((doubled - base * 2.0).abs() < 1e-9);
    }
}
