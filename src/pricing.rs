// Model pricing used by stage collaborators to meter their usage
// Prices are in USD per million tokens unless noted otherwise

use rust_decimal::Decimal;

use crate::types::Usage;

const TOKENS_PER_PRICE_UNIT: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_price: Decimal,
    pub output_price: Decimal,
}

impl ModelPricing {
    /// GPT-4o, also used for vision requests (image tokens bill as input)
    pub fn gpt_4o() -> Self {
        Self {
            input_price: Decimal::new(250, 2),
            output_price: Decimal::new(1000, 2),
        }
    }

    pub fn claude_sonnet() -> Self {
        Self {
            input_price: Decimal::new(300, 2),
            output_price: Decimal::new(1500, 2),
        }
    }

    /// Known pricing for a model, after normalising its name
    pub fn for_model(model: &str) -> Option<Self> {
        match normalize_model_name(model).as_str() {
            "gpt-4o" => Some(Self::gpt_4o()),
            "claude-sonnet" => Some(Self::claude_sonnet()),
            _ => None,
        }
    }

    /// Pricing for a model, free when unknown
    pub fn for_model_or_free(model: &str) -> Self {
        Self::for_model(model).unwrap_or_else(|| {
            tracing::warn!("Unknown model for pricing: {}, metering as free", model);
            Self {
                input_price: Decimal::ZERO,
                output_price: Decimal::ZERO,
            }
        })
    }

    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> Decimal {
        let unit = Decimal::from(TOKENS_PER_PRICE_UNIT);
        (Decimal::from(input_tokens) * self.input_price
            + Decimal::from(output_tokens) * self.output_price)
            / unit
    }

    pub fn usage(&self, input_tokens: u32, output_tokens: u32) -> Usage {
        Usage::new(
            i64::from(input_tokens) + i64::from(output_tokens),
            self.cost(input_tokens, output_tokens),
        )
    }
}

/// Speech-to-text at $0.006 per audio minute
pub fn whisper_cost(minutes: Decimal) -> Decimal {
    minutes.max(Decimal::ZERO) * Decimal::new(6, 3)
}

/// Text-to-speech at $0.015 (standard) or $0.030 (HD) per 1000 characters
pub fn tts_cost(characters: u64, hd: bool) -> Decimal {
    let per_thousand = if hd {
        Decimal::new(30, 3)
    } else {
        Decimal::new(15, 3)
    };
    Decimal::from(characters) * per_thousand / Decimal::from(1000)
}

/// Normalize model name to pricing key
fn normalize_model_name(model: &str) -> String {
    let model = model.trim().to_ascii_lowercase();
    if model.starts_with("gpt-4o") && !model.starts_with("gpt-4o-mini") {
        "gpt-4o".to_string()
    } else if model.contains("claude") && model.contains("sonnet") {
        "claude-sonnet".to_string()
    } else {
        model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpt_4o_cost_calculation() {
        let pricing = ModelPricing::gpt_4o();
        // (1000/1M) * 2.50 + (500/1M) * 10.00
        assert_eq!(pricing.cost(1000, 500), Decimal::new(75, 4));

        let usage = pricing.usage(1000, 500);
        assert_eq!(usage.tokens, 1500);
        assert_eq!(usage.cost_usd, Decimal::new(75, 4));
    }

    #[test]
    fn test_claude_sonnet_cost_calculation() {
        let pricing = ModelPricing::claude_sonnet();
        // (5000/1M) * 3.00 + (2000/1M) * 15.00 = 0.015 + 0.03
        assert_eq!(pricing.cost(5000, 2000), Decimal::new(45, 3));
    }

    #[test]
    fn test_model_name_normalization() {
        assert_eq!(normalize_model_name("gpt-4o-2024-08-06"), "gpt-4o");
        assert_eq!(normalize_model_name("claude-3-5-sonnet-20241022"), "claude-sonnet");
        assert_eq!(normalize_model_name("gpt-4o-mini"), "gpt-4o-mini");
        assert!(ModelPricing::for_model("gpt-4o-mini").is_none());
        assert_eq!(ModelPricing::for_model_or_free("unknown").cost(10, 10), Decimal::ZERO);
    }

    #[test]
    fn test_audio_costs() {
        assert_eq!(whisper_cost(Decimal::new(25, 1)), Decimal::new(15, 3));
        assert_eq!(tts_cost(2000, false), Decimal::new(30, 3));
        assert_eq!(tts_cost(2000, true), Decimal::new(60, 3));
    }
}
