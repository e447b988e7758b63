use leadflow_core::TokenUsage;

/// How a provider bills one call. Tables are fixed at process start;
/// cost is deterministic given token counts and model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PricingRule {
    /// Flat price per request.
    PerRequest(f64),
    /// Separate input/output prices, USD per million tokens.
    PerTokenSplit {
        input_per_mtok: f64,
        output_per_mtok: f64,
    },
    /// Local models.
    Free,
}

impl PricingRule {
    pub fn cost(&self, usage: TokenUsage) -> f64 {
        match self {
            PricingRule::PerRequest(flat) => *flat,
            PricingRule::PerTokenSplit {
                input_per_mtok,
                output_per_mtok,
            } => {
                (usage.prompt_tokens as f64 * input_per_mtok
                    + usage.completion_tokens as f64 * output_per_mtok)
                    / 1_000_000.0
            }
            PricingRule::Free => 0.0,
        }
    }

    /// Upper-bound estimate used by the router's cost filter. Assumes a
    /// one-kilotoken prompt and a full `max_tokens` completion.
    pub fn estimate(&self, max_tokens: u32) -> f64 {
        self.cost(TokenUsage {
            prompt_tokens: 1_024,
            completion_tokens: max_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_token_split_cost() {
        let rule = PricingRule::PerTokenSplit {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        };
        let usage = TokenUsage {
            prompt_tokens: 1_000_000,
            completion_tokens: 1_000_000,
        };
        assert!((rule.cost(usage) - 18.0).abs() < 1e-9);
    }

    #[test]
    fn free_and_flat() {
        assert_eq!(PricingRule::Free.cost(TokenUsage::default()), 0.0);
        let flat = PricingRule::PerRequest(0.01);
        assert_eq!(
            flat.cost(TokenUsage {
                prompt_tokens: 9,
                completion_tokens: 9
            }),
            0.01
        );
    }

    #[test]
    fn estimate_scales_with_max_tokens() {
        let rule = PricingRule::PerTokenSplit {
            input_per_mtok: 1.0,
            output_per_mtok: 2.0,
        };
        assert!(rule.estimate(4_096) > rule.estimate(256));
    }
}
