use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use warden_infer::{estimate_tokens, Completion};

use crate::MAX_GENERATIVE_ATTEMPTS;

/// Tokens budgeted per prompt on top of the request itself: instructions,
/// schema context, follow-up data and worked examples.
pub const PROMPT_OVERHEAD_TOKENS: u64 = 2_000;

/// Per-1K-token pricing of the text generator, in USD.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub prompt_price_per_1k: Decimal,
    pub completion_price_per_1k: Decimal,
    pub max_completion_tokens: u32,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            prompt_price_per_1k: Decimal::new(1, 3),
            completion_price_per_1k: Decimal::new(2, 3),
            max_completion_tokens: 512,
        }
    }
}

impl CostModel {
    pub fn price(&self, prompt_tokens: u64, completion_tokens: u64) -> Decimal {
        let thousand = Decimal::from(1_000u32);
        Decimal::from(prompt_tokens) * self.prompt_price_per_1k / thousand
            + Decimal::from(completion_tokens) * self.completion_price_per_1k / thousand
    }

    /// Worst-case spend for a request: every generative attempt uses a full
    /// prompt and the maximum completion.
    pub fn estimate_request(&self, request_text: &str) -> Decimal {
        let prompt_tokens = estimate_tokens(request_text) + PROMPT_OVERHEAD_TOKENS;
        self.price(prompt_tokens, u64::from(self.max_completion_tokens))
            * Decimal::from(MAX_GENERATIVE_ATTEMPTS as u64)
    }

    pub fn actual(&self, completions: &[Completion]) -> Decimal {
        completions
            .iter()
            .map(|c| self.price(c.prompt_tokens, c.completion_tokens))
            .sum()
    }
}
