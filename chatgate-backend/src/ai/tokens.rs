//! Approximate token and cost accounting
//!
//! Token counts use a characters/4 heuristic whenever the upstream does not
//! report usage. A real tokenizer per model family would be more accurate.

use super::types::ChatMessage;
use crate::models::AiModel;

pub const CHARS_PER_TOKEN: usize = 4;

pub fn estimate_tokens(text: &str) -> i64 {
    text.chars().count().div_ceil(CHARS_PER_TOKEN) as i64
}

pub fn estimate_prompt_tokens(messages: &[ChatMessage]) -> i64 {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

/// Cost in the model's price unit, or `None` if the model lacks either price.
/// Missing pricing is never reported as zero cost.
pub fn estimate_cost(model: &AiModel, input_tokens: i64, output_tokens: i64) -> Option<f64> {
    let input_price = model.input_price_per_1k?;
    let output_price = model.output_price_per_1k?;
    Some(
        input_tokens as f64 / 1000.0 * input_price
            + output_tokens as f64 / 1000.0 * output_price,
    )
}
