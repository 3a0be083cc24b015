//! Token counting and cost estimation per iteration.

use std::collections::BTreeMap;

use crate::log_parser::IterationRecord;

// Opus-class pricing, per token
pub const INPUT_PRICE: f64 = 15.0 / 1_000_000.0; // $15 per 1M input tokens
pub const OUTPUT_PRICE: f64 = 75.0 / 1_000_000.0; // $75 per 1M output tokens

/// Cost summary for one iteration
#[derive(Debug, Clone, Default)]
pub struct CostBreakdown {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
    /// Tool-call counts by tool name
    pub by_tool: BTreeMap<String, usize>,
}

impl CostBreakdown {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Estimate the cost of one iteration from its recorded usage
pub fn estimate(iteration: &IterationRecord) -> CostBreakdown {
    let mut breakdown = CostBreakdown {
        input_tokens: iteration.input_tokens,
        output_tokens: iteration.output_tokens,
        estimated_cost_usd: iteration.input_tokens as f64 * INPUT_PRICE
            + iteration.output_tokens as f64 * OUTPUT_PRICE,
        by_tool: BTreeMap::new(),
    };
    for call in &iteration.tool_calls {
        *breakdown.by_tool.entry(call.name.clone()).or_insert(0) += 1;
    }
    breakdown
}
