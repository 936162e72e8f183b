//! Per-model token pricing and service-cost bookkeeping (component H).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// `(input_$/M, output_$/M, cached_read_$/M)`.
type PricingRow = (f64, f64, f64);

/// Deliberately not a re-statement of the `gpt-4o` row: the fallback used
/// for an unrecognized model is its own distinct, more conservative price.
const DEFAULT_PRICING: PricingRow = (5.0, 15.0, 0.5);

fn pricing_table() -> IndexMap<&'static str, PricingRow> {
    let mut table = IndexMap::new();
    table.insert("gpt-4o", (2.5, 10.0, 1.25));
    table.insert("gpt-4.1", (2.0, 8.0, 0.5));
    table.insert("gpt-4o-mini", (0.15, 0.60, 0.075));
    table.insert("gpt-4.1-mini", (0.4, 1.6, 0.1));
    table.insert("gpt-5-mini", (0.25, 2.0, 0.025));
    table
}

/// The kind of billable activity a [`Service`] record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Openai,
    FileProcessor,
    Native,
    Transformer,
}

/// One billable activity (an LLM call, an embedding call, a chunker call)
/// with a USD estimate and a free-form breakdown of how it was computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub service_type: ServiceType,
    pub breakdown: serde_json::Value,
    pub estimated_cost_usd: f64,
}

impl Service {
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_dict(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Looks up `(input, output, cached_read)` per-million-token USD pricing
/// for `model`: exact match, then first substring match in table order,
/// then [`DEFAULT_PRICING`].
fn model_pricing(model: &str) -> PricingRow {
    let table = pricing_table();
    if let Some(row) = table.get(model) {
        return *row;
    }
    for (name, row) in &table {
        if model.contains(name) {
            return *row;
        }
    }
    DEFAULT_PRICING
}

/// USD cost of a single LLM call, rounded to 6 decimals.
pub fn cost(model: &str, input_tokens: u64, output_tokens: u64, cached_tokens: u64) -> f64 {
    let (input_rate, output_rate, cached_rate) = model_pricing(model);
    let uncached_input = input_tokens.saturating_sub(cached_tokens);
    let raw = (uncached_input as f64 / 1_000_000.0) * input_rate
        + (cached_tokens as f64 / 1_000_000.0) * cached_rate
        + (output_tokens as f64 / 1_000_000.0) * output_rate;
    (raw * 1_000_000.0).round() / 1_000_000.0
}

/// Fallback token estimate when a provider doesn't report usage: ~4
/// characters per token.
pub fn estimate_tokens_from_content(content: &str) -> u64 {
    ((content.chars().count() as f64) / 4.0).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_pricing() {
        let c = cost("gpt-4o-mini", 1_000_000, 0, 0);
        assert!((c - 0.15).abs() < 1e-9);
    }

    #[test]
    fn substring_match_pricing() {
        // Vendor may prefix/suffix a deployment name. "gpt-5-mini" has no
        // earlier table entry that is also one of its substrings, so it is
        // the one model family whose substring match is unambiguous.
        let c = cost("azure-gpt-5-mini-2025", 1_000_000, 0, 0);
        assert!((c - 0.25).abs() < 1e-9);
    }

    #[test]
    fn substring_match_prefers_earlier_table_entry_over_more_specific_one() {
        // "gpt-4.1" is checked (and matches) before "gpt-4.1-mini" in table
        // order, so a "-mini" deployment name resolves to the base family's
        // price, not the mini row (see DESIGN.md).
        let c = cost("gpt-4.1-mini-2025-04-14", 1_000_000, 0, 0);
        assert!((c - 2.0).abs() < 1e-9);
    }

    #[test]
    fn unrecognized_model_uses_default_not_gpt4o_row() {
        let c = cost("some-unknown-model", 1_000_000, 0, 0);
        assert!((c - 5.0).abs() < 1e-9);
        assert_ne!(model_pricing("some-unknown-model"), model_pricing("gpt-4o"));
    }

    #[test]
    fn cached_tokens_use_cached_rate_not_input_rate() {
        let all_cached = cost("gpt-4o", 1_000_000, 0, 1_000_000);
        let no_cache = cost("gpt-4o", 1_000_000, 0, 0);
        assert!(all_cached < no_cache);
    }

    #[test]
    fn rounds_to_six_decimals() {
        let c = cost("gpt-4.1-mini", 123, 456, 0);
        let scaled = (c * 1_000_000.0).round();
        assert!((c * 1_000_000.0 - scaled).abs() < 1e-6);
    }
}
