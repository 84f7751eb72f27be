//! Token usage aggregation: one record per provider call, summed per model,
//! plus an optional cost estimate derived from a caller-supplied per-model
//! $/1M-token [`PricingTable`]. No vendor prices are embedded here.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

/// One provider call's token accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl TokenUsageRecord {
    pub fn new(model: impl Into<String>, prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            model: model.into(),
            prompt_tokens,
            completion_tokens,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Per-model running total.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelTotals {
    pub calls: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl ModelTotals {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Aggregates [`TokenUsageRecord`]s across a session, per model.
/// `total_tokens() == total_prompt_tokens() + total_completion_tokens()` is
/// an invariant checked in this module's tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenStatistics {
    per_model: HashMap<String, ModelTotals>,
    history: Vec<TokenUsageRecord>,
}

/// USD price per 1M (prompt, completion) tokens for one model, supplied by
/// the caller. No vendor prices are embedded in this crate — a model absent
/// from the table is excluded from the estimate rather than priced at zero.
pub type PricingTable = HashMap<String, (f64, f64)>;

/// Per-model and total USD estimate produced by [`TokenStatistics::cost_estimate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_usd: f64,
    pub per_model_usd: HashMap<String, f64>,
}

impl TokenStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_usage(&mut self, record: TokenUsageRecord) {
        let totals = self.per_model.entry(record.model.clone()).or_default();
        totals.calls += 1;
        totals.prompt_tokens += record.prompt_tokens as u64;
        totals.completion_tokens += record.completion_tokens as u64;
        self.history.push(record);
    }

    pub fn total_prompt_tokens(&self) -> u64 {
        self.per_model.values().map(|t| t.prompt_tokens).sum()
    }

    pub fn total_completion_tokens(&self) -> u64 {
        self.per_model.values().map(|t| t.completion_tokens).sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_prompt_tokens() + self.total_completion_tokens()
    }

    pub fn per_model(&self) -> &HashMap<String, ModelTotals> {
        &self.per_model
    }

    /// Best-effort USD estimate against a caller-supplied `table`; models
    /// absent from it are excluded from both the total and the per-model
    /// breakdown rather than treated as zero-cost.
    pub fn cost_estimate(&self, table: &PricingTable) -> CostSummary {
        let per_model_usd: HashMap<String, f64> = self
            .per_model
            .iter()
            .filter_map(|(model, totals)| {
                let (prompt_price, completion_price) = table.get(model)?;
                let prompt_cost = (totals.prompt_tokens as f64 / 1_000_000.0) * prompt_price;
                let completion_cost = (totals.completion_tokens as f64 / 1_000_000.0) * completion_price;
                Some((model.clone(), prompt_cost + completion_cost))
            })
            .collect();
        let total_usd = per_model_usd.values().sum();
        CostSummary { total_usd, per_model_usd }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_equals_sum_of_prompt_and_completion() {
        let mut stats = TokenStatistics::new();
        stats.add_usage(TokenUsageRecord::new("claude-sonnet-4-5", 100, 50));
        stats.add_usage(TokenUsageRecord::new("claude-sonnet-4-5", 20, 10));
        stats.add_usage(TokenUsageRecord::new("gpt-4o", 200, 100));

        assert_eq!(
            stats.total_tokens(),
            stats.total_prompt_tokens() + stats.total_completion_tokens()
        );
        assert_eq!(stats.total_prompt_tokens(), 320);
        assert_eq!(stats.total_completion_tokens(), 160);
    }

    #[test]
    fn per_model_totals_are_isolated() {
        let mut stats = TokenStatistics::new();
        stats.add_usage(TokenUsageRecord::new("claude-sonnet-4-5", 100, 50));
        stats.add_usage(TokenUsageRecord::new("gpt-4o", 10, 5));

        let claude = &stats.per_model()["claude-sonnet-4-5"];
        assert_eq!(claude.calls, 1);
        assert_eq!(claude.total_tokens(), 150);
    }

    #[test]
    fn unknown_model_excluded_from_cost_not_treated_as_free() {
        let mut stats = TokenStatistics::new();
        stats.add_usage(TokenUsageRecord::new("some-unlisted-model", 1_000_000, 1_000_000));
        let table = PricingTable::new();
        let summary = stats.cost_estimate(&table);
        assert_eq!(summary.total_usd, 0.0);
        assert!(summary.per_model_usd.is_empty());
    }

    #[test]
    fn known_model_cost_is_computed_from_supplied_table() {
        let mut stats = TokenStatistics::new();
        stats.add_usage(TokenUsageRecord::new("claude-sonnet-4-5", 1_000_000, 1_000_000));
        stats.add_usage(TokenUsageRecord::new("some-unlisted-model", 1_000_000, 1_000_000));
        let mut table = PricingTable::new();
        table.insert("claude-sonnet-4-5".to_string(), (3.0, 15.0));

        let summary = stats.cost_estimate(&table);
        assert!((summary.total_usd - 18.0).abs() < 1e-9);
        assert_eq!(summary.per_model_usd.len(), 1);
        assert!((summary.per_model_usd["claude-sonnet-4-5"] - 18.0).abs() < 1e-9);
    }
}
