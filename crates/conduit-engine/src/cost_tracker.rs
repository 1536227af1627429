//! Per-provider/model price table and usage accumulation, consulted by the
//! Agent Runtime every time a provider call returns a usage record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use conduit_kernel::model::CostRecord;

/// Per-model pricing, USD per 1,000 tokens.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_cost_per_1k_tokens: f64,
    pub output_cost_per_1k_tokens: f64,
}

impl ModelPricing {
    pub fn new(input_cost_per_1k: f64, output_cost_per_1k: f64) -> Self {
        Self { input_cost_per_1k_tokens: input_cost_per_1k, output_cost_per_1k_tokens: output_cost_per_1k }
    }

    pub fn free() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_cost_per_1k_tokens + (output_tokens as f64 / 1000.0) * self.output_cost_per_1k_tokens
    }
}

/// Looks up pricing by `"provider/model"`, falling back to a date-suffix-
/// stripped model name (`"gpt-4o-2024-05-13"` → `"gpt-4o"`) before giving up.
#[derive(Debug, Clone)]
pub struct PricingRegistry {
    prices: HashMap<String, ModelPricing>,
}

impl PricingRegistry {
    pub fn empty() -> Self {
        Self { prices: HashMap::new() }
    }

    pub fn with_defaults() -> Self {
        let mut prices = HashMap::new();
        prices.insert("openai/gpt-4o".into(), ModelPricing::new(2.50, 10.00));
        prices.insert("openai/gpt-4o-mini".into(), ModelPricing::new(0.15, 0.60));
        prices.insert("openai/gpt-4-turbo".into(), ModelPricing::new(10.00, 30.00));
        prices.insert("openai/gpt-3.5-turbo".into(), ModelPricing::new(0.50, 1.50));
        prices.insert("anthropic/claude-3.5-sonnet".into(), ModelPricing::new(3.00, 15.00));
        prices.insert("anthropic/claude-3-haiku".into(), ModelPricing::new(0.25, 1.25));
        prices.insert("anthropic/claude-3-opus".into(), ModelPricing::new(15.00, 75.00));
        prices.insert("gemini/gemini-1.5-pro".into(), ModelPricing::new(1.25, 5.00));
        prices.insert("gemini/gemini-1.5-flash".into(), ModelPricing::new(0.075, 0.30));
        prices.insert("local/any".into(), ModelPricing::free());
        Self { prices }
    }

    pub fn set_pricing(&mut self, provider: impl Into<String>, model: impl Into<String>, pricing: ModelPricing) {
        self.prices.insert(format!("{}/{}", provider.into(), model.into()), pricing);
    }

    pub fn get_pricing(&self, provider: &str, model: &str) -> Option<ModelPricing> {
        let provider = provider.to_lowercase();
        let model = model.to_lowercase();

        if let Some(p) = self.prices.get(&format!("{provider}/{model}")) {
            return Some(*p);
        }

        let base_model = model.split('-').take_while(|part| part.parse::<u32>().is_err() || part.len() < 4).collect::<Vec<_>>().join("-");
        if base_model != model {
            if let Some(p) = self.prices.get(&format!("{provider}/{base_model}")) {
                return Some(*p);
            }
        }

        if provider == "local" || provider == "ollama" {
            return self.prices.get("local/any").copied();
        }

        None
    }
}

/// Accumulates [`CostRecord`]s against a [`PricingRegistry`] and answers the
/// per-session/per-model/per-agent/by-time-bucket queries §4.9 calls for.
/// Unpriced provider/model pairs are recorded at zero cost rather than
/// dropped, so usage is never silently lost.
pub struct CostTracker {
    pricing: PricingRegistry,
    records: Mutex<Vec<CostRecord>>,
}

impl CostTracker {
    pub fn new(pricing: PricingRegistry) -> Self {
        Self { pricing, records: Mutex::new(Vec::new()) }
    }

    pub fn with_defaults() -> Self {
        Self::new(PricingRegistry::with_defaults())
    }

    pub fn record(&self, provider: &str, model: &str, input_tokens: u64, output_tokens: u64, session_id: Option<String>, agent: Option<String>, timestamp: DateTime<Utc>) -> CostRecord {
        let cost_usd = self.pricing.get_pricing(provider, model).map(|p| p.calculate_cost(input_tokens, output_tokens)).unwrap_or(0.0);
        let record = CostRecord { provider: provider.to_string(), model: model.to_string(), input_tokens, output_tokens, cost_usd, session_id, agent, timestamp };
        self.records.lock().push(record.clone());
        record
    }

    pub fn total_cost(&self) -> f64 {
        self.records.lock().iter().map(|r| r.cost_usd).sum()
    }

    pub fn cost_for_session(&self, session_id: &str) -> f64 {
        self.records.lock().iter().filter(|r| r.session_id.as_deref() == Some(session_id)).map(|r| r.cost_usd).sum()
    }

    pub fn cost_for_model(&self, provider: &str, model: &str) -> f64 {
        self.records.lock().iter().filter(|r| r.provider == provider && r.model == model).map(|r| r.cost_usd).sum()
    }

    pub fn cost_for_agent(&self, agent: &str) -> f64 {
        self.records.lock().iter().filter(|r| r.agent.as_deref() == Some(agent)).map(|r| r.cost_usd).sum()
    }

    pub fn cost_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
        self.records.lock().iter().filter(|r| r.timestamp >= start && r.timestamp < end).map(|r| r.cost_usd).sum()
    }

    pub fn records(&self) -> Vec<CostRecord> {
        self.records.lock().clone()
    }

    /// Whether a session's accumulated cost has already reached `max_usd`.
    pub fn session_budget_exceeded(&self, session_id: &str, max_usd: f64) -> bool {
        self.cost_for_session(session_id) >= max_usd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn pricing_calculates_cost_from_token_counts() {
        let pricing = ModelPricing::new(2.50, 10.00);
        let cost = pricing.calculate_cost(1000, 500);
        assert!((cost - 7.50).abs() < 1e-9);
    }

    #[test]
    fn registry_exact_match_beats_fuzzy() {
        let registry = PricingRegistry::with_defaults();
        let p = registry.get_pricing("openai", "gpt-4o").unwrap();
        assert!((p.input_cost_per_1k_tokens - 2.50).abs() < 1e-9);
    }

    #[test]
    fn registry_strips_date_suffix() {
        let registry = PricingRegistry::with_defaults();
        let p = registry.get_pricing("openai", "gpt-4o-2024-05-13").unwrap();
        assert!((p.input_cost_per_1k_tokens - 2.50).abs() < 1e-9);
    }

    #[test]
    fn registry_is_case_insensitive() {
        let registry = PricingRegistry::with_defaults();
        assert!(registry.get_pricing("OpenAI", "GPT-4o").is_some());
    }

    #[test]
    fn registry_unknown_pair_returns_none() {
        let registry = PricingRegistry::with_defaults();
        assert!(registry.get_pricing("unknown", "unknown").is_none());
    }

    #[test]
    fn unpriced_call_is_recorded_at_zero_cost() {
        let tracker = CostTracker::new(PricingRegistry::empty());
        let record = tracker.record("unknown", "unknown", 100, 50, None, None, ts("2026-01-01T00:00:00Z"));
        assert_eq!(record.cost_usd, 0.0);
        assert_eq!(tracker.total_cost(), 0.0);
    }

    #[test]
    fn queries_filter_by_session_model_and_agent() {
        let tracker = CostTracker::with_defaults();
        tracker.record("openai", "gpt-4o", 1000, 500, Some("s1".into()), Some("backend-coder".into()), ts("2026-01-01T00:00:00Z"));
        tracker.record("openai", "gpt-4o-mini", 2000, 1000, Some("s2".into()), Some("reviewer".into()), ts("2026-01-01T01:00:00Z"));

        assert!((tracker.cost_for_session("s1") - 7.50).abs() < 1e-9);
        assert!(tracker.cost_for_session("s2") > 0.0);
        assert!((tracker.cost_for_model("openai", "gpt-4o") - 7.50).abs() < 1e-9);
        assert!((tracker.cost_for_agent("backend-coder") - 7.50).abs() < 1e-9);
        assert!((tracker.total_cost() - (tracker.cost_for_session("s1") + tracker.cost_for_session("s2"))).abs() < 1e-9);
    }

    #[test]
    fn cost_in_range_buckets_by_timestamp() {
        let tracker = CostTracker::with_defaults();
        tracker.record("openai", "gpt-4o", 1000, 500, None, None, ts("2026-01-01T00:00:00Z"));
        tracker.record("openai", "gpt-4o", 1000, 500, None, None, ts("2026-01-02T00:00:00Z"));

        let day_one = tracker.cost_in_range(ts("2026-01-01T00:00:00Z"), ts("2026-01-02T00:00:00Z"));
        assert!((day_one - 7.50).abs() < 1e-9);
    }

    #[test]
    fn session_budget_exceeded_compares_against_accumulated_cost() {
        let tracker = CostTracker::with_defaults();
        tracker.record("openai", "gpt-4o", 1000, 500, Some("s1".into()), None, ts("2026-01-01T00:00:00Z"));
        assert!(tracker.session_budget_exceeded("s1", 5.0));
        assert!(!tracker.session_budget_exceeded("s1", 50.0));
    }
}
