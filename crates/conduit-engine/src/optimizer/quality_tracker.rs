//! Wraps the metrics store with the success-inference heuristic the rest of
//! the optimizer (and AutoTuner) depends on.

use std::sync::Arc;

use conduit_kernel::{AgentExecutionMetrics, ExecutionMetrics, OptimizerConfig, OrchestrationResult, SelectionResult, TaskScores};

use crate::persistence::metrics::{AggregateStats, SqliteMetricsStore, TuningStats};

/// `1.0 - 0.8*min(errors,3) - 0.2*(retries>2) - 0.2*(apology present)`,
/// clamped to `0.0` whenever `exit_code != 0` or a configured negative
/// keyword was detected in the agent's output — a hard kill switch that
/// overrides the rest of the formula.
pub fn infer_success(exec: &ExecutionMetrics) -> f64 {
    if exec.exit_code != 0 || exec.has_negative_keywords {
        return 0.0;
    }
    let mut score = 1.0;
    score -= 0.8 * (exec.errors.min(3) as f64);
    if exec.retries > 2 {
        score -= 0.2;
    }
    if exec.has_apology {
        score -= 0.2;
    }
    score.clamp(0.0, 1.0)
}

/// Scans `output` for any of `config.negative_keywords` (case-insensitive
/// substring match), setting `ExecutionMetrics::has_negative_keywords`.
pub fn detect_negative_keywords(output: &str, config: &OptimizerConfig) -> bool {
    let lower = output.to_lowercase();
    config.negative_keywords.iter().any(|kw| lower.contains(&kw.to_lowercase()))
}

pub struct QualityTracker {
    store: Arc<SqliteMetricsStore>,
}

impl QualityTracker {
    pub fn new(store: Arc<SqliteMetricsStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, scores: TaskScores, selection: SelectionResult, exec: ExecutionMetrics, flat_max: u32, light_max: u32) -> OrchestrationResult<String> {
        let success = infer_success(&exec);
        self.store.record_request(scores, selection, exec, success, flat_max, light_max).await
    }

    pub async fn record_agent_execution(&self, metric_id: &str, exec: &AgentExecutionMetrics) -> OrchestrationResult<()> {
        self.store.record_agent_execution(metric_id, exec).await
    }

    pub async fn get_stats(&self, days: i64) -> OrchestrationResult<AggregateStats> {
        self.store.get_stats(days).await
    }

    pub async fn get_tuning_stats(&self, days: i64) -> OrchestrationResult<TuningStats> {
        self.store.get_tuning_stats(days).await
    }
}
