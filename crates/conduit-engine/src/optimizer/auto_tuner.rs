//! Periodically re-fits `flat_max`/`light_max` from accumulated quality
//! data via grid search, gated by a conservative safety check so automatic
//! tuning can never silently regress success rate.

use conduit_kernel::{OptimizerConfig, OrchestrationResult, Thresholds};

use super::quality_tracker::QualityTracker;
use crate::persistence::metrics::{DepthBucketStats, TuningStats};

#[derive(Debug, Clone, PartialEq)]
pub enum TuningStatus {
    Updated,
    Skipped,
    InsufficientData,
}

#[derive(Debug, Clone)]
pub struct TuningResult {
    pub status: TuningStatus,
    pub reason: String,
    pub old_thresholds: Thresholds,
    pub new_thresholds: Thresholds,
    pub samples_used: u64,
}

fn cost_factor(depth: &str) -> f64 {
    match depth {
        "flat" => 1.0,
        "light" => 0.6,
        "structured" => 0.3,
        _ => 0.5,
    }
}

pub struct AutoTuner<'a> {
    tracker: &'a QualityTracker,
    config: &'a OptimizerConfig,
}

impl<'a> AutoTuner<'a> {
    pub fn new(tracker: &'a QualityTracker, config: &'a OptimizerConfig) -> Self {
        Self { tracker, config }
    }

    pub async fn should_tune(&self) -> OrchestrationResult<(bool, String)> {
        if !self.config.tuning.enabled {
            return Ok((false, "auto-tuning disabled".into()));
        }
        let stats = self.tracker.get_stats(7).await?;
        if stats.total_sessions < self.config.tuning.min_samples as u64 {
            return Ok((false, format!("insufficient samples ({}/{})", stats.total_sessions, self.config.tuning.min_samples)));
        }
        Ok((true, "ready to tune".into()))
    }

    pub async fn tune(&self) -> OrchestrationResult<TuningResult> {
        let old = self.config.thresholds.clone();
        let (should, reason) = self.should_tune().await?;
        if !should {
            let samples_used = if self.config.tuning.enabled { self.tracker.get_stats(7).await?.total_sessions } else { 0 };
            return Ok(TuningResult { status: TuningStatus::Skipped, reason, old_thresholds: old.clone(), new_thresholds: old, samples_used });
        }

        let tuning_stats = self.tracker.get_tuning_stats(30).await?;
        let min_samples = self.config.tuning.min_samples as u64;
        if tuning_stats.total_records < min_samples {
            return Ok(TuningResult {
                status: TuningStatus::InsufficientData,
                reason: format!("insufficient data ({}/{})", tuning_stats.total_records, min_samples),
                old_thresholds: old.clone(),
                new_thresholds: old,
                samples_used: tuning_stats.total_records,
            });
        }

        let optimal_by_bucket = Self::optimal_depth_per_bucket(&tuning_stats, self.config.weights.quality, self.config.weights.cost);
        let new_thresholds = self.find_optimal_thresholds(&optimal_by_bucket, &old);

        if !self.is_safe(&old, &new_thresholds, &tuning_stats.by_depth) {
            return Ok(TuningResult {
                status: TuningStatus::Skipped,
                reason: "safety check failed (change too large or would worsen a low-success depth)".into(),
                old_thresholds: old.clone(),
                new_thresholds,
                samples_used: tuning_stats.total_records,
            });
        }

        if new_thresholds.flat_max == old.flat_max && new_thresholds.light_max == old.light_max {
            return Ok(TuningResult {
                status: TuningStatus::Skipped,
                reason: "optimal thresholds unchanged".into(),
                old_thresholds: old.clone(),
                new_thresholds,
                samples_used: tuning_stats.total_records,
            });
        }

        Ok(TuningResult {
            status: TuningStatus::Updated,
            reason: "thresholds updated".into(),
            old_thresholds: old,
            new_thresholds,
            samples_used: tuning_stats.total_records,
        })
    }

    /// For each score bucket, the depth with the best `quality_weight *
    /// avg_success + cost_weight * cost_factor(depth)` score.
    fn optimal_depth_per_bucket(stats: &TuningStats, quality_weight: f64, cost_weight: f64) -> std::collections::HashMap<u32, String> {
        let mut result = std::collections::HashMap::new();
        for (bucket, depths) in &stats.by_score_bucket {
            let mut best_depth: Option<String> = None;
            let mut best_score = -1.0;
            for (depth, data) in depths {
                let score = quality_weight * data.avg_success + cost_weight * cost_factor(depth);
                if score > best_score {
                    best_score = score;
                    best_depth = Some(depth.clone());
                }
            }
            if let Some(depth) = best_depth {
                result.insert(*bucket, depth);
            }
        }
        result
    }

    fn find_optimal_thresholds(&self, optimal_by_bucket: &std::collections::HashMap<u32, String>, current: &Thresholds) -> Thresholds {
        let max_change = self.config.safety.max_threshold_change;
        let flat_lo = current.flat_max.saturating_sub(max_change).max(5);
        let flat_hi = (current.flat_max + max_change).min(20);
        let light_lo = current.light_max.saturating_sub(max_change).max(15);
        let light_hi = (current.light_max + max_change).min(40);

        let mut best = current.clone();
        let mut best_score = -1.0;

        for flat_max in flat_lo..=flat_hi {
            for light_max in light_lo..=light_hi {
                if light_max < flat_max + 3 {
                    continue;
                }
                let score = Self::evaluate_thresholds(optimal_by_bucket, flat_max, light_max);
                if score > best_score {
                    best_score = score;
                    best = Thresholds { flat_max, light_max };
                }
            }
        }

        best
    }

    fn evaluate_thresholds(optimal_by_bucket: &std::collections::HashMap<u32, String>, flat_max: u32, light_max: u32) -> f64 {
        if optimal_by_bucket.is_empty() {
            return 0.0;
        }
        let mut score = 0.0;
        let total = optimal_by_bucket.len() as f64;

        for (bucket, optimal_depth) in optimal_by_bucket {
            let assigned = if *bucket <= flat_max { "flat" } else if *bucket <= light_max { "light" } else { "structured" };
            if assigned == optimal_depth {
                score += 1.0;
            } else if assigned == "structured" && (optimal_depth == "light" || optimal_depth == "structured") {
                score += 0.5;
            }
        }

        score / total
    }

    fn is_safe(&self, old: &Thresholds, new: &Thresholds, by_depth: &std::collections::HashMap<String, DepthBucketStats>) -> bool {
        let max_change = self.config.safety.max_threshold_change as i64;
        if (new.flat_max as i64 - old.flat_max as i64).abs() > max_change {
            return false;
        }
        if (new.light_max as i64 - old.light_max as i64).abs() > max_change {
            return false;
        }

        for depth in ["flat", "light"] {
            if let Some(stats) = by_depth.get(depth) {
                if stats.avg_success < self.config.safety.min_success_rate {
                    if depth == "flat" && new.flat_max > old.flat_max {
                        return false;
                    }
                    if depth == "light" && new.light_max > old.light_max {
                        return false;
                    }
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::metrics::SqliteMetricsStore;
    use conduit_kernel::{Depth, ExecutionMetrics, SelectionResult, TaskScores};
    use std::sync::Arc;

    async fn tracker_with_samples(n: usize, depth: Depth, total_score: u32, success: f64) -> QualityTracker {
        let store = Arc::new(SqliteMetricsStore::in_memory().await.unwrap());
        let tracker = QualityTracker::new(store);
        for _ in 0..n {
            let exec = if success >= 1.0 { ExecutionMetrics::default() } else { ExecutionMetrics { errors: 1, ..Default::default() } };
            let selection = SelectionResult { depth, agents: vec![], skipped: vec![], reason: String::new(), total_score };
            tracker.record(TaskScores::default(), selection, exec, 10, 25).await.unwrap();
        }
        tracker
    }

    #[tokio::test]
    async fn should_tune_false_with_too_few_samples() {
        let tracker = tracker_with_samples(5, Depth::Flat, 5, 1.0).await;
        let config = OptimizerConfig::default();
        let tuner = AutoTuner::new(&tracker, &config);
        let (should, _) = tuner.should_tune().await.unwrap();
        assert!(!should);
    }

    #[tokio::test]
    async fn disabled_tuning_is_always_skipped() {
        let tracker = tracker_with_samples(30, Depth::Flat, 5, 1.0).await;
        let mut config = OptimizerConfig::default();
        config.tuning.enabled = false;
        let tuner = AutoTuner::new(&tracker, &config);
        let result = tuner.tune().await.unwrap();
        assert_eq!(result.status, TuningStatus::Skipped);
    }

    #[tokio::test]
    async fn insufficient_30_day_data_reports_insufficient() {
        let tracker = tracker_with_samples(25, Depth::Flat, 5, 1.0).await;
        let mut config = OptimizerConfig::default();
        config.tuning.min_samples = 30;
        let tuner = AutoTuner::new(&tracker, &config);
        let result = tuner.tune().await.unwrap();
        assert_eq!(result.status, TuningStatus::InsufficientData);
    }

    #[tokio::test]
    async fn eight_samples_against_a_min_of_twenty_is_skipped_with_the_actual_count() {
        let tracker = tracker_with_samples(8, Depth::Flat, 5, 1.0).await;
        let mut config = OptimizerConfig::default();
        config.tuning.min_samples = 20;
        let tuner = AutoTuner::new(&tracker, &config);
        let result = tuner.tune().await.unwrap();
        assert_eq!(result.status, TuningStatus::Skipped);
        assert_eq!(result.samples_used, 8);
        assert_eq!(result.old_thresholds.flat_max, result.new_thresholds.flat_max);
        assert_eq!(result.old_thresholds.light_max, result.new_thresholds.light_max);
    }

    #[test]
    fn thresholds_partial_eq_not_required_for_direct_field_compare() {
        let a = Thresholds { flat_max: 10, light_max: 25 };
        let b = Thresholds { flat_max: 10, light_max: 25 };
        assert_eq!(a.flat_max, b.flat_max);
        assert_eq!(a.light_max, b.light_max);
    }
}
