use std::collections::HashMap;

use chrono::{Duration, Utc};
use conduit_kernel::error::{OrchestrationError, OrchestrationResult};
use conduit_kernel::model::{AgentExecutionMetrics, Depth, ExecutionMetrics, SelectionResult, TaskScores};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

fn storage_err(e: impl std::fmt::Display) -> OrchestrationError {
    OrchestrationError::Storage(e.to_string())
}

/// A persisted per-request record: scores, selection, execution metrics, and
/// the inferred success value, append-only.
#[derive(Debug, Clone)]
pub struct MetricsRecord {
    pub id: String,
    pub scores: TaskScores,
    pub selection: SelectionResult,
    pub exec: ExecutionMetrics,
    pub inferred_success: f64,
    pub flat_max: u32,
    pub light_max: u32,
    pub created_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct DepthBucketStats {
    pub count: u64,
    pub avg_success: f64,
    pub avg_tokens: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateStats {
    pub total_sessions: u64,
    pub by_depth: HashMap<String, DepthBucketStats>,
}

#[derive(Debug, Clone, Default)]
pub struct TuningStats {
    pub total_records: u64,
    pub by_depth: HashMap<String, DepthBucketStats>,
    /// score_bucket -> depth -> stats
    pub by_score_bucket: HashMap<u32, HashMap<String, DepthBucketStats>>,
}

/// Append-only `sqlx`-backed metrics store against `metrics.db`, mirroring
/// `entity_llm_api_call`'s dynamic-statistics-query style from the reference
/// implementation but specialised to the optimizer's two tables.
pub struct SqliteMetricsStore {
    pool: SqlitePool,
}

fn depth_str(d: Depth) -> &'static str {
    d.as_str()
}

fn score_bucket(total: u32) -> u32 {
    5 * (total / 5)
}

impl SqliteMetricsStore {
    pub async fn connect(database_url: &str) -> OrchestrationResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(storage_err)?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn in_memory() -> OrchestrationResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn run_migrations(&self) -> OrchestrationResult<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS metrics (
                id TEXT PRIMARY KEY,
                total_score INTEGER NOT NULL,
                depth TEXT NOT NULL,
                task_type TEXT NOT NULL,
                tokens_in INTEGER NOT NULL,
                tokens_out INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                tool_calls INTEGER NOT NULL,
                errors INTEGER NOT NULL,
                inferred_success REAL NOT NULL,
                flat_max INTEGER NOT NULL,
                light_max INTEGER NOT NULL,
                selected_agents TEXT NOT NULL,
                skipped_agents TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS agent_executions (
                id TEXT PRIMARY KEY,
                metric_id TEXT NOT NULL REFERENCES metrics(id),
                agent_name TEXT NOT NULL,
                parent_agent TEXT,
                tokens_in INTEGER NOT NULL,
                tokens_out INTEGER NOT NULL,
                execution_time_ms INTEGER NOT NULL,
                tool_calls INTEGER NOT NULL,
                inline_score REAL,
                summary_depth INTEGER NOT NULL,
                history_turns INTEGER NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_metrics_created ON metrics(created_at)")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(())
    }

    pub async fn record_request(
        &self,
        scores: TaskScores,
        selection: SelectionResult,
        exec: ExecutionMetrics,
        inferred_success: f64,
        flat_max: u32,
        light_max: u32,
    ) -> OrchestrationResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO metrics (id, total_score, depth, task_type, tokens_in, tokens_out, duration_ms, tool_calls, errors,
                inferred_success, flat_max, light_max, selected_agents, skipped_agents, created_at)
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&id)
        .bind(selection.total_score as i64)
        .bind(depth_str(selection.depth))
        .bind(scores.task_type.as_str())
        .bind(exec.tokens_in as i64)
        .bind(exec.tokens_out as i64)
        .bind(exec.duration_ms as i64)
        .bind(exec.tool_calls as i64)
        .bind(exec.errors as i64)
        .bind(inferred_success)
        .bind(flat_max as i64)
        .bind(light_max as i64)
        .bind(serde_json::to_string(&selection.agents).unwrap_or_default())
        .bind(serde_json::to_string(&selection.skipped).unwrap_or_default())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(id)
    }

    pub async fn record_agent_execution(&self, metric_id: &str, exec: &AgentExecutionMetrics) -> OrchestrationResult<()> {
        sqlx::query(
            "INSERT INTO agent_executions (id, metric_id, agent_name, parent_agent, tokens_in, tokens_out,
                execution_time_ms, tool_calls, inline_score, summary_depth, history_turns, error_message, created_at)
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(metric_id)
        .bind(&exec.agent_name)
        .bind(&exec.parent_agent)
        .bind(exec.tokens_in as i64)
        .bind(exec.tokens_out as i64)
        .bind(exec.execution_time_ms as i64)
        .bind(exec.tool_calls as i64)
        .bind(exec.inline_score)
        .bind(exec.summary_depth as i64)
        .bind(exec.history_turns as i64)
        .bind(&exec.error_message)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    /// Aggregate stats over the last `days` days, grouped by depth only —
    /// cheap enough to call on every request for `AutoTuner::should_tune`.
    pub async fn get_stats(&self, days: i64) -> OrchestrationResult<AggregateStats> {
        let since = (Utc::now() - Duration::days(days)).to_rfc3339();
        let rows = sqlx::query(
            "SELECT depth, COUNT(*) as count, AVG(inferred_success) as avg_success, AVG(tokens_in + tokens_out) as avg_tokens
             FROM metrics WHERE created_at >= ? GROUP BY depth",
        )
        .bind(&since)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut by_depth = HashMap::new();
        let mut total = 0u64;
        for row in rows {
            let depth: String = row.try_get("depth").map_err(storage_err)?;
            let count: i64 = row.try_get("count").map_err(storage_err)?;
            let avg_success: f64 = row.try_get("avg_success").map_err(storage_err)?;
            let avg_tokens: f64 = row.try_get("avg_tokens").map_err(storage_err)?;
            total += count as u64;
            by_depth.insert(depth, DepthBucketStats { count: count as u64, avg_success, avg_tokens });
        }
        Ok(AggregateStats { total_sessions: total, by_depth })
    }

    /// Aggregate stats over the last `days` days, bucketed by depth and by
    /// `5*floor(total_score/5)` — the shape `AutoTuner` consumes, computed
    /// without ever materialising raw rows in memory beyond one scan.
    pub async fn get_tuning_stats(&self, days: i64) -> OrchestrationResult<TuningStats> {
        let since = (Utc::now() - Duration::days(days)).to_rfc3339();
        let rows = sqlx::query(
            "SELECT total_score, depth, inferred_success, (tokens_in + tokens_out) as tokens
             FROM metrics WHERE created_at >= ?",
        )
        .bind(&since)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut total_records = 0u64;
        let mut by_depth_sum: HashMap<String, (u64, f64, f64)> = HashMap::new();
        let mut by_bucket: HashMap<u32, HashMap<String, (u64, f64)>> = HashMap::new();

        for row in &rows {
            let total_score: i64 = row.try_get("total_score").map_err(storage_err)?;
            let depth: String = row.try_get("depth").map_err(storage_err)?;
            let success: f64 = row.try_get("inferred_success").map_err(storage_err)?;
            let tokens: i64 = row.try_get("tokens").map_err(storage_err)?;

            total_records += 1;
            let entry = by_depth_sum.entry(depth.clone()).or_insert((0, 0.0, 0.0));
            entry.0 += 1;
            entry.1 += success;
            entry.2 += tokens as f64;

            let bucket = score_bucket(total_score.max(0) as u32);
            let bucket_entry = by_bucket.entry(bucket).or_default().entry(depth).or_insert((0, 0.0));
            bucket_entry.0 += 1;
            bucket_entry.1 += success;
        }

        let by_depth = by_depth_sum
            .into_iter()
            .map(|(depth, (count, success_sum, tokens_sum))| {
                (
                    depth,
                    DepthBucketStats {
                        count,
                        avg_success: if count > 0 { success_sum / count as f64 } else { 0.0 },
                        avg_tokens: if count > 0 { tokens_sum / count as f64 } else { 0.0 },
                    },
                )
            })
            .collect();

        let by_score_bucket = by_bucket
            .into_iter()
            .map(|(bucket, depths)| {
                let depths = depths
                    .into_iter()
                    .map(|(depth, (count, success_sum))| {
                        (
                            depth,
                            DepthBucketStats {
                                count,
                                avg_success: if count > 0 { success_sum / count as f64 } else { 0.0 },
                                avg_tokens: 0.0,
                            },
                        )
                    })
                    .collect();
                (bucket, depths)
            })
            .collect();

        Ok(TuningStats { total_records, by_depth, by_score_bucket })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_kernel::model::{Depth, TaskType};

    fn sample_selection() -> SelectionResult {
        SelectionResult {
            depth: Depth::Light,
            agents: vec!["backend-coder".into()],
            skipped: vec!["doc-writer".into()],
            reason: "test".into(),
            total_score: 15,
        }
    }

    #[tokio::test]
    async fn record_and_aggregate() {
        let store = SqliteMetricsStore::in_memory().await.unwrap();
        for _ in 0..3 {
            let exec = ExecutionMetrics { tokens_in: 100, tokens_out: 50, ..Default::default() };
            let scores = TaskScores { task_type: TaskType::Feature, ..Default::default() };
            store.record_request(scores, sample_selection(), exec, 1.0, 10, 25).await.unwrap();
        }
        let stats = store.get_stats(7).await.unwrap();
        assert_eq!(stats.total_sessions, 3);
        let light = stats.by_depth.get("light").unwrap();
        assert_eq!(light.count, 3);
        assert!((light.avg_success - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn tuning_stats_bucket_by_score() {
        let store = SqliteMetricsStore::in_memory().await.unwrap();
        let mut sel = sample_selection();
        sel.total_score = 12; // bucket 10
        let exec = ExecutionMetrics::default();
        store.record_request(TaskScores::default(), sel, exec, 0.8, 10, 25).await.unwrap();
        let tuning = store.get_tuning_stats(30).await.unwrap();
        assert_eq!(tuning.total_records, 1);
        assert!(tuning.by_score_bucket.contains_key(&10));
    }
}
