//! Polls the durable scheduled-task table and, for every entry that is due,
//! re-enters the engine through [`Orchestrator::process`] as if the task's
//! description had just been typed by a user.
//!
//! Concurrency is bounded two ways, mirroring the reference cron
//! implementation: a global cap on how many scheduled runs may be in flight
//! at once, and a per-schedule guard that skips a tick for a schedule whose
//! previous run hasn't finished yet rather than stacking runs behind it.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashSet;
use futures::stream::{self, StreamExt};

use conduit_kernel::error::{OrchestrationError, OrchestrationResult};

use crate::orchestrator::Orchestrator;
use crate::persistence::schedule::{ScheduledTask, SqliteScheduleStore};

const DEFAULT_MAX_CONCURRENT: usize = 4;
const DEFAULT_RUN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// `cron` parses seconds-first 6/7-field expressions. Schedules in this
/// codebase are standard five-field (minute hour day month weekday), so a
/// five-field expression gets a leading `"0"` seconds field before parsing.
fn to_six_field(cron_expr: &str) -> String {
    if cron_expr.split_whitespace().count() == 5 {
        format!("0 {cron_expr}")
    } else {
        cron_expr.to_string()
    }
}

/// Computes the next occurrence of `cron_expr` strictly after `after`.
pub fn next_occurrence(cron_expr: &str, after: DateTime<Utc>) -> OrchestrationResult<DateTime<Utc>> {
    let schedule = Schedule::from_str(&to_six_field(cron_expr)).map_err(|e| OrchestrationError::Validation(format!("invalid cron expression \"{cron_expr}\": {e}")))?;
    schedule.after(&after).next().ok_or_else(|| OrchestrationError::Validation(format!("cron expression \"{cron_expr}\" has no future occurrences")))
}

/// Drives the scheduled-task table against an [`Orchestrator`].
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    store: Arc<SqliteScheduleStore>,
    max_concurrent: usize,
    run_timeout: std::time::Duration,
    in_flight: Arc<DashSet<String>>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, store: Arc<SqliteScheduleStore>) -> Self {
        Self { orchestrator, store, max_concurrent: DEFAULT_MAX_CONCURRENT, run_timeout: DEFAULT_RUN_TIMEOUT, in_flight: Arc::new(DashSet::new()) }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: std::time::Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    /// Registers a new schedule, rejecting an unparseable cron expression up
    /// front rather than discovering it on the first tick.
    pub async fn register(&self, description: &str, cron_expr: &str, profile: &str, working_dir: &str) -> OrchestrationResult<String> {
        let now = Utc::now();
        let next_run = next_occurrence(cron_expr, now)?;
        let id = uuid::Uuid::new_v4().to_string();
        let task = ScheduledTask {
            id: id.clone(),
            description: description.to_string(),
            cron_expr: cron_expr.to_string(),
            profile: profile.to_string(),
            enabled: true,
            next_run,
            last_run: None,
            working_dir: working_dir.to_string(),
        };
        self.store.create(task).await?;
        Ok(id)
    }

    pub async fn unregister(&self, id: &str) -> OrchestrationResult<bool> {
        self.store.delete(id).await
    }

    pub async fn pause(&self, id: &str) -> OrchestrationResult<()> {
        self.store.set_enabled(id, false).await
    }

    pub async fn resume(&self, id: &str) -> OrchestrationResult<()> {
        self.store.set_enabled(id, true).await
    }

    pub async fn list(&self) -> OrchestrationResult<Vec<ScheduledTask>> {
        self.store.list_all().await
    }

    /// One polling cycle: finds everything due, skips schedules whose
    /// previous run is still in flight, and runs the rest with bounded
    /// concurrency. Returns the ids that were actually dispatched.
    pub async fn tick(&self) -> OrchestrationResult<Vec<String>> {
        let now = Utc::now();
        let due = self.store.list_due(now).await?;

        let mut runnable = Vec::new();
        for task in due {
            if self.in_flight.insert(task.id.clone()) {
                runnable.push(task);
            } else {
                tracing::debug!(schedule_id = %task.id, "skipping tick, previous run still in flight");
            }
        }

        let dispatched: Vec<String> = runnable.iter().map(|t| t.id.clone()).collect();

        stream::iter(runnable)
            .for_each_concurrent(self.max_concurrent, |task| async move {
                self.run_one(task).await;
            })
            .await;

        Ok(dispatched)
    }

    async fn run_one(&self, task: ScheduledTask) {
        let job_id = format!("schedule:{}", task.id);
        let ran_at = Utc::now();

        let run = self.orchestrator.process(None, &task.profile, &task.description, &task.working_dir, &job_id);
        match tokio::time::timeout(self.run_timeout, run).await {
            Ok(Err(e)) => tracing::warn!(schedule_id = %task.id, error = %e, "scheduled task run failed"),
            Err(_) => tracing::warn!(schedule_id = %task.id, timeout_secs = self.run_timeout.as_secs(), "scheduled task run timed out"),
            Ok(Ok(_)) => {}
        }

        match next_occurrence(&task.cron_expr, ran_at) {
            Ok(next_run) => {
                if let Err(e) = self.store.record_run(&task.id, ran_at, next_run).await {
                    tracing::error!(schedule_id = %task.id, error = %e, "failed to persist schedule run");
                }
            }
            Err(e) => tracing::error!(schedule_id = %task.id, error = %e, "could not compute next occurrence, schedule will not re-fire"),
        }

        self.in_flight.remove(&task.id);
    }

    /// Polls forever at roughly `period`, logging but not propagating
    /// per-tick errors so one bad poll doesn't take the loop down.
    pub async fn run_forever(&self, period: std::time::Duration) -> ! {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "schedule poll failed");
            }
        }
    }
}

/// Counts how many times `cron_expr` fires within `[start, start + 1 day)`,
/// used to sanity-check a cron expression's cadence before it's persisted.
pub fn daily_occurrence_count(cron_expr: &str, start: DateTime<Utc>) -> OrchestrationResult<usize> {
    let schedule = Schedule::from_str(&to_six_field(cron_expr)).map_err(|e| OrchestrationError::Validation(e.to_string()))?;
    let end = start + chrono::Duration::days(1);
    Ok(schedule.after(&(start - chrono::Duration::seconds(1))).take_while(|t| *t < end).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::context_compressor::SlidingWindowCompressor;
    use crate::agent::runtime::AgentRuntime;
    use crate::cancellation::CancellationRegistry;
    use crate::llm::deterministic::DeterministicProvider;
    use crate::llm::provider::LLMProvider;
    use crate::optimizer::{AgentSelector, TaskAnalyzer};
    use crate::persistence::metrics::SqliteMetricsStore;
    use crate::persistence::sessions::SqliteSessionStore;
    use crate::tools::builtin::EchoTool;
    use crate::tools::dispatcher::ToolDispatcher;
    use crate::tools::registry::ToolRegistry;
    use conduit_kernel::model::AgentConfig;
    use conduit_kernel::traits::SessionStore;
    use conduit_kernel::AnalysisConfig;

    fn agent(name: &str) -> AgentConfig {
        AgentConfig { name: name.to_string(), description: String::new(), system_prompt: "You are an agent.".into(), allowed_tools: Default::default(), mode: "default".into() }
    }

    async fn scheduler_with(llm: Arc<dyn LLMProvider>) -> Scheduler {
        let sessions: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::in_memory().await.unwrap());
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let dispatcher = ToolDispatcher::new(Arc::new(registry));
        let compressor = Arc::new(SlidingWindowCompressor::new(20));
        let cancellation = Arc::new(CancellationRegistry::new());
        let runtime = Arc::new(AgentRuntime::new(llm.clone(), dispatcher, vec![], compressor, cancellation.clone()).with_sessions(sessions.clone()));

        let mut agents = HashMap::new();
        agents.insert("orchestrator".to_string(), agent("orchestrator"));

        let task_analyzer = TaskAnalyzer::new(AnalysisConfig::default());
        let agent_selector = AgentSelector::new(&conduit_kernel::OptimizerConfig::default(), crate::optimizer::default_agent_rules());
        let metrics_store = Arc::new(SqliteMetricsStore::in_memory().await.unwrap());
        let quality_tracker = Arc::new(crate::optimizer::QualityTracker::new(metrics_store));

        let orchestrator = Arc::new(Orchestrator::new(sessions, runtime, agents, task_analyzer, agent_selector, quality_tracker, llm, cancellation));
        let store = Arc::new(SqliteScheduleStore::in_memory().await.unwrap());

        Scheduler::new(orchestrator, store)
    }

    #[test]
    fn six_hourly_cron_fires_four_times_a_day() {
        let start = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let count = daily_occurrence_count("0 */6 * * *", start).unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        let now = Utc::now();
        assert!(next_occurrence("not a cron expression", now).is_err());
    }

    #[test]
    fn next_occurrence_is_strictly_after_the_reference_time() {
        let now = DateTime::parse_from_rfc3339("2026-03-01T05:00:00Z").unwrap().with_timezone(&Utc);
        let next = next_occurrence("0 */6 * * *", now).unwrap();
        assert!(next > now);
        assert_eq!(next.format("%H:%M").to_string(), "06:00");
    }

    #[tokio::test]
    async fn register_rejects_bad_cron_and_does_not_persist() {
        let llm = Arc::new(DeterministicProvider::fixed("m", "done"));
        let scheduler = scheduler_with(llm).await;
        assert!(scheduler.register("say hi", "garbage", "default", "/tmp").await.is_err());
        assert!(scheduler.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tick_runs_a_due_task_and_reschedules_it() {
        let llm = Arc::new(DeterministicProvider::fixed("m", "standup notes sent"));
        let scheduler = scheduler_with(llm).await;
        let id = scheduler.register("post daily standup", "0 */6 * * *", "default", "/tmp/work").await.unwrap();

        // force the task due right now instead of waiting for the next 6-hour boundary
        let now = Utc::now();
        scheduler.store.record_run(&id, now - chrono::Duration::hours(7), now - chrono::Duration::seconds(1)).await.unwrap();

        let dispatched = scheduler.tick().await.unwrap();
        assert_eq!(dispatched, vec![id.clone()]);

        let task = scheduler.store.get(&id).await.unwrap().unwrap();
        assert!(task.last_run.is_some());
        assert!(task.next_run > now);
        assert!(!scheduler.in_flight.contains(&id));
    }

    #[tokio::test]
    async fn paused_task_is_never_dispatched() {
        let llm = Arc::new(DeterministicProvider::fixed("m", "done"));
        let scheduler = scheduler_with(llm).await;
        let id = scheduler.register("nightly cleanup", "0 */6 * * *", "default", "/tmp").await.unwrap();
        let now = Utc::now();
        scheduler.store.record_run(&id, now - chrono::Duration::hours(7), now - chrono::Duration::seconds(1)).await.unwrap();
        scheduler.pause(&id).await.unwrap();

        let dispatched = scheduler.tick().await.unwrap();
        assert!(dispatched.is_empty());
    }

    #[tokio::test]
    async fn unregister_removes_the_schedule() {
        let llm = Arc::new(DeterministicProvider::fixed("m", "done"));
        let scheduler = scheduler_with(llm).await;
        let id = scheduler.register("one off", "0 0 * * *", "default", "/tmp").await.unwrap();
        assert!(scheduler.unregister(&id).await.unwrap());
        assert!(scheduler.store.get(&id).await.unwrap().is_none());
    }
}
