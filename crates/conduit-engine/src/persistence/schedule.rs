use chrono::{DateTime, Utc};
use conduit_kernel::error::{OrchestrationError, OrchestrationResult};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

fn storage_err(e: impl std::fmt::Display) -> OrchestrationError {
    OrchestrationError::Storage(e.to_string())
}

/// A durable entry in the scheduled-task table, mirroring the reference
/// implementation's `{id, description, cron_expr, profile, enabled,
/// next_run, last_run, working_dir}` shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub id: String,
    pub description: String,
    pub cron_expr: String,
    pub profile: String,
    pub enabled: bool,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub working_dir: String,
}

/// `sqlx`-backed store for scheduled tasks against `schedule.db`, following
/// the session/metrics stores' raw-SQL, manual-row-parsing style.
pub struct SqliteScheduleStore {
    pool: SqlitePool,
}

impl SqliteScheduleStore {
    pub async fn connect(database_url: &str) -> OrchestrationResult<Self> {
        let pool = SqlitePoolOptions::new().max_connections(8).connect(database_url).await.map_err(storage_err)?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn in_memory() -> OrchestrationResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn run_migrations(&self) -> OrchestrationResult<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                cron_expr TEXT NOT NULL,
                profile TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                next_run TEXT NOT NULL,
                last_run TEXT,
                working_dir TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_due ON scheduled_tasks(enabled, next_run)")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> OrchestrationResult<ScheduledTask> {
        let next_run: String = row.try_get("next_run").map_err(storage_err)?;
        let last_run: Option<String> = row.try_get("last_run").ok().flatten();
        let enabled: i64 = row.try_get("enabled").map_err(storage_err)?;
        Ok(ScheduledTask {
            id: row.try_get("id").map_err(storage_err)?,
            description: row.try_get("description").map_err(storage_err)?,
            cron_expr: row.try_get("cron_expr").map_err(storage_err)?,
            profile: row.try_get("profile").map_err(storage_err)?,
            enabled: enabled != 0,
            next_run: parse_ts(&next_run)?,
            last_run: last_run.map(|s| parse_ts(&s)).transpose()?,
            working_dir: row.try_get("working_dir").map_err(storage_err)?,
        })
    }

    pub async fn create(&self, task: ScheduledTask) -> OrchestrationResult<ScheduledTask> {
        sqlx::query(
            "INSERT INTO scheduled_tasks (id, description, cron_expr, profile, enabled, next_run, last_run, working_dir)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.description)
        .bind(&task.cron_expr)
        .bind(&task.profile)
        .bind(task.enabled as i64)
        .bind(task.next_run.to_rfc3339())
        .bind(task.last_run.map(|t| t.to_rfc3339()))
        .bind(&task.working_dir)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> OrchestrationResult<Option<ScheduledTask>> {
        let row = sqlx::query("SELECT * FROM scheduled_tasks WHERE id = ?").bind(id).fetch_optional(&self.pool).await.map_err(storage_err)?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    pub async fn list_all(&self) -> OrchestrationResult<Vec<ScheduledTask>> {
        let rows = sqlx::query("SELECT * FROM scheduled_tasks ORDER BY id ASC").fetch_all(&self.pool).await.map_err(storage_err)?;
        rows.iter().map(Self::parse_row).collect()
    }

    /// Tasks that are enabled and due as of `now`.
    pub async fn list_due(&self, now: DateTime<Utc>) -> OrchestrationResult<Vec<ScheduledTask>> {
        let rows = sqlx::query("SELECT * FROM scheduled_tasks WHERE enabled = 1 AND next_run <= ? ORDER BY next_run ASC")
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(Self::parse_row).collect()
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> OrchestrationResult<()> {
        let result = sqlx::query("UPDATE scheduled_tasks SET enabled = ? WHERE id = ?").bind(enabled as i64).bind(id).execute(&self.pool).await.map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(OrchestrationError::UserInput(format!("unknown scheduled task: {id}")));
        }
        Ok(())
    }

    pub async fn record_run(&self, id: &str, last_run: DateTime<Utc>, next_run: DateTime<Utc>) -> OrchestrationResult<()> {
        sqlx::query("UPDATE scheduled_tasks SET last_run = ?, next_run = ? WHERE id = ?")
            .bind(last_run.to_rfc3339())
            .bind(next_run.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> OrchestrationResult<bool> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?").bind(id).execute(&self.pool).await.map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }
}

fn parse_ts(s: &str) -> OrchestrationResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).map_err(storage_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, next_run: DateTime<Utc>) -> ScheduledTask {
        ScheduledTask {
            id: id.to_string(),
            description: "say hello".into(),
            cron_expr: "0 */6 * * *".into(),
            profile: "default".into(),
            enabled: true,
            next_run,
            last_run: None,
            working_dir: "/tmp".into(),
        }
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let store = SqliteScheduleStore::in_memory().await.unwrap();
        let created = store.create(task("t1", Utc::now())).await.unwrap();
        let fetched = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.description, "say hello");
    }

    #[tokio::test]
    async fn list_due_only_returns_enabled_and_past_due() {
        let store = SqliteScheduleStore::in_memory().await.unwrap();
        let now = Utc::now();
        store.create(task("past", now - chrono::Duration::minutes(5))).await.unwrap();
        store.create(task("future", now + chrono::Duration::hours(1))).await.unwrap();
        let mut disabled = task("disabled", now - chrono::Duration::minutes(5));
        disabled.enabled = false;
        store.create(disabled).await.unwrap();

        let due = store.list_due(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "past");
    }

    #[tokio::test]
    async fn record_run_updates_last_and_next() {
        let store = SqliteScheduleStore::in_memory().await.unwrap();
        let now = Utc::now();
        store.create(task("t1", now)).await.unwrap();
        let next = now + chrono::Duration::hours(6);
        store.record_run("t1", now, next).await.unwrap();
        let fetched = store.get("t1").await.unwrap().unwrap();
        assert_eq!(fetched.last_run, Some(now));
        assert_eq!(fetched.next_run, next);
    }

    #[tokio::test]
    async fn set_enabled_toggles_pause_state() {
        let store = SqliteScheduleStore::in_memory().await.unwrap();
        store.create(task("t1", Utc::now())).await.unwrap();
        store.set_enabled("t1", false).await.unwrap();
        assert!(!store.get("t1").await.unwrap().unwrap().enabled);
    }

    #[tokio::test]
    async fn set_enabled_on_unknown_id_errors() {
        let store = SqliteScheduleStore::in_memory().await.unwrap();
        assert!(store.set_enabled("nonexistent", true).await.is_err());
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = SqliteScheduleStore::in_memory().await.unwrap();
        store.create(task("t1", Utc::now())).await.unwrap();
        assert!(store.delete("t1").await.unwrap());
        assert!(store.get("t1").await.unwrap().is_none());
    }
}
