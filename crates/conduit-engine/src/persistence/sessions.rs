use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_kernel::error::{OrchestrationError, OrchestrationResult};
use conduit_kernel::model::{Message, Role, Session, SessionStatus, Summary, Todo, TodoStatus};
use conduit_kernel::traits::SessionStore;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

fn storage_err(e: impl std::fmt::Display) -> OrchestrationError {
    OrchestrationError::Storage(e.to_string())
}

/// `sqlx`-backed session store against `sessions.db`, following the
/// reference implementation's raw-SQL-with-manual-row-parsing style: no ORM,
/// migrations applied once via `CREATE TABLE IF NOT EXISTS` at construction.
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
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

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> OrchestrationResult<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                profile TEXT NOT NULL,
                title TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                metadata TEXT NOT NULL,
                parent_id TEXT,
                agent_name TEXT
            )"#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                role TEXT NOT NULL,
                agent_id TEXT,
                content TEXT NOT NULL,
                tool_call_refs TEXT
            )"#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS summaries (
                session_id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                covers_through_timestamp TEXT NOT NULL,
                summary_depth INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS todos (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                content TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, timestamp)")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_parent_agent ON sessions(parent_id, agent_name)")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(())
    }

    fn parse_session_row(row: &sqlx::sqlite::SqliteRow) -> OrchestrationResult<Session> {
        let status_str: String = row.try_get("status").map_err(storage_err)?;
        let metadata_str: String = row.try_get("metadata").map_err(storage_err)?;
        let created_at: String = row.try_get("created_at").map_err(storage_err)?;
        let last_updated: String = row.try_get("last_updated").map_err(storage_err)?;
        Ok(Session {
            id: row.try_get("id").map_err(storage_err)?,
            profile: row.try_get("profile").map_err(storage_err)?,
            title: row.try_get("title").map_err(storage_err)?,
            status: if status_str == "CLOSED" { SessionStatus::Closed } else { SessionStatus::Open },
            created_at: parse_ts(&created_at)?,
            last_updated: parse_ts(&last_updated)?,
            metadata: serde_json::from_str(&metadata_str).unwrap_or_default(),
            parent_id: row.try_get("parent_id").ok().flatten(),
            agent_name: row.try_get("agent_name").ok().flatten(),
        })
    }

    fn parse_message_row(row: &sqlx::sqlite::SqliteRow) -> OrchestrationResult<Message> {
        let role_str: String = row.try_get("role").map_err(storage_err)?;
        let timestamp: String = row.try_get("timestamp").map_err(storage_err)?;
        let refs: Option<String> = row.try_get("tool_call_refs").ok().flatten();
        Ok(Message {
            id: row.try_get("id").map_err(storage_err)?,
            session_id: row.try_get("session_id").map_err(storage_err)?,
            timestamp: parse_ts(&timestamp)?,
            role: role_str.parse().map_err(OrchestrationError::Storage)?,
            agent_id: row.try_get("agent_id").ok().flatten(),
            content: row.try_get("content").map_err(storage_err)?,
            tool_call_refs: refs.and_then(|s| serde_json::from_str(&s).ok()),
        })
    }

    fn parse_todo_row(row: &sqlx::sqlite::SqliteRow) -> OrchestrationResult<Todo> {
        let status_str: String = row.try_get("status").map_err(storage_err)?;
        let created_at: String = row.try_get("created_at").map_err(storage_err)?;
        let updated_at: String = row.try_get("updated_at").map_err(storage_err)?;
        let priority: i64 = row.try_get("priority").map_err(storage_err)?;
        Ok(Todo {
            id: row.try_get("id").map_err(storage_err)?,
            session_id: row.try_get("session_id").map_err(storage_err)?,
            content: row.try_get("content").map_err(storage_err)?,
            status: match status_str.as_str() {
                "in_progress" => TodoStatus::InProgress,
                "completed" => TodoStatus::Completed,
                "cancelled" => TodoStatus::Cancelled,
                _ => TodoStatus::Pending,
            },
            priority: priority as u32,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    }
}

fn parse_ts(s: &str) -> OrchestrationResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(storage_err)
}

fn status_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Open => "OPEN",
        SessionStatus::Closed => "CLOSED",
    }
}

fn todo_status_str(status: TodoStatus) -> &'static str {
    match status {
        TodoStatus::Pending => "pending",
        TodoStatus::InProgress => "in_progress",
        TodoStatus::Completed => "completed",
        TodoStatus::Cancelled => "cancelled",
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, profile: &str, title: &str) -> OrchestrationResult<Session> {
        let session = Session::new(uuid::Uuid::new_v4().to_string(), profile, title);
        sqlx::query(
            "INSERT INTO sessions (id, profile, title, status, created_at, last_updated, metadata, parent_id, agent_name)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.profile)
        .bind(&session.title)
        .bind(status_str(session.status))
        .bind(session.created_at.to_rfc3339())
        .bind(session.last_updated.to_rfc3339())
        .bind(serde_json::to_string(&session.metadata).unwrap_or_default())
        .bind(&session.parent_id)
        .bind(&session.agent_name)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> OrchestrationResult<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(Self::parse_session_row).transpose()
    }

    async fn append_message(&self, session_id: &str, role: Role, agent_id: Option<&str>, content: &str) -> OrchestrationResult<Message> {
        let mut message = Message::new(session_id, role, content);
        if let Some(a) = agent_id {
            message = message.with_agent(a);
        }
        sqlx::query(
            "INSERT INTO messages (id, session_id, timestamp, role, agent_id, content, tool_call_refs)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.timestamp.to_rfc3339())
        .bind(message.role.as_str())
        .bind(&message.agent_id)
        .bind(&message.content)
        .bind(message.tool_call_refs.as_ref().map(|r| serde_json::to_string(r).unwrap_or_default()))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("UPDATE sessions SET last_updated = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(message)
    }

    async fn list_recent_messages(&self, session_id: &str, limit: usize) -> OrchestrationResult<Vec<Message>> {
        let summary = self.get_summary(session_id).await?;

        let rows = sqlx::query("SELECT * FROM messages WHERE session_id = ? ORDER BY timestamp ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        let mut all: Vec<Message> = rows.iter().map(Self::parse_message_row).collect::<OrchestrationResult<_>>()?;

        // Messages the summary already folds in are below its cut-off and
        // are never returned raw again.
        if let Some(summary) = &summary {
            all.retain(|m| m.timestamp > summary.covers_through_timestamp);
        }

        let start = all.len().saturating_sub(limit);
        let mut result = Vec::new();
        if let Some(summary) = summary {
            result.push(Message::new(session_id, Role::System, format!("[summary] {}", summary.text)));
        }
        result.extend_from_slice(&all[start..]);
        Ok(result)
    }

    async fn get_summary(&self, session_id: &str) -> OrchestrationResult<Option<Summary>> {
        let row = sqlx::query("SELECT * FROM summaries WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let covers: String = row.try_get("covers_through_timestamp").map_err(storage_err)?;
                let updated: String = row.try_get("updated_at").map_err(storage_err)?;
                let depth: i64 = row.try_get("summary_depth").map_err(storage_err)?;
                Ok(Some(Summary {
                    session_id: row.try_get("session_id").map_err(storage_err)?,
                    text: row.try_get("text").map_err(storage_err)?,
                    covers_through_timestamp: parse_ts(&covers)?,
                    summary_depth: depth as u32,
                    updated_at: parse_ts(&updated)?,
                }))
            }
        }
    }

    async fn save_summary(&self, session_id: &str, text: &str, covers_through: DateTime<Utc>) -> OrchestrationResult<Summary> {
        let depth = match self.get_summary(session_id).await? {
            Some(existing) => existing.summary_depth + 1,
            None => 0,
        };
        let summary = Summary {
            session_id: session_id.to_string(),
            text: text.to_string(),
            covers_through_timestamp: covers_through,
            summary_depth: depth,
            updated_at: Utc::now(),
        };
        sqlx::query(
            "INSERT OR REPLACE INTO summaries (session_id, text, covers_through_timestamp, summary_depth, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&summary.session_id)
        .bind(&summary.text)
        .bind(summary.covers_through_timestamp.to_rfc3339())
        .bind(summary.summary_depth as i64)
        .bind(summary.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(summary)
    }

    async fn get_todos(&self, session_id: &str) -> OrchestrationResult<Vec<Todo>> {
        let rows = sqlx::query("SELECT * FROM todos WHERE session_id = ? ORDER BY priority ASC, created_at ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(Self::parse_todo_row).collect()
    }

    async fn save_todos(&self, session_id: &str, todos: Vec<Todo>) -> OrchestrationResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        sqlx::query("DELETE FROM todos WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        for todo in &todos {
            sqlx::query(
                "INSERT INTO todos (id, session_id, content, status, priority, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&todo.id)
            .bind(&todo.session_id)
            .bind(&todo.content)
            .bind(todo_status_str(todo.status))
            .bind(todo.priority as i64)
            .bind(todo.created_at.to_rfc3339())
            .bind(todo.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn get_sub_session_id(&self, parent_id: &str, agent_name: &str) -> OrchestrationResult<Option<String>> {
        let row = sqlx::query("SELECT id FROM sessions WHERE parent_id = ? AND agent_name = ?")
            .bind(parent_id)
            .bind(agent_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|r| r.try_get::<String, _>("id")).transpose().map_err(storage_err)?)
    }

    async fn create_sub_session(&self, parent_id: &str, agent_name: &str, profile: &str) -> OrchestrationResult<Session> {
        if let Some(existing) = self.get_sub_session_id(parent_id, agent_name).await? {
            return self
                .get_session(&existing)
                .await?
                .ok_or_else(|| OrchestrationError::Storage("sub-session vanished".into()));
        }
        let session = Session::sub_session(uuid::Uuid::new_v4().to_string(), profile, parent_id, agent_name);
        sqlx::query(
            "INSERT INTO sessions (id, profile, title, status, created_at, last_updated, metadata, parent_id, agent_name)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.profile)
        .bind(&session.title)
        .bind(status_str(session.status))
        .bind(session.created_at.to_rfc3339())
        .bind(session.last_updated.to_rfc3339())
        .bind(serde_json::to_string(&session.metadata).unwrap_or_default())
        .bind(&session.parent_id)
        .bind(&session.agent_name)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_get_session_round_trip() {
        let store = SqliteSessionStore::in_memory().await.unwrap();
        let created = store.create_session("default", "hello").await.unwrap();
        let fetched = store.get_session(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.profile, "default");
        assert_eq!(fetched.title, "hello");
    }

    #[tokio::test]
    async fn messages_ordered_and_limited() {
        let store = SqliteSessionStore::in_memory().await.unwrap();
        let session = store.create_session("default", "t").await.unwrap();
        for i in 0..15 {
            store
                .append_message(&session.id, Role::User, None, &format!("msg {i}"))
                .await
                .unwrap();
        }
        let recent = store.list_recent_messages(&session.id, 10).await.unwrap();
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].content, "msg 5");
        assert_eq!(recent.last().unwrap().content, "msg 14");
    }

    #[tokio::test]
    async fn summary_depth_increments() {
        let store = SqliteSessionStore::in_memory().await.unwrap();
        let session = store.create_session("default", "t").await.unwrap();
        let s1 = store.save_summary(&session.id, "first", Utc::now()).await.unwrap();
        assert_eq!(s1.summary_depth, 0);
        let s2 = store.save_summary(&session.id, "second", Utc::now()).await.unwrap();
        assert_eq!(s2.summary_depth, 1);
    }

    #[tokio::test]
    async fn leading_summary_is_prepended_and_folded_messages_are_elided() {
        let store = SqliteSessionStore::in_memory().await.unwrap();
        let session = store.create_session("default", "t").await.unwrap();
        for i in 0..3 {
            store.append_message(&session.id, Role::User, None, &format!("old {i}")).await.unwrap();
        }
        let cutoff = Utc::now();
        store.save_summary(&session.id, "folded the early turns", cutoff).await.unwrap();
        for i in 0..2 {
            store.append_message(&session.id, Role::User, None, &format!("new {i}")).await.unwrap();
        }

        let recent = store.list_recent_messages(&session.id, 10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].role, Role::System);
        assert!(recent[0].content.contains("folded the early turns"));
        assert_eq!(recent[1].content, "new 0");
        assert_eq!(recent[2].content, "new 1");
    }

    #[tokio::test]
    async fn todowrite_replaces_atomically() {
        let store = SqliteSessionStore::in_memory().await.unwrap();
        let session = store.create_session("default", "t").await.unwrap();
        let now = Utc::now();
        let todos = vec![Todo {
            id: "t1".into(),
            session_id: session.id.clone(),
            content: "do thing".into(),
            status: TodoStatus::Pending,
            priority: 1,
            created_at: now,
            updated_at: now,
        }];
        store.save_todos(&session.id, todos.clone()).await.unwrap();
        assert_eq!(store.get_todos(&session.id).await.unwrap().len(), 1);

        store.save_todos(&session.id, vec![]).await.unwrap();
        assert_eq!(store.get_todos(&session.id).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn sub_session_uniqueness() {
        let store = SqliteSessionStore::in_memory().await.unwrap();
        let parent = store.create_session("default", "p").await.unwrap();
        let first = store.create_sub_session(&parent.id, "reviewer", "default").await.unwrap();
        let second = store.create_sub_session(&parent.id, "reviewer", "default").await.unwrap();
        assert_eq!(first.id, second.id);
    }
}
