use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::OrchestrationResult;
use crate::model::{Message, Role, Session, Summary, Todo};

/// Durable conversation storage: sessions, messages, summaries, todos.
///
/// Mirrors the shape of a `PersistenceStore`-family trait: small, focused
/// traits rather than one monolith, so a test double only needs to implement
/// what it exercises.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, profile: &str, title: &str) -> OrchestrationResult<Session>;
    async fn get_session(&self, id: &str) -> OrchestrationResult<Option<Session>>;
    async fn append_message(&self, session_id: &str, role: Role, agent_id: Option<&str>, content: &str) -> OrchestrationResult<Message>;

    /// Leading summary (if any) plus the most recent `limit` raw messages.
    async fn list_recent_messages(&self, session_id: &str, limit: usize) -> OrchestrationResult<Vec<Message>>;

    async fn get_summary(&self, session_id: &str) -> OrchestrationResult<Option<Summary>>;
    /// Persist a new summary, incrementing `summary_depth` relative to any
    /// existing one.
    async fn save_summary(&self, session_id: &str, text: &str, covers_through: DateTime<Utc>) -> OrchestrationResult<Summary>;

    async fn get_todos(&self, session_id: &str) -> OrchestrationResult<Vec<Todo>>;
    /// Atomically replaces the entire todo set for a session.
    async fn save_todos(&self, session_id: &str, todos: Vec<Todo>) -> OrchestrationResult<()>;

    async fn get_sub_session_id(&self, parent_id: &str, agent_name: &str) -> OrchestrationResult<Option<String>>;
    async fn create_sub_session(&self, parent_id: &str, agent_name: &str, profile: &str) -> OrchestrationResult<Session>;
}

/// A reusable knowledge pack discovered per profile, with optional trigger
/// phrases used to decide when to inject it into a delegation call.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub triggers: Vec<String>,
    pub body: String,
}

/// Discovers skills for a profile. The reference implementation walks
/// `profiles/<profile>/skills/<name>/SKILL.md`; this trait abstracts that so
/// tests can supply an in-memory fixture.
pub trait SkillLoader: Send + Sync {
    fn load(&self, profile: &str) -> Vec<Skill>;

    /// Skills whose triggers match `task_text`, bounded to at most `max`.
    fn matching(&self, profile: &str, task_text: &str, max: usize) -> Vec<Skill> {
        let text = task_text.to_lowercase();
        self.load(profile)
            .into_iter()
            .filter(|s| s.triggers.iter().any(|t| text.contains(&t.to_lowercase())))
            .take(max)
            .collect()
    }
}

/// The semantic memory sub-system's only contract the runtime relies on.
#[async_trait]
pub trait SemanticMemory: Send + Sync {
    async fn add(&self, text: &str, metadata: serde_json::Value) -> OrchestrationResult<()>;
    async fn search(&self, query: &str, top_k: usize) -> OrchestrationResult<Vec<String>>;
}
