use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Open,
    Closed,
}

/// A durable conversation. May be a top-level session or a sub-session bound
/// to `(parent_id, agent_name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub profile: String,
    pub title: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub parent_id: Option<String>,
    pub agent_name: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, profile: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            profile: profile.into(),
            title: title.into(),
            status: SessionStatus::Open,
            created_at: now,
            last_updated: now,
            metadata: HashMap::new(),
            parent_id: None,
            agent_name: None,
        }
    }

    pub fn sub_session(
        id: impl Into<String>,
        profile: impl Into<String>,
        parent_id: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Self {
        let mut s = Self::new(id, profile, "sub-session");
        s.parent_id = Some(parent_id.into());
        s.agent_name = Some(agent_name.into());
        s
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Append-only message belonging to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub agent_id: Option<String>,
    pub content: String,
    pub tool_call_refs: Option<Vec<String>>,
}

impl Message {
    pub fn new(session_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            role,
            agent_id: None,
            content: content.into(),
            tool_call_refs: None,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

/// At most one per session; a fold of older messages produced by an LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub session_id: String,
    pub text: String,
    pub covers_through_timestamp: DateTime<Utc>,
    pub summary_depth: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,
    pub session_id: String,
    pub content: String,
    pub status: TodoStatus,
    pub priority: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An agent persona loaded from a profile directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub allowed_tools: HashSet<String>,
    pub mode: String,
}

/// The closed set of task classifications the analyzer may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Bugfix,
    Feature,
    Refactor,
    Docs,
    Security,
    Other,
}

impl Default for TaskType {
    fn default() -> Self {
        TaskType::Other
    }
}

impl std::str::FromStr for TaskType {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "bugfix" => TaskType::Bugfix,
            "feature" => TaskType::Feature,
            "refactor" => TaskType::Refactor,
            "docs" => TaskType::Docs,
            "security" => TaskType::Security,
            _ => TaskType::Other,
        })
    }
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Bugfix => "bugfix",
            TaskType::Feature => "feature",
            TaskType::Refactor => "refactor",
            TaskType::Docs => "docs",
            TaskType::Security => "security",
            TaskType::Other => "other",
        }
    }
}

/// Task-complexity scores produced by the TaskAnalyzer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskScores {
    pub scope: u32,
    pub novelty: f64,
    pub risk: u32,
    pub complexity: u32,
    pub dependencies: u32,
    pub task_type: TaskType,
}

impl Default for TaskScores {
    fn default() -> Self {
        Self {
            scope: 5,
            novelty: 0.5,
            risk: 5,
            complexity: 5,
            dependencies: 3,
            task_type: TaskType::Other,
        }
    }
}

impl TaskScores {
    pub fn clamp(scope: f64, novelty: f64, risk: f64, complexity: f64, dependencies: f64, task_type: &str) -> Self {
        fn clamp_range(v: f64, lo: f64, hi: f64) -> f64 {
            if v.is_nan() {
                return (lo + hi) / 2.0;
            }
            v.max(lo).min(hi)
        }
        Self {
            scope: clamp_range(scope, 0.0, 10.0).round() as u32,
            novelty: clamp_range(novelty, 0.0, 1.0),
            risk: clamp_range(risk, 0.0, 10.0).round() as u32,
            complexity: clamp_range(complexity, 0.0, 10.0).round() as u32,
            dependencies: clamp_range(dependencies, 0.0, 10.0).round() as u32,
            task_type: task_type.parse().unwrap_or(TaskType::Other),
        }
    }

    /// `scope + round(novelty*10) + risk + complexity + dependencies`.
    pub fn total(&self) -> u32 {
        self.scope + (self.novelty * 10.0).round() as u32 + self.risk + self.complexity + self.dependencies
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    Flat,
    Light,
    Structured,
    Full,
}

impl Depth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Depth::Flat => "flat",
            Depth::Light => "light",
            Depth::Structured => "structured",
            Depth::Full => "full",
        }
    }
}

/// Output of the AgentSelector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResult {
    pub depth: Depth,
    pub agents: Vec<String>,
    pub skipped: Vec<String>,
    pub reason: String,
    pub total_score: u32,
}

/// Per-request execution metrics used for success inference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration_ms: u64,
    pub tool_calls: u32,
    pub errors: u32,
    pub retries: u32,
    pub has_apology: bool,
    pub exit_code: i32,
    pub has_negative_keywords: bool,
}

/// A single delegated sub-call's metrics, attached to a parent request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionMetrics {
    pub agent_name: String,
    pub parent_agent: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub execution_time_ms: u64,
    pub tool_calls: u32,
    pub inline_score: Option<f64>,
    pub eval_completion: Option<f64>,
    pub eval_quality: Option<f64>,
    pub eval_task_complexity: Option<f64>,
    pub eval_prompt_specificity: Option<f64>,
    pub summary_depth: u32,
    pub history_turns: u32,
    pub error_message: Option<String>,
}

/// Task-type-only skip condition, matching the reference implementation:
/// `skip_when` never references a score threshold, which is what resolves
/// the otherwise-ambiguous mixed-precedence case with `required_when`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkipWhen {
    #[serde(default)]
    pub task_type: Vec<String>,
}

/// `required_when` may gate on task type and/or any number of score
/// thresholds (`scope`, `novelty`, `risk`, `complexity`, `dependencies`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequiredWhen {
    #[serde(default)]
    pub task_type: Vec<String>,
    #[serde(flatten)]
    pub score_thresholds: HashMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRule {
    #[serde(default)]
    pub always: Option<bool>,
    #[serde(default)]
    pub required_when: RequiredWhen,
    #[serde(default)]
    pub skip_when: SkipWhen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    pub flat_max: u32,
    pub light_max: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { flat_max: 10, light_max: 25 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Weights {
    pub quality: f64,
    pub cost: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self { quality: 0.7, cost: 0.3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub min_success_rate: f64,
    pub max_threshold_change: u32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self { min_success_rate: 0.85, max_threshold_change: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    pub enabled: bool,
    pub min_samples: u32,
    pub interval_days: u32,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self { enabled: true, min_samples: 20, interval_days: 7 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { model: None, max_tokens: 150, temperature: 0.0 }
    }
}

/// Persisted Optimizer configuration, mirroring `data/optimizer/config.json`
/// in the reference implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub weights: Weights,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    /// Keyword list consulted by `infer_success`'s `has_negative_keywords`
    /// computation. Configuration, not inference logic.
    #[serde(default = "default_negative_keywords")]
    pub negative_keywords: Vec<String>,
}

fn default_negative_keywords() -> Vec<String> {
    vec![
        "sorry".into(),
        "unable to".into(),
        "cannot complete".into(),
        "申し訳".into(),
    ]
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            weights: Weights::default(),
            safety: SafetyConfig::default(),
            tuning: TuningConfig::default(),
            analysis: AnalysisConfig::default(),
            negative_keywords: default_negative_keywords(),
        }
    }
}

/// A usage/cost record tracked by the Cost Tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub session_id: Option<String>,
    pub agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}
