//! Ties the session store, Optimizer, and Agent Runtime together into the
//! engine's single public entry point: `process()`.

pub mod fanout;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use conduit_kernel::error::{OrchestrationError, OrchestrationResult};
use conduit_kernel::model::{AgentConfig, AgentExecutionMetrics, ExecutionMetrics, Message};
use conduit_kernel::traits::{SessionStore, SkillLoader};

use crate::agent::runtime::AgentRuntime;
use crate::cancellation::CancellationRegistry;
use crate::llm::provider::LLMProvider;
use crate::llm::types::{ChatCompletionRequest, ChatMessage};
use crate::optimizer::{AgentSelector, QualityTracker, TaskAnalyzer};
use crate::tools::budget::estimate_tokens;

use fanout::{scan_fanout_markers, substitute_blocks};

const SUB_SESSION_HISTORY_LIMIT: usize = 10;
const MAIN_SESSION_HISTORY_LIMIT: usize = 30;
const MAX_SKILLS_PER_DELEGATION: usize = 3;

const INLINE_EVAL_SYSTEM_PROMPT: &str = "You evaluate how well an assistant's response addressed a delegated task. Reply with JSON only.";

#[derive(Debug, Clone, Copy)]
struct InlineEvaluation {
    completion: f64,
    quality: f64,
    task_complexity: f64,
    prompt_specificity: f64,
}

impl Default for InlineEvaluation {
    fn default() -> Self {
        Self { completion: 0.5, quality: 0.5, task_complexity: 0.5, prompt_specificity: 0.5 }
    }
}

fn to_chat_message(message: &Message) -> ChatMessage {
    match message.role {
        conduit_kernel::model::Role::System => ChatMessage::system(message.content.clone()),
        conduit_kernel::model::Role::User => ChatMessage::user(message.content.clone()),
        conduit_kernel::model::Role::Assistant => ChatMessage::assistant(message.content.clone()),
        conduit_kernel::model::Role::Tool => ChatMessage::tool_result("unknown", message.content.clone()),
    }
}

fn clamp01(v: f64) -> f64 {
    if v.is_nan() {
        0.5
    } else {
        v.max(0.0).min(1.0)
    }
}

fn parse_inline_evaluation(raw: &str) -> InlineEvaluation {
    let Some(start) = raw.find('{') else { return InlineEvaluation::default() };
    let Some(end) = raw.rfind('}') else { return InlineEvaluation::default() };
    if end < start {
        return InlineEvaluation::default();
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw[start..=end]) else {
        return InlineEvaluation::default();
    };
    let get = |key: &str| clamp01(value.get(key).and_then(|v| v.as_f64()).unwrap_or(0.5));
    InlineEvaluation { completion: get("completion"), quality: get("quality"), task_complexity: get("task_complexity"), prompt_specificity: get("prompt_specificity") }
}

/// One delegated sub-call's outcome: the text to splice back into the
/// calling reply, plus the metrics row to attach to the parent request.
struct DelegationOutcome {
    text: String,
    metrics: AgentExecutionMetrics,
}

/// The result of running one agent turn through the shared cancellation
/// handling in [`Orchestrator::run_agent_turn`].
enum RunOutcome {
    Completed(String),
    Cancelled,
}

/// The engine's single coordination point: owns the roster of agent
/// personas, the shared runtime they all execute through, and the Optimizer
/// components that decide how deep a given request should run.
pub struct Orchestrator {
    sessions: Arc<dyn SessionStore>,
    runtime: Arc<AgentRuntime>,
    agents: HashMap<String, AgentConfig>,
    task_analyzer: TaskAnalyzer,
    agent_selector: AgentSelector,
    quality_tracker: Arc<QualityTracker>,
    skills: Option<Arc<dyn SkillLoader>>,
    eval_llm: Arc<dyn LLMProvider>,
    cancellation: Arc<CancellationRegistry>,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        runtime: Arc<AgentRuntime>,
        agents: HashMap<String, AgentConfig>,
        task_analyzer: TaskAnalyzer,
        agent_selector: AgentSelector,
        quality_tracker: Arc<QualityTracker>,
        eval_llm: Arc<dyn LLMProvider>,
        cancellation: Arc<CancellationRegistry>,
    ) -> Self {
        Self { sessions, runtime, agents, task_analyzer, agent_selector, quality_tracker, skills: None, eval_llm, cancellation }
    }

    pub fn with_skills(mut self, skills: Arc<dyn SkillLoader>) -> Self {
        self.skills = Some(skills);
        self
    }

    /// The engine's public entry point: ensures a session, scores and
    /// routes the request, runs (and if applicable, fans out) the agent
    /// work, and records the resulting metrics.
    pub async fn process(&self, session_id: Option<&str>, profile: &str, user_input: &str, working_dir: &str, job_id: &str) -> OrchestrationResult<String> {
        let session = match session_id {
            Some(id) => self.sessions.get_session(id).await?.ok_or_else(|| OrchestrationError::UserInput(format!("unknown session: {id}")))?,
            None => {
                let title: String = user_input.chars().take(60).collect();
                self.sessions.create_session(profile, &title).await?
            }
        };

        let workspace_preamble = format!("(workspace: {working_dir})\n\n{user_input}");

        let scores = self.task_analyzer.analyze(user_input).await;
        let available_agents: Vec<String> = self.agents.keys().cloned().collect();
        let selection = self.agent_selector.select(&scores, &available_agents);

        self.sessions.append_message(&session.id, conduit_kernel::model::Role::User, None, user_input).await?;

        let started = Instant::now();
        let mut delegation_metrics: Vec<AgentExecutionMetrics> = Vec::new();

        let final_text = if let Some((agent_name, task_text)) = parse_direct_mention(user_input, &self.agents) {
            let outcome = self.delegate(&agent_name, &task_text, &session.id, profile, job_id).await?;
            delegation_metrics.push(outcome.metrics);
            outcome.text
        } else {
            let guidance = format!(
                "## Optimizer guidance\ndepth: {}\nrecommended agents: {}\nskipped agents: {}\nreason: {}\n\n{}",
                selection.depth.as_str(),
                if selection.agents.is_empty() { "(none)".to_string() } else { selection.agents.join(", ") },
                if selection.skipped.is_empty() { "(none)".to_string() } else { selection.skipped.join(", ") },
                selection.reason,
                workspace_preamble,
            );

            let history = self.recent_history(&session.id).await?;
            let orchestrator_agent = self.orchestrator_agent()?;
            let reply = match self.run_agent_turn(orchestrator_agent, &guidance, history, None, None, job_id, &session.id, None).await? {
                RunOutcome::Completed(text) => text,
                RunOutcome::Cancelled => return Ok(format!("Job {job_id} was cancelled.")),
            };

            if self.cancellation.check(job_id).is_err() {
                self.sessions.append_message(&session.id, conduit_kernel::model::Role::Assistant, None, &format!("[interrupted: Cancelled] {reply}")).await?;
                return Ok(format!("Job {job_id} was cancelled."));
            }

            let known: Vec<&str> = self.agents.keys().filter(|name| name.as_str() != "orchestrator").map(|s| s.as_str()).collect();
            let blocks = scan_fanout_markers(&reply, &known);

            let reply = if blocks.is_empty() {
                reply
            } else {
                let outcomes = futures::future::join_all(blocks.iter().map(|block| async {
                    self.delegate(&block.agent_name, &block.task_text, &session.id, profile, job_id).await
                }))
                .await;

                let mut results = HashMap::new();
                for (index, outcome) in outcomes.into_iter().enumerate() {
                    match outcome {
                        Ok(o) => {
                            results.insert(index, o.text.clone());
                            delegation_metrics.push(o.metrics);
                        }
                        Err(e) => {
                            results.insert(index, format!("[delegation to {} failed: {e}]", blocks[index].agent_name));
                        }
                    }
                }
                substitute_blocks(&reply, &blocks, &results)
            };

            if delegation_metrics.is_empty() {
                reply
            } else {
                let summary_prompt = format!(
                    "The following sub-agent results were just produced for the user's request. Write a 3-5 line human-facing summary.\n\n{reply}"
                );
                match self.run_agent_turn(orchestrator_agent, &summary_prompt, vec![], None, None, job_id, &session.id, None).await? {
                    RunOutcome::Completed(summary) => format!("{reply}\n\n## まとめ\n{summary}"),
                    RunOutcome::Cancelled => return Ok(format!("Job {job_id} was cancelled.")),
                }
            }
        };

        self.sessions.append_message(&session.id, conduit_kernel::model::Role::Assistant, None, &final_text).await?;

        let optimizer_config = conduit_kernel::OptimizerConfig::default();
        let exec = ExecutionMetrics {
            tokens_in: estimate_tokens(user_input),
            tokens_out: estimate_tokens(&final_text),
            duration_ms: started.elapsed().as_millis() as u64,
            tool_calls: 0,
            errors: 0,
            retries: 0,
            has_apology: contains_apology(&final_text),
            exit_code: 0,
            has_negative_keywords: crate::optimizer::detect_negative_keywords(&final_text, &optimizer_config),
        };
        let thresholds = conduit_kernel::Thresholds::default();
        let metric_id = self.quality_tracker.record(scores, selection, exec, thresholds.flat_max, thresholds.light_max).await?;
        for metrics in delegation_metrics {
            self.quality_tracker.record_agent_execution(&metric_id, &metrics).await?;
        }

        Ok(final_text)
    }

    /// Runs one agent turn, converting a cancelled run into persisted
    /// partial text plus [`RunOutcome::Cancelled`] instead of letting the
    /// cancellation escape as an error, matching the propagation policy:
    /// any partial assistant text is always saved before the cancellation
    /// reaches the caller.
    #[allow(clippy::too_many_arguments)]
    async fn run_agent_turn(
        &self,
        agent: &AgentConfig,
        input: &str,
        history: Vec<ChatMessage>,
        session_context: Option<&str>,
        agent_stats: Option<&str>,
        job_id: &str,
        session_id: &str,
        agent_id: Option<&str>,
    ) -> OrchestrationResult<RunOutcome> {
        match self.runtime.run(agent, input, history, session_context, agent_stats, job_id, session_id).await {
            Ok(text) => Ok(RunOutcome::Completed(text)),
            Err(run) => match run.source {
                OrchestrationError::Cancelled(_) => {
                    if !run.partial_text.is_empty() {
                        let persisted = format!("[interrupted: Cancelled] {}", run.partial_text);
                        self.sessions.append_message(session_id, conduit_kernel::model::Role::Assistant, agent_id, &persisted).await?;
                    }
                    Ok(RunOutcome::Cancelled)
                }
                other => Err(OrchestrationError::Provider(other.to_string())),
            },
        }
    }

    fn orchestrator_agent(&self) -> OrchestrationResult<&AgentConfig> {
        self.agents.get("orchestrator").ok_or_else(|| OrchestrationError::Fatal("no \"orchestrator\" agent registered".into()))
    }

    async fn recent_history(&self, session_id: &str) -> OrchestrationResult<Vec<ChatMessage>> {
        let messages = self.sessions.list_recent_messages(session_id, MAIN_SESSION_HISTORY_LIMIT).await?;
        Ok(messages.iter().map(to_chat_message).collect())
    }

    /// Implements §4.6.1: resolves the unique sub-session for
    /// `(parent_session_id, agent_name)`, runs the delegate, records an
    /// inline four-axis evaluation, and returns the caller-facing text plus
    /// the metrics row to attach to the parent request.
    async fn delegate(&self, agent_name: &str, task_text: &str, parent_session_id: &str, profile: &str, job_id: &str) -> OrchestrationResult<DelegationOutcome> {
        let agent = self.agents.get(agent_name).ok_or_else(|| OrchestrationError::UserInput(format!("unknown agent: {agent_name}")))?;

        let sub_session = self.sessions.create_sub_session(parent_session_id, agent_name, profile).await?;
        let history = self.sessions.list_recent_messages(&sub_session.id, SUB_SESSION_HISTORY_LIMIT).await?;
        let chat_history: Vec<ChatMessage> = history.iter().map(to_chat_message).collect();

        self.sessions
            .append_message(&sub_session.id, conduit_kernel::model::Role::User, Some("orchestrator"), task_text)
            .await?;

        let skills_block = self.skills.as_ref().map(|loader| loader.matching(agent_name, task_text, MAX_SKILLS_PER_DELEGATION)).filter(|s| !s.is_empty()).map(|skills| skills.iter().map(|s| s.body.clone()).collect::<Vec<_>>().join("\n\n"));

        let started = Instant::now();
        let outcome = self.run_agent_turn(agent, task_text, chat_history, skills_block.as_deref(), None, job_id, &sub_session.id, Some(agent_name)).await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let response_text = match outcome {
            RunOutcome::Completed(text) => text,
            RunOutcome::Cancelled => return Err(OrchestrationError::Cancelled(format!("Job {job_id} was cancelled."))),
        };

        let eval = self.inline_evaluate(task_text, &response_text).await;

        self.sessions
            .append_message(&sub_session.id, conduit_kernel::model::Role::Assistant, Some(agent_name), &response_text)
            .await?;

        let summary_depth = self.sessions.get_summary(&sub_session.id).await?.map(|s| s.summary_depth).unwrap_or(0);

        let metrics = AgentExecutionMetrics {
            agent_name: agent_name.to_string(),
            parent_agent: Some("orchestrator".to_string()),
            tokens_in: estimate_tokens(task_text),
            tokens_out: estimate_tokens(&response_text),
            execution_time_ms: elapsed_ms,
            tool_calls: 0,
            inline_score: Some((eval.completion + eval.quality) / 2.0),
            eval_completion: Some(eval.completion),
            eval_quality: Some(eval.quality),
            eval_task_complexity: Some(eval.task_complexity),
            eval_prompt_specificity: Some(eval.prompt_specificity),
            summary_depth,
            history_turns: chat_history_len(&history),
            error_message: None,
        };

        let text = format!(
            "@{agent_name}: {response_text}\n---\n【サブエージェント評価】completion={:.2} quality={:.2} complexity={:.2} specificity={:.2}",
            eval.completion, eval.quality, eval.task_complexity, eval.prompt_specificity
        );

        Ok(DelegationOutcome { text, metrics })
    }

    async fn inline_evaluate(&self, task_text: &str, response_text: &str) -> InlineEvaluation {
        let prompt = format!(
            "Task given to the sub-agent:\n{task_text}\n\nSub-agent's response:\n{response_text}\n\nScore the response on these axes (each 0.0-1.0):\n- completion: did it address the whole task?\n- quality: how good is the work itself?\n- task_complexity: how complex was the underlying task?\n- prompt_specificity: how specific/unambiguous was the task description?\n\nReply with JSON only: {{\"completion\": X, \"quality\": X, \"task_complexity\": X, \"prompt_specificity\": X}}"
        );
        let request = ChatCompletionRequest::new("eval").system(INLINE_EVAL_SYSTEM_PROMPT).user(prompt).temperature(0.0).max_tokens(150);
        match self.eval_llm.chat(request).await {
            Ok(response) => parse_inline_evaluation(response.content.as_deref().unwrap_or("")),
            Err(_) => InlineEvaluation::default(),
        }
    }
}

fn chat_history_len(history: &[Message]) -> u32 {
    history.len() as u32
}

fn contains_apology(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["i'm sorry", "i am sorry", "apologi", "申し訳"].iter().any(|phrase| lower.contains(phrase))
}

/// Recognizes a leading `@name[: ]` mention addressed to a known agent,
/// returning `(agent_name, remaining_text)`.
fn parse_direct_mention(user_input: &str, agents: &HashMap<String, AgentConfig>) -> Option<(String, String)> {
    let trimmed = user_input.trim_start();
    if !trimmed.starts_with('@') {
        return None;
    }
    let rest = &trimmed[1..];
    let name_end = rest.find(|c: char| c.is_whitespace() || c == ':').unwrap_or(rest.len());
    let name = &rest[..name_end];
    if !agents.contains_key(name) || name == "orchestrator" {
        return None;
    }
    let remainder = rest[name_end..].trim_start_matches(':').trim_start();
    Some((name.to_string(), remainder.to_string()))
}
