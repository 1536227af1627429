//! Single-agent turn loop: prompt composition, tool dispatch, and context
//! compaction, independent of how the caller decided which agent to run.

use std::sync::Arc;

use conduit_kernel::{AgentConfig, OrchestrationError};

use conduit_kernel::traits::SessionStore;

use crate::cancellation::CancellationRegistry;
use crate::cost_tracker::CostTracker;
use crate::llm::provider::LLMProvider;
use crate::llm::types::{ChatCompletionRequest, ChatMessage, ToolSpec};
use crate::tools::{BudgetAccountant, ToolCallTracker, ToolDispatcher};

use super::context_compressor::{CompressionStrategy, ContextCompressor};
use super::prompt::PromptComposer;

#[derive(Debug, Clone, Copy)]
pub struct AgentRuntimeConfig {
    pub max_iterations: usize,
    pub run_budget_tokens: u64,
    pub preserve_recent: usize,
    pub semantic_recall_top_k: usize,
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self { max_iterations: 25, run_budget_tokens: crate::tools::budget::DEFAULT_BUDGET, preserve_recent: 10, semantic_recall_top_k: 5 }
    }
}

/// A run that ended in an error still carries whatever assistant text had
/// accumulated before the failure, so the caller can persist it.
#[derive(Debug)]
pub struct InterruptedRun {
    pub partial_text: String,
    pub source: OrchestrationError,
}

impl std::fmt::Display for InterruptedRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "agent run interrupted: {}", self.source)
    }
}

impl std::error::Error for InterruptedRun {}

pub struct AgentRuntime {
    llm: Arc<dyn LLMProvider>,
    dispatcher: ToolDispatcher,
    tool_specs: Vec<ToolSpec>,
    compressor: Arc<dyn ContextCompressor>,
    semantic_memory: Option<Arc<dyn conduit_kernel::traits::SemanticMemory>>,
    cancellation: Arc<CancellationRegistry>,
    config: AgentRuntimeConfig,
    cost_tracker: Option<Arc<CostTracker>>,
    sessions: Option<Arc<dyn SessionStore>>,
}

impl AgentRuntime {
    pub fn new(
        llm: Arc<dyn LLMProvider>,
        dispatcher: ToolDispatcher,
        tool_specs: Vec<ToolSpec>,
        compressor: Arc<dyn ContextCompressor>,
        cancellation: Arc<CancellationRegistry>,
    ) -> Self {
        Self { llm, dispatcher, tool_specs, compressor, semantic_memory: None, cancellation, config: AgentRuntimeConfig::default(), cost_tracker: None, sessions: None }
    }

    /// Lets the runtime persist a rolling summary when a compaction pass
    /// produces one, instead of only folding it into the in-memory message
    /// list for the rest of this run.
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_semantic_memory(mut self, memory: Arc<dyn conduit_kernel::traits::SemanticMemory>) -> Self {
        self.semantic_memory = Some(memory);
        self
    }

    pub fn with_config(mut self, config: AgentRuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cost_tracker(mut self, cost_tracker: Arc<CostTracker>) -> Self {
        self.cost_tracker = Some(cost_tracker);
        self
    }

    /// Runs one agent turn: system prompt composition, the LLM/tool-call
    /// loop, and context compaction when the run's token budget fills up.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        agent: &AgentConfig,
        user_input: &str,
        history: Vec<ChatMessage>,
        session_context: Option<&str>,
        agent_stats: Option<&str>,
        job_id: &str,
        session_id: &str,
    ) -> Result<String, InterruptedRun> {
        let mut tracker = ToolCallTracker::default();
        let mut budget = BudgetAccountant::new(self.config.run_budget_tokens);

        let recalled = match &self.semantic_memory {
            Some(memory) => memory.search(user_input, self.config.semantic_recall_top_k).await.unwrap_or_default(),
            None => Vec::new(),
        };

        let mut composer = PromptComposer::new().with_recalled_snippets(recalled);
        if let Some(ctx) = session_context {
            composer = composer.with_session_context(ctx);
        }
        if let Some(stats) = agent_stats {
            composer = composer.with_agent_stats(stats);
        }
        let system_prompt = composer.compose(&agent.system_prompt);

        let mut messages = vec![ChatMessage::system(system_prompt)];
        messages.extend(history);
        messages.push(ChatMessage::user(user_input.to_string()));

        let mut accumulated_text = String::new();

        for _ in 0..self.config.max_iterations {
            if let Err(e) = self.cancellation.check(job_id) {
                return Err(InterruptedRun { partial_text: accumulated_text, source: OrchestrationError::Cancelled(e.0) });
            }

            let mut request = ChatCompletionRequest::new("agent").temperature(0.7);
            request.messages = messages.clone();
            request.tools = self.tool_specs.clone();

            let response = match self.llm.chat(request).await {
                Ok(r) => r,
                Err(e) => return Err(InterruptedRun { partial_text: accumulated_text, source: OrchestrationError::Provider(e.to_string()) }),
            };

            budget.record(response.content.as_deref().unwrap_or(""));

            if let Some(tracker) = &self.cost_tracker {
                tracker.record(
                    self.llm.name(),
                    self.llm.name(),
                    response.usage.prompt_tokens,
                    response.usage.completion_tokens,
                    Some(job_id.to_string()),
                    Some(agent.name.clone()),
                    chrono::Utc::now(),
                );
            }

            if !response.has_tool_calls() {
                accumulated_text = response.content.unwrap_or_default();
                return Ok(accumulated_text);
            }

            messages.push(ChatMessage { role: crate::llm::types::Role::Assistant, content: response.content.clone(), tool_calls: response.tool_calls.clone(), tool_call_id: None });
            if let Some(text) = &response.content {
                accumulated_text = text.clone();
            }

            for tool_call in &response.tool_calls {
                let args: serde_json::Value = serde_json::from_str(&tool_call.function.arguments).unwrap_or(serde_json::Value::Null);

                let outcome = match self.dispatcher.dispatch(&tool_call.function.name, args, &mut tracker, &mut budget, &self.cancellation, job_id).await {
                    Ok(o) => o,
                    Err(e) => return Err(InterruptedRun { partial_text: accumulated_text, source: OrchestrationError::Cancelled(e.0) }),
                };

                messages.push(ChatMessage::tool_result(tool_call.id.clone(), outcome.text));

                if outcome.blocked {
                    break;
                }
            }

            if budget.utilisation() >= 0.8 {
                match self.compressor.compress(messages.clone(), (self.config.run_budget_tokens as f64 * 0.5) as usize).await {
                    Ok(compressed) => {
                        if self.compressor.strategy() == CompressionStrategy::Summarize {
                            if let Some(sessions) = &self.sessions {
                                if let Some(summary) = compressed.iter().find_map(|m| {
                                    m.content.as_deref().filter(|c| c.starts_with("[Conversation summary]"))
                                }) {
                                    let _ = sessions.save_summary(session_id, summary, chrono::Utc::now()).await;
                                }
                            }
                        }
                        let new_estimate = self.compressor.count_tokens(&compressed) as u64;
                        messages = compressed;
                        budget.reset_to(new_estimate);
                    }
                    Err(_) => { /* fall through with an untrimmed but still-usable message list */ }
                }
            }
        }

        Ok(format!("{accumulated_text}\n\n[agent stopped after reaching the iteration limit]"))
    }
}
