//! Strategies for keeping an agent turn's message list within its token
//! budget once the rolling conversation grows past it.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_kernel::OrchestrationError;

use crate::llm::provider::LLMProvider;
use crate::llm::types::{ChatCompletionRequest, ChatMessage, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionStrategy {
    SlidingWindow { window_size: usize },
    Summarize,
}

/// Shortens a message list so it fits within a token budget. The system
/// prompt is always preserved; recency is favoured over completeness.
#[async_trait]
pub trait ContextCompressor: Send + Sync {
    async fn compress(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: usize,
    ) -> Result<Vec<ChatMessage>, OrchestrationError>;

    fn count_tokens(&self, messages: &[ChatMessage]) -> usize {
        messages.iter().filter_map(|m| m.content.as_deref()).map(|c| c.len() / 4 + 1).sum()
    }

    fn strategy(&self) -> CompressionStrategy;

    fn name(&self) -> &str;
}

/// Keeps the system message(s) plus the most-recent `window_size` turns,
/// discarding everything older. Zero latency, loses old context entirely.
pub struct SlidingWindowCompressor {
    window_size: usize,
}

impl SlidingWindowCompressor {
    pub fn new(window_size: usize) -> Self {
        Self { window_size }
    }
}

#[async_trait]
impl ContextCompressor for SlidingWindowCompressor {
    async fn compress(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: usize,
    ) -> Result<Vec<ChatMessage>, OrchestrationError> {
        if self.count_tokens(&messages) <= max_tokens {
            return Ok(messages);
        }

        let (system_msgs, mut conversation): (Vec<_>, Vec<_>) =
            messages.into_iter().partition(|m| m.role == Role::System);

        if conversation.len() > self.window_size {
            let keep_from = conversation.len() - self.window_size;
            conversation = conversation.split_off(keep_from);
        }

        let mut result = system_msgs;
        result.extend(conversation);
        Ok(result)
    }

    fn strategy(&self) -> CompressionStrategy {
        CompressionStrategy::SlidingWindow { window_size: self.window_size }
    }

    fn name(&self) -> &str {
        "sliding_window"
    }
}

/// Asks the active LLM provider to summarise older turns into a single
/// assistant message, preserving the `keep_recent` most-recent turns as-is.
pub struct SummarizingCompressor {
    llm: Arc<dyn LLMProvider>,
    keep_recent: usize,
}

impl SummarizingCompressor {
    pub fn new(llm: Arc<dyn LLMProvider>) -> Self {
        Self { llm, keep_recent: 10 }
    }

    pub fn with_keep_recent(mut self, n: usize) -> Self {
        self.keep_recent = n;
        self
    }

    fn build_summary_prompt(messages: &[ChatMessage]) -> String {
        let history = messages
            .iter()
            .filter_map(|m| m.content.as_ref().map(|c| format!("{}: {}", m.role.as_str(), c)))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Summarise the following conversation concisely, preserving all important facts, decisions, and open todos. Write in third person.\n\n---\n{history}\n---"
        )
    }
}

#[async_trait]
impl ContextCompressor for SummarizingCompressor {
    async fn compress(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: usize,
    ) -> Result<Vec<ChatMessage>, OrchestrationError> {
        if self.count_tokens(&messages) <= max_tokens {
            return Ok(messages);
        }

        let (system_msgs, conversation): (Vec<_>, Vec<_>) =
            messages.into_iter().partition(|m| m.role == Role::System);

        if conversation.len() <= self.keep_recent {
            let mut result = system_msgs;
            result.extend(conversation);
            return Ok(result);
        }

        let split_at = conversation.len() - self.keep_recent;
        let (to_summarise, recent) = conversation.split_at(split_at);

        let prompt = Self::build_summary_prompt(to_summarise);
        let request = ChatCompletionRequest::new("gpt-4o-mini").user(prompt).temperature(0.3).max_tokens(512);

        let response = self
            .llm
            .chat(request)
            .await
            .map_err(|e| OrchestrationError::Provider(format!("summarisation failed: {e}")))?;

        let summary_text = response.content.as_deref().unwrap_or("[summary unavailable]").to_string();

        let summary_message = ChatMessage::assistant(format!("[Conversation summary]\n{summary_text}"));

        let mut result = system_msgs;
        result.push(summary_message);
        result.extend_from_slice(recent);
        Ok(result)
    }

    fn strategy(&self) -> CompressionStrategy {
        CompressionStrategy::Summarize
    }

    fn name(&self) -> &str {
        "summarizing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::deterministic::DeterministicProvider;

    fn long_conversation(n: usize) -> Vec<ChatMessage> {
        let mut msgs = vec![ChatMessage::system("You are a helpful assistant.")];
        for i in 0..n {
            msgs.push(ChatMessage::user(format!("Message {i}")));
            msgs.push(ChatMessage::assistant(format!("Response {i}")));
        }
        msgs
    }

    #[tokio::test]
    async fn sliding_window_trims_to_window_size() {
        let compressor = SlidingWindowCompressor::new(4);
        let msgs = long_conversation(5);
        assert_eq!(msgs.len(), 11);
        let result = compressor.compress(msgs, 1).await.unwrap();
        assert_eq!(result.len(), 5);
        assert_eq!(result[0].role, Role::System);
    }

    #[tokio::test]
    async fn sliding_window_preserves_system_prompt() {
        let compressor = SlidingWindowCompressor::new(2);
        let msgs = long_conversation(10);
        let result = compressor.compress(msgs, 1).await.unwrap();
        assert_eq!(result[0].role, Role::System);
    }

    #[tokio::test]
    async fn summarizing_injects_summary_message() {
        let llm = std::sync::Arc::new(DeterministicProvider::fixed("mock", "summary text"));
        let compressor = SummarizingCompressor::new(llm).with_keep_recent(2);
        let msgs = long_conversation(3);
        assert_eq!(msgs.len(), 7);
        let result = compressor.compress(msgs, 1).await.unwrap();
        assert_eq!(result.len(), 4);
        assert_eq!(result[0].role, Role::System);
        assert!(result[1].content.as_ref().unwrap().starts_with("[Conversation summary]"));
    }

    #[tokio::test]
    async fn summarizing_leaves_short_conversation_untouched_even_over_budget() {
        let llm = std::sync::Arc::new(DeterministicProvider::fixed("mock", "unused"));
        let compressor = SummarizingCompressor::new(llm).with_keep_recent(10);
        let long_content = "x".repeat(50_000);
        let msgs = vec![ChatMessage::system("sys"), ChatMessage::user(long_content)];
        let result = compressor.compress(msgs, 1).await.unwrap();
        assert_eq!(result.len(), 2);
    }
}
