use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant_with_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self { role: Role::Assistant, content: None, tool_calls, tool_call_id: None }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: Role::Tool, content: Some(content.into()), tool_calls: vec![], tool_call_id: Some(tool_call_id.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

impl ToolSpec {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            kind: "function".into(),
            function: FunctionDefinition { name: name.into(), description: description.into(), parameters },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

impl ChatCompletionRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into(), temperature: 0.7, ..Default::default() }
    }
    pub fn message(mut self, m: ChatMessage) -> Self {
        self.messages.push(m);
        self
    }
    pub fn system(self, content: impl Into<String>) -> Self {
        self.message(ChatMessage::system(content))
    }
    pub fn user(self, content: impl Into<String>) -> Self {
        self.message(ChatMessage::user(content))
    }
    pub fn temperature(mut self, t: f64) -> Self {
        self.temperature = t;
        self
    }
    pub fn max_tokens(mut self, t: u32) -> Self {
        self.max_tokens = Some(t);
        self
    }
    pub fn tool(mut self, t: ToolSpec) -> Self {
        self.tools.push(t);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub finish_reason: String,
}

impl ChatCompletionResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// One fragment of a streamed response. Providers stream tool-call argument
/// JSON in pieces, addressed by `tool_call_index`; the facade is responsible
/// for accumulating fragments sharing an index until a terminal chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamEvent {
    Content(String),
    Thinking(String),
    ToolCallDelta { index: usize, id: Option<String>, name: Option<String>, arguments_fragment: String },
    Usage(Usage),
    Done,
}

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("api error [{code}]: {message}")]
    ApiError { code: String, message: String },
    #[error("authentication failed")]
    AuthError,
    #[error("rate limited")]
    RateLimited,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("context length exceeded")]
    ContextLengthExceeded,
    #[error("content filtered")]
    ContentFiltered,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("timeout")]
    Timeout,
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("config error: {0}")]
    ConfigError(String),
    #[error("provider does not support this operation")]
    ProviderNotSupported,
    #[error("{0}")]
    Other(String),
}

impl LLMError {
    /// Transient errors may trigger failover to an alternative provider;
    /// everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, LLMError::RateLimited | LLMError::QuotaExceeded)
    }
}

pub type LLMResult<T> = Result<T, LLMError>;

/// Accumulates tool-call argument fragments addressed by stream index into
/// complete `ToolCall`s once a terminal chunk arrives.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    slots: Vec<Option<(String, String, String)>>, // (id, name, arguments)
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: usize, id: Option<String>, name: Option<String>, arguments_fragment: &str) {
        if self.slots.len() <= index {
            self.slots.resize(index + 1, None);
        }
        let slot = self.slots[index].get_or_insert_with(|| (String::new(), String::new(), String::new()));
        if let Some(id) = id {
            slot.0 = id;
        }
        if let Some(name) = name {
            slot.1 = name;
        }
        slot.2.push_str(arguments_fragment);
    }

    pub fn finish(self) -> Vec<ToolCall> {
        self.slots
            .into_iter()
            .flatten()
            .map(|(id, name, arguments)| ToolCall { id, function: FunctionCall { name, arguments } })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_merges_fragments_by_index() {
        let mut asm = ToolCallAssembler::new();
        asm.push(0, Some("call_1".into()), Some("read_file".into()), "{\"path\":");
        asm.push(0, None, None, "\"/x\"}");
        asm.push(1, Some("call_2".into()), Some("echo".into()), "{}");
        let calls = asm.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.arguments, "{\"path\":\"/x\"}");
        assert_eq!(calls[1].function.name, "echo");
    }
}
