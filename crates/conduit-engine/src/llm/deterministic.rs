use async_trait::async_trait;
use parking_lot::Mutex;

use super::provider::LLMProvider;
use super::types::{ChatCompletionRequest, ChatCompletionResponse, LLMError, LLMResult, Usage};

/// A test double standing in for a real network provider: either returns a
/// fixed reply, replays a scripted queue of replies, or always fails with a
/// given error. Used throughout the engine's own test suite so the rest of
/// the orchestration machinery is exercised without real network calls.
pub struct DeterministicProvider {
    name: String,
    script: Mutex<Vec<ChatCompletionResponse>>,
    failure: Option<LLMError>,
}

impl DeterministicProvider {
    pub fn fixed(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::scripted(name, vec![content.into()])
    }

    pub fn scripted(name: impl Into<String>, replies: Vec<String>) -> Self {
        let script = replies
            .into_iter()
            .map(|content| ChatCompletionResponse {
                content: Some(content),
                tool_calls: vec![],
                usage: Usage { prompt_tokens: 10, completion_tokens: 10, total_tokens: 20 },
                finish_reason: "stop".into(),
            })
            .collect();
        Self { name: name.into(), script: Mutex::new(script), failure: None }
    }

    pub fn with_response(name: impl Into<String>, response: ChatCompletionResponse) -> Self {
        Self { name: name.into(), script: Mutex::new(vec![response]), failure: None }
    }

    /// Like [`Self::scripted`] but accepts full responses, so a test can mix
    /// tool-call turns with a final plain-text turn.
    pub fn sequence(name: impl Into<String>, responses: Vec<ChatCompletionResponse>) -> Self {
        Self { name: name.into(), script: Mutex::new(responses), failure: None }
    }

    pub fn failing(name: impl Into<String>, error: LLMError) -> Self {
        Self { name: name.into(), script: Mutex::new(vec![]), failure: Some(error) }
    }
}

fn clone_error(e: &LLMError) -> LLMError {
    match e {
        LLMError::RateLimited => LLMError::RateLimited,
        LLMError::QuotaExceeded => LLMError::QuotaExceeded,
        LLMError::AuthError => LLMError::AuthError,
        LLMError::Timeout => LLMError::Timeout,
        LLMError::ContentFiltered => LLMError::ContentFiltered,
        LLMError::ContextLengthExceeded => LLMError::ContextLengthExceeded,
        LLMError::ProviderNotSupported => LLMError::ProviderNotSupported,
        LLMError::ModelNotFound(s) => LLMError::ModelNotFound(s.clone()),
        LLMError::NetworkError(s) => LLMError::NetworkError(s.clone()),
        LLMError::SerializationError(s) => LLMError::SerializationError(s.clone()),
        LLMError::ConfigError(s) => LLMError::ConfigError(s.clone()),
        LLMError::ApiError { code, message } => LLMError::ApiError { code: code.clone(), message: message.clone() },
        LLMError::Other(s) => LLMError::Other(s.clone()),
    }
}

#[async_trait]
impl LLMProvider for DeterministicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, _request: ChatCompletionRequest) -> LLMResult<ChatCompletionResponse> {
        if let Some(err) = &self.failure {
            return Err(clone_error(err));
        }
        let mut script = self.script.lock();
        if script.len() > 1 {
            Ok(script.remove(0))
        } else {
            script.first().cloned().ok_or(LLMError::Other("script exhausted".into()))
        }
    }
}
