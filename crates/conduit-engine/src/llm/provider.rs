use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::types::{ChatCompletionRequest, ChatCompletionResponse, LLMError, LLMResult, StreamEvent};

pub type ChatStream = mpsc::Receiver<StreamEvent>;

/// Uniform chat-completion + streaming + embedding interface over multiple
/// backends. Concrete network clients are an external collaborator; this
/// crate ships the trait, the registry, and deterministic test doubles.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    fn name(&self) -> &str;

    fn supports_streaming(&self) -> bool {
        true
    }
    fn supports_tools(&self) -> bool {
        true
    }
    fn supports_embedding(&self) -> bool {
        false
    }

    async fn chat(&self, request: ChatCompletionRequest) -> LLMResult<ChatCompletionResponse>;

    async fn chat_stream(&self, _request: ChatCompletionRequest) -> LLMResult<ChatStream> {
        Err(LLMError::ProviderNotSupported)
    }

    async fn embed(&self, _text: &str) -> LLMResult<Vec<f32>> {
        Err(LLMError::ProviderNotSupported)
    }
}

/// Registry of named providers plus a priority-ordered failover list used
/// when a call returns a transient [`LLMError`].
#[derive(Default)]
pub struct LLMRegistry {
    providers: RwLock<HashMap<String, Arc<dyn LLMProvider>>>,
    priority: RwLock<Vec<String>>,
}

impl LLMRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn LLMProvider>) {
        let name = name.into();
        self.priority.write().push(name.clone());
        self.providers.write().insert(name, provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LLMProvider>> {
        self.providers.read().get(name).cloned()
    }

    pub fn priority_order(&self) -> Vec<String> {
        self.priority.read().clone()
    }

    /// Calls the named provider; on a transient error, tries the remaining
    /// providers in registration order before surfacing the last error.
    pub async fn chat_with_failover(&self, preferred: &str, request: ChatCompletionRequest) -> LLMResult<ChatCompletionResponse> {
        let order = self.priority_order();
        let mut candidates: Vec<String> = std::iter::once(preferred.to_string())
            .chain(order.into_iter().filter(|n| n != preferred))
            .collect();
        candidates.dedup();

        let mut last_err = LLMError::Other("no providers registered".into());
        for name in candidates {
            let Some(provider) = self.get(&name) else { continue };
            match provider.chat(request.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() => {
                    last_err = e;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }
}

static GLOBAL_REGISTRY: OnceLock<LLMRegistry> = OnceLock::new();

pub fn global_registry() -> &'static LLMRegistry {
    GLOBAL_REGISTRY.get_or_init(LLMRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::deterministic::DeterministicProvider;

    #[tokio::test]
    async fn failover_skips_rate_limited_provider() {
        let registry = LLMRegistry::new();
        let flaky = DeterministicProvider::failing("flaky", LLMError::RateLimited);
        let backup = DeterministicProvider::fixed("backup", "ok from backup");
        registry.register("flaky", Arc::new(flaky));
        registry.register("backup", Arc::new(backup));

        let resp = registry
            .chat_with_failover("flaky", ChatCompletionRequest::new("m").user("hi"))
            .await
            .unwrap();
        assert_eq!(resp.content.as_deref(), Some("ok from backup"));
    }

    #[tokio::test]
    async fn non_transient_error_surfaces_immediately() {
        let registry = LLMRegistry::new();
        let broken = DeterministicProvider::failing("broken", LLMError::AuthError);
        let backup = DeterministicProvider::fixed("backup", "should not be used");
        registry.register("broken", Arc::new(broken));
        registry.register("backup", Arc::new(backup));

        let err = registry
            .chat_with_failover("broken", ChatCompletionRequest::new("m").user("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, LLMError::AuthError));
    }
}
