pub mod context_compressor;
pub mod prompt;
pub mod runtime;

pub use context_compressor::{CompressionStrategy, ContextCompressor, SlidingWindowCompressor, SummarizingCompressor};
pub use prompt::{PromptComposer, COMMON_AGENT_RULES};
pub use runtime::{AgentRuntime, AgentRuntimeConfig, InterruptedRun};
