pub mod types;
pub mod provider;
pub mod deterministic;

pub use provider::{LLMProvider, LLMRegistry};
pub use types::*;
