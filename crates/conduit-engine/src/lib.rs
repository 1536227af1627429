//! Multi-agent orchestration engine: session store, tool dispatch, LLM
//! facade, agent runtime, Optimizer, orchestrator, scheduler, and cost
//! tracking built on top of the `conduit-kernel` data model and traits.

pub mod agent;
pub mod cancellation;
pub mod cost_tracker;
pub mod llm;
pub mod optimizer;
pub mod orchestrator;
pub mod persistence;
pub mod scheduler;
pub mod tools;

pub use agent::{AgentRuntime, AgentRuntimeConfig, InterruptedRun};
pub use cancellation::{CancellationRegistry, OperationCancelled};
pub use cost_tracker::{CostTracker, ModelPricing, PricingRegistry};
pub use orchestrator::Orchestrator;
pub use persistence::{SqliteMetricsStore, SqliteScheduleStore, SqliteSessionStore};
pub use scheduler::Scheduler;
