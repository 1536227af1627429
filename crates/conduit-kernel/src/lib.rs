#![allow(dead_code)]

//! Core data model, error taxonomy, and store/skill/memory contracts shared
//! across the orchestration engine.

pub mod error;
pub mod model;
pub mod traits;

pub use error::{OrchestrationError, OrchestrationResult};
pub use model::*;
pub use traits::{SemanticMemory, SessionStore, Skill, SkillLoader};
