use thiserror::Error;

/// Crate-wide error taxonomy. `ToolError`, `LoopDetected`, and `BudgetReached`
/// from the design notes are deliberately absent here: the dispatcher must
/// never let those escape as exceptions, so they are represented as ordinary
/// string tool-result payloads instead of enum variants.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("unknown agent or malformed command: {0}")]
    UserInput(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("operation cancelled for job_id={0}")]
    Cancelled(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("fatal initialisation error: {0}")]
    Fatal(String),
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;
