pub mod registry;
pub mod tracker;
pub mod budget;
pub mod builtin;
pub mod dispatcher;

pub use budget::BudgetAccountant;
pub use dispatcher::{DispatchOutcome, ToolDispatcher};
pub use registry::{Tool, ToolDescriptor, ToolRegistry};
pub use tracker::ToolCallTracker;
