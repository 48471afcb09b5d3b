//! Error types for the engine.

mod node_error;
mod workflow_error;

pub use node_error::NodeError;
pub use workflow_error::WorkflowError;

/// Result alias used throughout the engine.
pub type WorkflowResult<T> = Result<T, WorkflowError>;
