//! Workflow-level error types.

use super::NodeError;
use thiserror::Error;

/// Workflow-level errors.
///
/// Build-time variants (`GraphBuildError`, `DuplicateNode`, `UnknownNode`,
/// `CyclicDependency`, `FeedbackOutsideGroup`, `PredicateParse`,
/// `PredicateValidation`) are raised by graph construction and never at run
/// time. `AmbiguousBranch` and `Internal` indicate an engine or node
/// contract violation and always abort the run.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Graph build error: {0}")]
    GraphBuildError(String),
    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),
    #[error("Unknown node: {0}")]
    UnknownNode(String),
    #[error("Cyclic dependency outside any declared cycle group: {nodes:?}")]
    CyclicDependency { nodes: Vec<String> },
    #[error("Feedback connection '{source_node}' -> '{target}' targets a node outside cycle group '{group}'")]
    FeedbackOutsideGroup {
        group: String,
        source_node: String,
        target: String,
    },
    #[error("Convergence predicate parse error: {0}")]
    PredicateParse(String),
    #[error("Convergence predicate for group '{group}' references unknown field '{field}'")]
    PredicateValidation { group: String, field: String },
    #[error("Ambiguous branch decision from node '{node_id}'")]
    AmbiguousBranch { node_id: String },
    #[error("Unresolved input '{parameter}' for node '{node_id}'")]
    UnresolvedInput { node_id: String, parameter: String },
    #[error("Max steps exceeded: {0}")]
    MaxStepsExceeded(i32),
    #[error("Execution timeout")]
    ExecutionTimeout,
    #[error("Workflow aborted: {0}")]
    Aborted(String),
    #[error("Node execution error: node={node_id}, error={source}")]
    NodeExecution {
        node_id: String,
        #[source]
        source: NodeError,
    },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// True for errors that abort the entire run rather than just the
    /// failing unit and its dependents.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkflowError::AmbiguousBranch { .. }
                | WorkflowError::MaxStepsExceeded(_)
                | WorkflowError::ExecutionTimeout
                | WorkflowError::Aborted(_)
                | WorkflowError::Internal(_)
        )
    }
}
