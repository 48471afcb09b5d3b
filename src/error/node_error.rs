use thiserror::Error;

/// Node-level errors.
///
/// These are failures of a single node's execution and are recoverable at
/// the workflow level: a fallback connection on the failing node reroutes
/// its inputs to an alternate node instead of aborting the run.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Missing required parameter '{parameter}' for node '{node_id}'")]
    MissingParameter { node_id: String, parameter: String },
    #[error("Execution error: {0}")]
    ExecutionError(String),
    #[error("Type error: {0}")]
    TypeError(String),
    #[error("Timeout: node execution exceeded time limit")]
    Timeout,
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl NodeError {
    /// Stable error-code string, carried into run reports.
    pub fn code(&self) -> &'static str {
        match self {
            NodeError::MissingParameter { .. } => "missing_parameter",
            NodeError::ExecutionError(_) => "execution_error",
            NodeError::TypeError(_) => "type_error",
            NodeError::Timeout => "timeout",
            NodeError::SerializationError(_) => "serialization_error",
        }
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::SerializationError(e.to_string())
    }
}
