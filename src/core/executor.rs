//! Node execution wrapper.
//!
//! Wraps a node's `execute` capability with input validation against its
//! declared parameters, output normalization, and an optional deadline.
//! Failure classification happens at the type level: anything a node
//! returns (or a timeout) is a [`NodeError`], recoverable through fallback
//! routing; scheduler invariant violations surface elsewhere as
//! [`WorkflowError`](crate::error::WorkflowError) and abort the run.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::NodeError;
use crate::nodes::{ExecutionScope, Node, NodeSignature};
use crate::resolver::OutputBundle;

/// Validate inputs, execute the node, normalize the result into an output
/// bundle.
pub(crate) async fn run_node(
    node: &dyn Node,
    node_id: &str,
    mut inputs: HashMap<String, Value>,
    scope: &mut ExecutionScope<'_>,
    timeout_secs: Option<u64>,
) -> Result<OutputBundle, NodeError> {
    apply_signature(node_id, &node.signature(), &mut inputs)?;

    let result = match timeout_secs {
        Some(secs) => {
            match tokio::time::timeout(Duration::from_secs(secs), node.execute(inputs, scope)).await
            {
                Ok(result) => result,
                Err(_) => Err(NodeError::Timeout),
            }
        }
        None => node.execute(inputs, scope).await,
    };

    result.map(|output| output.into_bundle())
}

/// Fill declared defaults and reject missing required parameters.
fn apply_signature(
    node_id: &str,
    signature: &NodeSignature,
    inputs: &mut HashMap<String, Value>,
) -> Result<(), NodeError> {
    for param in &signature.params {
        if inputs.contains_key(&param.name) {
            continue;
        }
        match (&param.default, param.required) {
            (Some(default), _) => {
                inputs.insert(param.name.clone(), default.clone());
            }
            (None, true) => {
                return Err(NodeError::MissingParameter {
                    node_id: node_id.to_string(),
                    parameter: param.name.clone(),
                });
            }
            (None, false) => {}
        }
    }
    Ok(())
}
