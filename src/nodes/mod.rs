//! The node capability contract.
//!
//! Domain nodes (readers, transformers, model callers, database adapters)
//! live outside the engine and are opaque to it beyond the [`Node`] trait:
//! an async `execute(inputs) -> outputs` plus optional declared parameter
//! metadata used for input validation. Nodes participating in cycle groups
//! may additionally implement [`CycleAware`] to observe iteration
//! boundaries; cross-iteration aggregates are held by the engine in a
//! per-group [`CycleState`] record and reached through [`ExecutionScope`],
//! so node values stay immutable and reusable across concurrent runs.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::NodeError;
use crate::resolver::OutputBundle;

/// Reserved output key carrying a routing decision.
///
/// A branch node writes its chosen tag here (a string, or a boolean mapped
/// to `"true"`/`"false"`); the router activates the matching tagged
/// connection.
pub const BRANCH_KEY: &str = "__branch";

/// One declared parameter of a node.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub required: bool,
    pub default: Option<Value>,
}

/// Declared parameter and output metadata for a node.
///
/// The default signature declares nothing: all inputs pass through
/// unvalidated and the output surface is unknown (convergence predicates
/// over such a node skip build-time field validation).
#[derive(Debug, Clone, Default)]
pub struct NodeSignature {
    pub params: Vec<ParamSpec>,
    pub outputs: Option<Vec<String>>,
}

impl NodeSignature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a required parameter with no default.
    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            required: true,
            default: None,
        });
        self
    }

    /// Declare an optional parameter with a default value.
    pub fn optional(mut self, name: impl Into<String>, default: Value) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            required: false,
            default: Some(default),
        });
        self
    }

    /// Declare the node's output field names.
    pub fn outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = Some(names.into_iter().map(Into::into).collect());
        self
    }
}

/// Result of one node execution.
///
/// A bare value is normalized by the engine to `{"result": value}` so
/// downstream dot-paths stay uniform.
#[derive(Debug, Clone)]
pub enum NodeOutput {
    Bundle(OutputBundle),
    Value(Value),
}

impl NodeOutput {
    /// A bare value, wrapped as `{"result": value}` on normalization.
    pub fn value(value: impl Into<Value>) -> Self {
        NodeOutput::Value(value.into())
    }

    /// An explicit output bundle.
    pub fn bundle<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        NodeOutput::Bundle(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// An empty bundle.
    pub fn empty() -> Self {
        NodeOutput::Bundle(OutputBundle::new())
    }

    /// Attach a routing decision, activating connections tagged `tag`.
    pub fn with_branch(self, tag: impl Into<String>) -> Self {
        let mut bundle = match self {
            NodeOutput::Bundle(b) => b,
            NodeOutput::Value(v) => {
                let mut b = OutputBundle::new();
                b.insert("result".to_string(), v);
                b
            }
        };
        bundle.insert(BRANCH_KEY.to_string(), Value::String(tag.into()));
        NodeOutput::Bundle(bundle)
    }

    /// Normalize into an output bundle.
    pub fn into_bundle(self) -> OutputBundle {
        match self {
            NodeOutput::Bundle(b) => b,
            NodeOutput::Value(v) => {
                let mut b = OutputBundle::new();
                b.insert("result".to_string(), v);
                b
            }
        }
    }
}

/// Per-group iteration record, owned by the cycle runner.
///
/// Holds the running aggregates cycle-aware nodes accumulate across passes
/// (score histories and the like), keyed by the accumulating field name.
#[derive(Debug)]
pub struct CycleState {
    group_id: String,
    iteration: usize,
    history: HashMap<String, Vec<Value>>,
}

impl CycleState {
    pub(crate) fn new(group_id: impl Into<String>) -> Self {
        CycleState {
            group_id: group_id.into(),
            iteration: 0,
            history: HashMap::new(),
        }
    }

    pub(crate) fn begin_iteration(&mut self, iteration: usize) {
        self.iteration = iteration;
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Append `value` under `key`, returning the accumulated history so the
    /// caller can expose it in its own outputs.
    pub fn accumulate(&mut self, key: &str, value: Value) -> &[Value] {
        let entry = self.history.entry(key.to_string()).or_default();
        entry.push(value);
        entry
    }

    /// Accumulated history under `key`, oldest first.
    pub fn history(&self, key: &str) -> &[Value] {
        self.history.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Execution-time context handed to a node.
///
/// Outside a cycle group the scope only identifies the run; inside, it
/// exposes the group's iteration index and accumulation record.
pub struct ExecutionScope<'a> {
    run_id: String,
    node_id: String,
    cycle: Option<&'a mut CycleState>,
}

impl<'a> ExecutionScope<'a> {
    pub(crate) fn plain(run_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        ExecutionScope {
            run_id: run_id.into(),
            node_id: node_id.into(),
            cycle: None,
        }
    }

    pub(crate) fn cyclic(
        run_id: impl Into<String>,
        node_id: impl Into<String>,
        cycle: &'a mut CycleState,
    ) -> Self {
        ExecutionScope {
            run_id: run_id.into(),
            node_id: node_id.into(),
            cycle: Some(cycle),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Current cycle iteration (0-based), if executing inside a group.
    pub fn iteration(&self) -> Option<usize> {
        self.cycle.as_ref().map(|c| c.iteration())
    }

    pub fn is_first_iteration(&self) -> bool {
        self.iteration() == Some(0)
    }

    /// Accumulate a value across iterations; returns the history including
    /// the new entry. Outside a cycle group the value is dropped and the
    /// history is empty.
    pub fn accumulate(&mut self, key: &str, value: Value) -> &[Value] {
        match self.cycle.as_mut() {
            Some(state) => state.accumulate(key, value),
            None => &[],
        }
    }

    /// Accumulated history under `key`, oldest first.
    pub fn history(&self, key: &str) -> &[Value] {
        match self.cycle.as_ref() {
            Some(state) => state.history(key),
            None => &[],
        }
    }
}

/// Optional extension for nodes that want to observe cycle iteration
/// boundaries.
pub trait CycleAware: Send + Sync {
    /// Called before the node's inputs are resolved on each pass.
    fn on_iteration_start(&self, scope: &mut ExecutionScope<'_>, iteration: usize, is_first: bool);
}

/// The node capability consumed by the engine.
#[async_trait]
pub trait Node: Send + Sync {
    /// Declared parameter/output metadata, used for input validation and
    /// build-time convergence predicate checks.
    fn signature(&self) -> NodeSignature {
        NodeSignature::default()
    }

    /// Execute with fully resolved inputs.
    async fn execute(
        &self,
        inputs: HashMap<String, Value>,
        scope: &mut ExecutionScope<'_>,
    ) -> Result<NodeOutput, NodeError>;

    /// Downcast to the cycle-aware extension, if implemented.
    fn as_cycle_aware(&self) -> Option<&dyn CycleAware> {
        None
    }
}

/// A node backed by a plain closure.
///
/// Handy for small transforms and for tests; the closure receives the
/// resolved inputs and returns a [`NodeOutput`].
pub struct FnNode<F> {
    func: F,
    signature: NodeSignature,
}

impl<F> FnNode<F>
where
    F: Fn(HashMap<String, Value>) -> Result<NodeOutput, NodeError> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        FnNode {
            func,
            signature: NodeSignature::default(),
        }
    }

    pub fn with_signature(mut self, signature: NodeSignature) -> Self {
        self.signature = signature;
        self
    }
}

#[async_trait]
impl<F> Node for FnNode<F>
where
    F: Fn(HashMap<String, Value>) -> Result<NodeOutput, NodeError> + Send + Sync,
{
    fn signature(&self) -> NodeSignature {
        self.signature.clone()
    }

    async fn execute(
        &self,
        inputs: HashMap<String, Value>,
        _scope: &mut ExecutionScope<'_>,
    ) -> Result<NodeOutput, NodeError> {
        (self.func)(inputs)
    }
}
