//! Per-run execution context.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{WorkflowError, WorkflowResult};
use crate::resolver::{resolve, OutputBundle, PathExpr};

/// Cooperative cancellation flag for a run.
///
/// Cloneable; flipping it halts the run before the next unit starts (and
/// before the next cycle iteration), never mid-node.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Run-scoped state: identity, last outputs per node, cycle iteration
/// counters and the cancellation flag.
///
/// Created per execution request, shared with spawned unit tasks, discarded
/// when the run finishes. Never shared across concurrent runs.
pub struct RunContext {
    run_id: String,
    last_outputs: RwLock<HashMap<String, OutputBundle>>,
    cycle_iterations: RwLock<HashMap<String, usize>>,
    cancel: CancelHandle,
    steps: AtomicI32,
    started: Instant,
}

impl RunContext {
    pub(crate) fn new(cancel: CancelHandle) -> Self {
        RunContext {
            run_id: uuid::Uuid::new_v4().to_string(),
            last_outputs: RwLock::new(HashMap::new()),
            cycle_iterations: RwLock::new(HashMap::new()),
            cancel,
            steps: AtomicI32::new(0),
            started: Instant::now(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record a node's output bundle. Single writer per key: no two units
    /// ever produce the same node's outputs.
    pub(crate) fn record_outputs(&self, node_id: &str, bundle: OutputBundle) {
        self.last_outputs
            .write()
            .insert(node_id.to_string(), bundle);
    }

    /// The last recorded bundle of `node_id`, cloned.
    pub fn output_of(&self, node_id: &str) -> Option<OutputBundle> {
        self.last_outputs.read().get(node_id).cloned()
    }

    /// Resolve `path` against `node_id`'s last outputs.
    pub(crate) fn resolve_from(&self, node_id: &str, path: &PathExpr) -> Option<Value> {
        let outputs = self.last_outputs.read();
        outputs.get(node_id).and_then(|b| resolve(b, path)).cloned()
    }

    /// Snapshot of all recorded outputs, for the final report.
    pub(crate) fn snapshot_outputs(&self) -> HashMap<String, OutputBundle> {
        self.last_outputs.read().clone()
    }

    pub(crate) fn set_cycle_iteration(&self, group_id: &str, iteration: usize) {
        self.cycle_iterations
            .write()
            .insert(group_id.to_string(), iteration);
    }

    /// Completed pass count of a cycle group, if it has started.
    pub fn cycle_iteration(&self, group_id: &str) -> Option<usize> {
        self.cycle_iterations.read().get(group_id).copied()
    }

    /// Count one node execution against the step ceiling.
    pub(crate) fn try_step(&self, max_steps: i32) -> WorkflowResult<()> {
        let step = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
        if step > max_steps {
            return Err(WorkflowError::MaxStepsExceeded(max_steps));
        }
        Ok(())
    }

    pub(crate) fn elapsed_exceeded(&self, max_secs: u64) -> bool {
        self.started.elapsed().as_secs() > max_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_and_resolve() {
        let ctx = RunContext::new(CancelHandle::new());
        let mut bundle = OutputBundle::new();
        bundle.insert("result".to_string(), json!({"count": 3}));
        ctx.record_outputs("reader", bundle);

        let path = PathExpr::parse("result.count").unwrap();
        assert_eq!(ctx.resolve_from("reader", &path), Some(json!(3)));
        assert_eq!(ctx.resolve_from("ghost", &path), None);
    }

    #[test]
    fn test_cancel_handle() {
        let cancel = CancelHandle::new();
        let ctx = RunContext::new(cancel.clone());
        assert!(!ctx.is_cancelled());
        cancel.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_step_ceiling() {
        let ctx = RunContext::new(CancelHandle::new());
        assert!(ctx.try_step(2).is_ok());
        assert!(ctx.try_step(2).is_ok());
        assert!(matches!(
            ctx.try_step(2),
            Err(WorkflowError::MaxStepsExceeded(2))
        ));
    }

    #[test]
    fn test_cycle_iteration_tracking() {
        let ctx = RunContext::new(CancelHandle::new());
        assert_eq!(ctx.cycle_iteration("refine"), None);
        ctx.set_cycle_iteration("refine", 4);
        assert_eq!(ctx.cycle_iteration("refine"), Some(4));
    }
}
