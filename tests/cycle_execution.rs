//! End-to-end cycle group execution.

use async_trait::async_trait;
use cycleflow::{
    execute, Connection, CycleAware, Dispatcher, EngineConfig, ExecutionScope, FnNode, Graph,
    Node, NodeError, NodeOutput, NodeSignature, UnitStatus,
};
use serde_json::{json, Value};
use std::collections::HashMap;

fn counter() -> impl Node {
    FnNode::new(|inputs| {
        let count = inputs.get("count").and_then(Value::as_i64).unwrap_or(0);
        Ok(NodeOutput::bundle([("count", json!(count + 1))]))
    })
    .with_signature(
        NodeSignature::new()
            .optional("count", json!(0))
            .outputs(["count"]),
    )
}

fn self_loop_graph(convergence: &str, max_iterations: usize) -> Graph {
    Graph::builder()
        .add_node("counter", counter())
        .create_cycle("refine", ["counter"])
        .max_iterations(max_iterations)
        .converge_when(convergence)
        .feedback("counter", "count", "counter", "count")
        .finish()
        .build()
        .unwrap()
}

#[tokio::test]
async fn converging_self_loop_stops_at_predicate() {
    // Single self-looping node incrementing count from 0, ceiling 10,
    // convergence at count >= 5: exactly five passes.
    let graph = self_loop_graph("count >= 5", 10);
    let report = execute(&graph, HashMap::new()).await;

    assert!(report.succeeded());
    assert_eq!(
        report.status("refine"),
        Some(&UnitStatus::Converged { iterations: 5 })
    );
    assert_eq!(report.output("counter").unwrap().get("count"), Some(&json!(5)));
}

#[tokio::test]
async fn unreachable_predicate_exhausts_ceiling() {
    let graph = self_loop_graph("count >= 50", 10);
    let report = execute(&graph, HashMap::new()).await;

    // Hitting the ceiling is a normal completion reason, not an error.
    assert!(report.succeeded());
    assert_eq!(
        report.status("refine"),
        Some(&UnitStatus::Exhausted { iterations: 10 })
    );
    assert_eq!(
        report.output("counter").unwrap().get("count"),
        Some(&json!(10))
    );
}

#[tokio::test]
async fn always_false_predicate_is_still_bounded() {
    let graph = self_loop_graph("count < 0", 4);
    let report = execute(&graph, HashMap::new()).await;
    assert_eq!(
        report.status("refine"),
        Some(&UnitStatus::Exhausted { iterations: 4 })
    );
}

#[tokio::test]
async fn feedback_values_lag_one_iteration() {
    let adder = FnNode::new(|inputs| {
        let doubled = inputs.get("doubled").and_then(Value::as_i64).unwrap_or(1);
        Ok(NodeOutput::bundle([("sum", json!(doubled))]))
    })
    .with_signature(NodeSignature::new().outputs(["sum"]));
    let doubler = FnNode::new(|inputs| {
        let sum = inputs.get("sum").and_then(Value::as_i64).unwrap_or(0);
        Ok(NodeOutput::bundle([("doubled", json!(sum * 2))]))
    })
    .with_signature(NodeSignature::new().outputs(["doubled"]));
    let sink = FnNode::new(|inputs| {
        Ok(NodeOutput::value(inputs.get("value").cloned().unwrap_or(Value::Null)))
    });

    let graph = Graph::builder()
        .add_node("adder", adder)
        .add_node("doubler", doubler)
        .add_node("sink", sink)
        .connect(Connection::new("adder", "sum", "doubler", "sum"))
        .connect(Connection::new("doubler", "doubled", "sink", "value"))
        .create_cycle("loop", ["adder", "doubler"])
        .max_iterations(3)
        .feedback("doubler", "doubled", "adder", "doubled")
        .finish()
        .build()
        .unwrap();

    let report = execute(&graph, HashMap::new()).await;
    assert!(report.succeeded());
    // Pass 0: 1 -> 2; pass 1: 2 -> 4; pass 2: 4 -> 8. The sink sees the
    // group's terminal snapshot.
    assert_eq!(report.output("sink").unwrap().get("result"), Some(&json!(8)));
    assert_eq!(report.status("sink"), Some(&UnitStatus::Succeeded));
}

#[tokio::test]
async fn tagged_exit_connection_ends_loop_early() {
    let stepper = FnNode::new(|inputs| {
        let count = inputs.get("count").and_then(Value::as_i64).unwrap_or(0) + 1;
        let output = NodeOutput::bundle([("count", json!(count))]);
        if count >= 3 {
            Ok(output.with_branch("done"))
        } else {
            Ok(output)
        }
    })
    .with_signature(NodeSignature::new().outputs(["count"]));
    let sink = FnNode::new(|inputs| {
        Ok(NodeOutput::value(inputs.get("total").cloned().unwrap_or(Value::Null)))
    });

    let graph = Graph::builder()
        .add_node("stepper", stepper)
        .add_node("sink", sink)
        .connect(Connection::new("stepper", "count", "sink", "total").on_branch("done"))
        .create_cycle("loop", ["stepper"])
        .max_iterations(10)
        .converge_when("count >= 100")
        .feedback("stepper", "count", "stepper", "count")
        .finish()
        .build()
        .unwrap();

    let report = execute(&graph, HashMap::new()).await;
    assert!(report.succeeded());
    // The branch decision, not the numeric predicate, terminated the loop.
    assert_eq!(
        report.status("loop"),
        Some(&UnitStatus::Converged { iterations: 3 })
    );
    assert_eq!(report.output("sink").unwrap().get("result"), Some(&json!(3)));
}

struct Scorer;

#[async_trait]
impl Node for Scorer {
    fn signature(&self) -> NodeSignature {
        NodeSignature::new().outputs(["score", "samples"])
    }

    async fn execute(
        &self,
        _inputs: HashMap<String, Value>,
        scope: &mut ExecutionScope<'_>,
    ) -> Result<NodeOutput, NodeError> {
        let pass = scope.iteration().unwrap_or(0) as f64;
        let score = 0.25 * (pass + 1.0);
        let samples = scope.accumulate("scores", json!(score)).len();
        Ok(NodeOutput::bundle([
            ("score", json!(score)),
            ("samples", json!(samples)),
        ]))
    }

    fn as_cycle_aware(&self) -> Option<&dyn CycleAware> {
        Some(self)
    }
}

impl CycleAware for Scorer {
    fn on_iteration_start(
        &self,
        _scope: &mut ExecutionScope<'_>,
        _iteration: usize,
        _is_first: bool,
    ) {
    }
}

#[tokio::test]
async fn cycle_aware_node_accumulates_history() {
    let graph = Graph::builder()
        .add_node("scorer", Scorer)
        .create_cycle("tune", ["scorer"])
        .max_iterations(10)
        .converge_when("score >= 0.75")
        .finish()
        .build()
        .unwrap();

    let report = execute(&graph, HashMap::new()).await;
    assert!(report.succeeded());
    assert_eq!(
        report.status("tune"),
        Some(&UnitStatus::Converged { iterations: 3 })
    );
    // One accumulated sample per pass, carried by the engine, not the node.
    assert_eq!(report.output("scorer").unwrap().get("samples"), Some(&json!(3)));
}

#[tokio::test]
async fn member_failure_fails_group_and_starves_dependents() {
    let flaky = FnNode::new(|inputs| {
        let count = inputs.get("count").and_then(Value::as_i64).unwrap_or(0);
        if count >= 2 {
            return Err(NodeError::ExecutionError("model unavailable".into()));
        }
        Ok(NodeOutput::bundle([("count", json!(count + 1))]))
    });
    let sink = FnNode::new(|inputs| {
        Ok(NodeOutput::value(inputs.get("v").cloned().unwrap_or(Value::Null)))
    });

    let graph = Graph::builder()
        .add_node("flaky", flaky)
        .add_node("sink", sink)
        .connect(Connection::new("flaky", "count", "sink", "v"))
        .create_cycle("loop", ["flaky"])
        .max_iterations(10)
        .feedback("flaky", "count", "flaky", "count")
        .finish()
        .build()
        .unwrap();

    let report = Dispatcher::new(EngineConfig::default())
        .run(&graph, HashMap::new())
        .await;

    assert!(!report.succeeded());
    assert!(matches!(report.status("loop"), Some(UnitStatus::Failed { .. })));
    assert_eq!(report.status("sink"), Some(&UnitStatus::Skipped));
    // No partial-iteration outputs are published for a failed group.
    assert!(report.output("flaky").is_none());
}

#[tokio::test]
async fn entry_connection_seeds_cycle_from_upstream_node() {
    let seed = FnNode::new(|_| Ok(NodeOutput::bundle([("start", json!(3))])));

    let graph = Graph::builder()
        .add_node("seed", seed)
        .add_node("counter", counter())
        .connect(Connection::new("seed", "start", "counter", "count"))
        .create_cycle("refine", ["counter"])
        .max_iterations(10)
        .converge_when("count >= 5")
        .feedback("counter", "count", "counter", "count")
        .finish()
        .build()
        .unwrap();

    let report = execute(&graph, HashMap::new()).await;
    assert!(report.succeeded());
    // Seeded at 3: two passes reach 5.
    assert_eq!(
        report.status("refine"),
        Some(&UnitStatus::Converged { iterations: 2 })
    );
}
