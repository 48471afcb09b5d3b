//! Conditional routing and fallback recovery.

use cycleflow::{
    execute, Connection, FnNode, Graph, Node, NodeError, NodeOutput, UnitStatus, WorkflowError,
};
use serde_json::{json, Value};
use std::collections::HashMap;

fn passthrough(key: &'static str) -> impl Node {
    FnNode::new(move |inputs| {
        Ok(NodeOutput::value(
            inputs.get(key).cloned().unwrap_or(Value::Null),
        ))
    })
}

#[tokio::test]
async fn branch_decision_routes_exactly_one_dependent() {
    let classifier = FnNode::new(|_| {
        Ok(NodeOutput::bundle([("case", json!("needs triage"))]).with_branch("urgent"))
    });

    let graph = Graph::builder()
        .add_node("classifier", classifier)
        .add_node("urgent_handler", passthrough("ticket"))
        .add_node("standard_handler", passthrough("ticket"))
        .connect(Connection::new("classifier", "case", "urgent_handler", "ticket").on_branch("urgent"))
        .connect(
            Connection::new("classifier", "case", "standard_handler", "ticket")
                .on_branch("standard"),
        )
        .build()
        .unwrap();

    let report = execute(&graph, HashMap::new()).await;
    assert!(report.succeeded());
    assert_eq!(report.status("urgent_handler"), Some(&UnitStatus::Succeeded));
    assert_eq!(report.status("standard_handler"), Some(&UnitStatus::Skipped));
    assert_eq!(
        report.output("urgent_handler").unwrap().get("result"),
        Some(&json!("needs triage"))
    );
    assert!(report.output("standard_handler").is_none());
}

#[tokio::test]
async fn missing_decision_starves_tagged_dependents() {
    // The classifier never emits a routing decision: zero tagged
    // connections fire and both dependents report unresolved inputs.
    let classifier = FnNode::new(|_| Ok(NodeOutput::bundle([("case", json!("x"))])));

    let graph = Graph::builder()
        .add_node("classifier", classifier)
        .add_node("a", passthrough("v"))
        .add_node("b", passthrough("v"))
        .connect(Connection::new("classifier", "case", "a", "v").on_branch("left"))
        .connect(Connection::new("classifier", "case", "b", "v").on_branch("right"))
        .build()
        .unwrap();

    let report = execute(&graph, HashMap::new()).await;
    assert!(!report.succeeded());
    assert!(matches!(report.status("a"), Some(UnitStatus::Failed { .. })));
    assert!(matches!(report.status("b"), Some(UnitStatus::Failed { .. })));
    assert!(matches!(
        report.error.as_ref().unwrap().error,
        WorkflowError::UnresolvedInput { .. }
    ));
}

#[tokio::test]
async fn invalid_decision_value_is_fatal() {
    // A non-scalar decision violates the routing contract outright.
    let broken = FnNode::new(|_| {
        Ok(NodeOutput::bundle([("__branch", json!(["urgent", "standard"]))]))
    });

    let graph = Graph::builder()
        .add_node("broken", broken)
        .add_node("a", passthrough("v"))
        .connect(Connection::new("broken", "case", "a", "v").on_branch("urgent"))
        .build()
        .unwrap();

    let report = execute(&graph, HashMap::new()).await;
    assert!(!report.succeeded());
    assert!(matches!(
        report.error.as_ref().unwrap().error,
        WorkflowError::AmbiguousBranch { ref node_id } if node_id == "broken"
    ));
    // The fatal error stops dispatch: the dependent never gets a status.
    assert_eq!(report.status("a"), None);
}

#[tokio::test]
async fn boolean_decision_selects_true_false_tags() {
    let gate = FnNode::new(|inputs| {
        let hot = inputs.get("reading").and_then(Value::as_f64).unwrap_or(0.0) > 0.5;
        Ok(NodeOutput::bundle([("reading", inputs.get("reading").cloned().unwrap_or(json!(0))) ])
            .with_branch(if hot { "true" } else { "false" }))
    });

    let graph = Graph::builder()
        .add_node("gate", gate)
        .add_node("hot", passthrough("r"))
        .add_node("cold", passthrough("r"))
        .connect(Connection::new("input", "reading", "gate", "reading"))
        .connect(Connection::new("gate", "reading", "hot", "r").on_branch("true"))
        .connect(Connection::new("gate", "reading", "cold", "r").on_branch("false"))
        .build()
        .unwrap();

    let report = execute(&graph, HashMap::from([("reading".to_string(), json!(0.9))])).await;
    assert!(report.succeeded());
    assert_eq!(report.status("hot"), Some(&UnitStatus::Succeeded));
    assert_eq!(report.status("cold"), Some(&UnitStatus::Skipped));
}

#[tokio::test]
async fn fallback_connection_recovers_node_failure() {
    let primary = FnNode::new(|_| -> Result<NodeOutput, NodeError> {
        Err(NodeError::ExecutionError("upstream 503".into()))
    });
    // The alternate receives the failed node's resolved inputs.
    let backup = passthrough("payload");
    let sink = passthrough("v");

    let graph = Graph::builder()
        .add_node("primary", primary)
        .add_node("backup", backup)
        .add_node("sink", sink)
        .connect(Connection::new("input", "payload", "primary", "payload"))
        .connect(Connection::new("primary", "result", "sink", "v"))
        .connect(Connection::fallback("primary", "backup"))
        .build()
        .unwrap();

    let report = execute(
        &graph,
        HashMap::from([("payload".to_string(), json!("order-17"))]),
    )
    .await;

    // Recovered: the run is not failed, though the primary is.
    assert!(report.succeeded());
    assert!(matches!(report.status("primary"), Some(UnitStatus::Failed { .. })));
    assert_eq!(report.status("backup"), Some(&UnitStatus::Succeeded));
    assert_eq!(
        report.output("backup").unwrap().get("result"),
        Some(&json!("order-17"))
    );
    // The primary's ordinary dependent is still starved.
    assert_eq!(report.status("sink"), Some(&UnitStatus::Skipped));
}

#[tokio::test]
async fn fallback_stays_idle_on_success() {
    let primary = FnNode::new(|_| Ok(NodeOutput::value(json!("fine"))));
    let graph = Graph::builder()
        .add_node("primary", primary)
        .add_node("backup", passthrough("x"))
        .connect(Connection::fallback("primary", "backup"))
        .build()
        .unwrap();

    let report = execute(&graph, HashMap::new()).await;
    assert!(report.succeeded());
    assert_eq!(report.status("backup"), Some(&UnitStatus::Skipped));
}
