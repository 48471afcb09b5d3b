//! # Cycleflow — a workflow engine with bounded cyclic scheduling
//!
//! `cycleflow` executes directed workflow graphs in which a declared subset
//! of nodes — a **cycle group** — may feed its own prior outputs back into
//! itself across iterations, while the rest of the graph stays strictly
//! acyclic. It provides:
//!
//! - **Graph model**: an immutable [`Graph`] built through a chaining
//!   [`GraphBuilder`]; nodes, dot-path connections, branch tags, fallback
//!   connections and cycle groups, all validated at build time.
//! - **Bounded cycles**: per-group `max_iterations` ceilings, convergence
//!   predicates (`"score >= 0.95"`) evaluated on the latest output
//!   snapshot, feedback connections with strict one-iteration visibility,
//!   and early exit through branch-tagged connections.
//! - **Conditional routing**: mutually exclusive branch activation from a
//!   node's routing decision, with skip propagation to starved dependents.
//! - **Failure recovery**: node failures reroute through declared fallback
//!   connections; everything else is reported per unit (`succeeded`,
//!   `skipped`, `failed`, `converged`, `exhausted`).
//! - **Optional parallelism**: independent branches of the contracted
//!   graph may dispatch onto a worker pool; a run is sequential by default.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use cycleflow::{Dispatcher, EngineConfig, FnNode, Graph, NodeOutput, NodeSignature};
//! use serde_json::json;
//! use std::collections::HashMap;
//!
//! #[tokio::main]
//! async fn main() {
//!     let counter = FnNode::new(|inputs| {
//!         let count = inputs.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
//!         Ok(NodeOutput::bundle([("count", json!(count + 1))]))
//!     })
//!     .with_signature(
//!         NodeSignature::new()
//!             .optional("count", json!(0))
//!             .outputs(["count"]),
//!     );
//!
//!     let graph = Graph::builder()
//!         .add_node("counter", counter)
//!         .create_cycle("refine", ["counter"])
//!         .max_iterations(10)
//!         .converge_when("count >= 5")
//!         .feedback("counter", "count", "counter", "count")
//!         .finish()
//!         .build()
//!         .unwrap();
//!
//!     let report = Dispatcher::new(EngineConfig::default())
//!         .run(&graph, HashMap::new())
//!         .await;
//!     println!("{:?}", report.status("refine"));
//! }
//! ```

pub mod core;
pub mod error;
pub mod evaluator;
pub mod graph;
pub mod nodes;
pub mod resolver;

pub use crate::core::{
    CancelHandle, Dispatcher, EngineConfig, RunContext, RunError, RunReport, UnitStatus,
};
pub use crate::error::{NodeError, WorkflowError, WorkflowResult};
pub use crate::graph::{
    Connection, ConnectionTag, CycleGroupBuilder, Graph, GraphBuilder, INPUT_SOURCE,
};
pub use crate::nodes::{
    CycleAware, CycleState, ExecutionScope, FnNode, Node, NodeOutput, NodeSignature, ParamSpec,
    BRANCH_KEY,
};
pub use crate::resolver::{OutputBundle, PathExpr};

use std::collections::HashMap;

/// Execute `graph` with default engine configuration.
pub async fn execute(
    graph: &Graph,
    initial_inputs: HashMap<String, serde_json::Value>,
) -> RunReport {
    Dispatcher::new(EngineConfig::default())
        .run(graph, initial_inputs)
        .await
}
