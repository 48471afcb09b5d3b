//! The cycle-group runtime.
//!
//! Drives repeated execution of a group's member nodes, feeding each pass's
//! outputs back through feedback connections, until the convergence
//! predicate holds, a tagged exit connection fires, or the iteration
//! ceiling is hit. One iteration fully completes before the next begins;
//! two passes of the same group never overlap.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::context::RunContext;
use crate::core::executor::run_node;
use crate::core::router::{route, LinkDecision};
use crate::error::{WorkflowError, WorkflowResult};
use crate::evaluator::Predicate;
use crate::graph::{ConnectionTag, Graph, Link};
use crate::nodes::{CycleState, ExecutionScope, Node};
use crate::resolver::{insert, resolve, OutputBundle};

/// How a cycle group reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleCompletion {
    /// The convergence predicate held, or a tagged exit fired.
    Converged,
    /// The iteration ceiling was hit without convergence. A normal
    /// completion reason, not an error.
    Exhausted,
}

/// Terminal result of one cycle-group invocation.
#[derive(Debug)]
pub(crate) struct CycleOutcome {
    pub completion: CycleCompletion,
    pub iterations: usize,
    /// Final snapshot per member node.
    pub outputs: HashMap<String, OutputBundle>,
}

struct MemberPlan {
    id: String,
    node: Arc<dyn Node>,
}

/// Self-contained execution plan for one group, cloned out of the graph so
/// the runner can be spawned as a task.
pub(crate) struct CycleRunner {
    group_id: String,
    members: Vec<MemberPlan>,
    feedback: Vec<Link>,
    intra: Vec<Link>,
    tagged_exits: Vec<Link>,
    convergence: Option<Predicate>,
    max_iterations: usize,
    ctx: Arc<RunContext>,
    node_timeout: Option<u64>,
    max_steps: i32,
}

impl CycleRunner {
    pub fn new(
        graph: &Graph,
        group_index: usize,
        ctx: Arc<RunContext>,
        node_timeout: Option<u64>,
        max_steps: i32,
    ) -> Self {
        let group = graph.group(group_index);
        let members = group
            .members
            .iter()
            .map(|id| MemberPlan {
                id: id.clone(),
                node: graph
                    .node(id)
                    .expect("membership validated at build")
                    .clone(),
            })
            .collect();
        let tagged_exits = group
            .exits
            .iter()
            .map(|id| graph.link(*id))
            .filter(|link| matches!(link.tag, ConnectionTag::Branch(_)))
            .cloned()
            .collect();
        CycleRunner {
            group_id: group.id.clone(),
            members,
            feedback: group.feedback.clone(),
            intra: group.intra.iter().map(|id| graph.link(*id)).cloned().collect(),
            tagged_exits,
            convergence: group.convergence.clone(),
            max_iterations: group.max_iterations,
            ctx,
            node_timeout,
            max_steps,
        }
    }

    /// Run the group to a terminal state. `entry_inputs` holds each
    /// member's externally resolved inputs, resolved once before the first
    /// pass.
    pub async fn run(
        self,
        entry_inputs: HashMap<String, HashMap<String, Value>>,
    ) -> WorkflowResult<CycleOutcome> {
        let mut state = CycleState::new(&self.group_id);
        let mut prev: HashMap<String, OutputBundle> = HashMap::new();

        for iteration in 0..self.max_iterations {
            if self.ctx.is_cancelled() {
                return Err(WorkflowError::Aborted(format!(
                    "cancelled before iteration {} of cycle group '{}'",
                    iteration, self.group_id
                )));
            }
            state.begin_iteration(iteration);

            let mut curr: HashMap<String, OutputBundle> = HashMap::new();
            for member in &self.members {
                self.ctx.try_step(self.max_steps)?;

                let mut scope =
                    ExecutionScope::cyclic(self.ctx.run_id(), member.id.as_str(), &mut state);
                if let Some(aware) = member.node.as_cycle_aware() {
                    aware.on_iteration_start(&mut scope, iteration, iteration == 0);
                }

                let inputs =
                    self.resolve_member_inputs(&member.id, iteration, &entry_inputs, &prev, &curr);
                let bundle = run_node(
                    member.node.as_ref(),
                    &member.id,
                    inputs,
                    &mut scope,
                    self.node_timeout,
                )
                .await
                .map_err(|e| WorkflowError::NodeExecution {
                    node_id: member.id.clone(),
                    source: e,
                })?;
                curr.insert(member.id.clone(), bundle);
            }

            let completed = iteration + 1;
            self.ctx.set_cycle_iteration(&self.group_id, completed);

            let snapshot = self.merge_snapshot(&curr);
            prev = curr;

            if self.exit_decision_fired(&prev)? || self.predicate_converged(&snapshot) {
                tracing::debug!(
                    group = %self.group_id,
                    iterations = completed,
                    "cycle group converged"
                );
                return Ok(CycleOutcome {
                    completion: CycleCompletion::Converged,
                    iterations: completed,
                    outputs: prev,
                });
            }
        }

        tracing::debug!(
            group = %self.group_id,
            iterations = self.max_iterations,
            "cycle group exhausted its iteration budget"
        );
        Ok(CycleOutcome {
            completion: CycleCompletion::Exhausted,
            iterations: self.max_iterations,
            outputs: prev,
        })
    }

    /// Inputs for one member pass: entry values (resolved once), overlaid
    /// by feedback values from the previous iteration, overlaid by forward
    /// intra-group values from the current pass.
    fn resolve_member_inputs(
        &self,
        member_id: &str,
        iteration: usize,
        entry_inputs: &HashMap<String, HashMap<String, Value>>,
        prev: &HashMap<String, OutputBundle>,
        curr: &HashMap<String, OutputBundle>,
    ) -> HashMap<String, Value> {
        let mut inputs = entry_inputs.get(member_id).cloned().unwrap_or_default();

        if iteration > 0 {
            for link in self.feedback.iter().filter(|l| l.target == member_id) {
                if let Some(bundle) = prev.get(&link.source) {
                    if let Some(value) = resolve(bundle, &link.source_path) {
                        insert(&mut inputs, &link.target_path, value.clone());
                    }
                }
            }
        }

        for link in self.intra.iter().filter(|l| l.target == member_id) {
            let Some(bundle) = curr.get(&link.source) else {
                continue;
            };
            if !intra_link_active(link, bundle) {
                continue;
            }
            if let Some(value) = resolve(bundle, &link.source_path) {
                insert(&mut inputs, &link.target_path, value.clone());
            }
        }

        inputs
    }

    fn merge_snapshot(&self, curr: &HashMap<String, OutputBundle>) -> OutputBundle {
        let mut snapshot = OutputBundle::new();
        for member in &self.members {
            if let Some(bundle) = curr.get(&member.id) {
                for (key, value) in bundle {
                    snapshot.insert(key.clone(), value.clone());
                }
            }
        }
        snapshot
    }

    fn predicate_converged(&self, snapshot: &OutputBundle) -> bool {
        self.convergence
            .as_ref()
            .map(|p| p.evaluate(snapshot))
            .unwrap_or(false)
    }

    /// A tagged exit connection whose branch fires ends the loop early.
    fn exit_decision_fired(
        &self,
        latest: &HashMap<String, OutputBundle>,
    ) -> WorkflowResult<bool> {
        for (index, link) in self.tagged_exits.iter().enumerate() {
            let Some(bundle) = latest.get(&link.source) else {
                continue;
            };
            let decided = route(&link.source, bundle, &[(index, link)])?;
            if decided
                .iter()
                .any(|(_, decision)| *decision == LinkDecision::Taken)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Intra-group links may carry branch tags (a decision node gating part of
/// the pass); inactive ones simply do not contribute inputs.
fn intra_link_active(link: &Link, source_bundle: &OutputBundle) -> bool {
    match &link.tag {
        ConnectionTag::Data => true,
        ConnectionTag::Fallback => false,
        ConnectionTag::Branch(_) => route(&link.source, source_bundle, &[(0, link)])
            .map(|decided| decided.first().map(|(_, d)| *d) == Some(LinkDecision::Taken))
            .unwrap_or(false),
    }
}
