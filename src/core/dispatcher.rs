//! Workflow dispatcher — the main execution driver.
//!
//! Walks the contracted graph in dependency order, executing plain nodes
//! via the node wrapper and cycle groups via [`CycleRunner`], gating each
//! unit on the routing state of its incoming connections and recording
//! outputs into the shared [`RunContext`].

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::core::context::{CancelHandle, RunContext};
use crate::core::cycle_runner::{CycleCompletion, CycleOutcome, CycleRunner};
use crate::core::executor::run_node;
use crate::core::router::{route, LinkDecision};
use crate::error::{NodeError, WorkflowError};
use crate::graph::{ConnectionTag, Graph, LinkId, Unit, INPUT_SOURCE};
use crate::nodes::ExecutionScope;
use crate::resolver::{insert, OutputBundle};

/// Engine configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    /// Ceiling on node executions across the run, cycle passes included.
    pub max_steps: i32,
    /// Wall-clock ceiling for the run.
    pub max_execution_time_secs: u64,
    /// Dispatch independent branches onto a worker pool. Off by default:
    /// most workflow outputs feed the very next step.
    #[serde(default)]
    pub parallel_enabled: bool,
    /// Concurrent unit cap when parallel dispatch is on (0 = unbounded).
    #[serde(default)]
    pub max_concurrency: usize,
    /// Per-node execution deadline; a timeout is classified like any other
    /// node failure.
    #[serde(default)]
    pub node_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_steps: 500,
            max_execution_time_secs: 600,
            parallel_enabled: false,
            max_concurrency: 0,
            node_timeout_secs: None,
        }
    }
}

/// Terminal status of one schedulable unit.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Succeeded,
    /// Never ran: every incoming connection was routed elsewhere.
    Skipped,
    Failed {
        error: String,
    },
    /// Cycle group finished because its convergence predicate held (or a
    /// tagged exit fired).
    Converged {
        iterations: usize,
    },
    /// Cycle group hit its iteration ceiling without converging. Not an
    /// error.
    Exhausted {
        iterations: usize,
    },
}

/// The error that halted a unit, attributed to it.
#[derive(Debug)]
pub struct RunError {
    pub unit: String,
    pub error: WorkflowError,
}

/// Result of one workflow run.
///
/// Always returned, even on failure: `outputs` and `statuses` carry the
/// partial context, `error` the first halting error if any.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub outputs: HashMap<String, OutputBundle>,
    pub statuses: HashMap<String, UnitStatus>,
    pub error: Option<RunError>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn status(&self, unit: &str) -> Option<&UnitStatus> {
        self.statuses.get(unit)
    }

    pub fn output(&self, node: &str) -> Option<&OutputBundle> {
        self.outputs.get(node)
    }
}

enum UnitResult {
    NodeDone(OutputBundle),
    NodeFailed {
        error: NodeError,
        inputs: HashMap<String, Value>,
    },
    GroupDone(CycleOutcome),
    GroupFailed(WorkflowError),
    Fatal(WorkflowError),
}

struct UnitOutcome {
    unit_index: usize,
    result: UnitResult,
}

#[derive(Clone, Copy, PartialEq)]
enum UnitPhase {
    Pending,
    Dispatched,
    Done,
}

/// The main dispatcher: drives graph execution.
pub struct Dispatcher {
    config: EngineConfig,
}

impl Dispatcher {
    pub fn new(config: EngineConfig) -> Self {
        Dispatcher { config }
    }

    /// Execute `graph` with the given initial inputs (exposed as the
    /// `"input"` source bundle).
    pub async fn run(&self, graph: &Graph, initial_inputs: HashMap<String, Value>) -> RunReport {
        self.run_with_cancel(graph, initial_inputs, CancelHandle::new())
            .await
    }

    /// Execute with an external cancellation handle. Cancellation is
    /// observed at unit and cycle-iteration boundaries, never mid-node.
    pub async fn run_with_cancel(
        &self,
        graph: &Graph,
        initial_inputs: HashMap<String, Value>,
        cancel: CancelHandle,
    ) -> RunReport {
        let ctx = Arc::new(RunContext::new(cancel));
        ctx.record_outputs(INPUT_SOURCE, initial_inputs.into_iter().collect());
        tracing::debug!(run_id = %ctx.run_id(), "workflow run started");

        let units = graph.units();
        let mut link_states: Vec<Option<LinkDecision>> = graph
            .links()
            .iter()
            .map(|link| (link.source == INPUT_SOURCE).then_some(LinkDecision::Taken))
            .collect();
        let mut phases = vec![UnitPhase::Pending; units.len()];
        let mut statuses: HashMap<String, UnitStatus> = HashMap::new();
        let mut fallback_inputs: HashMap<String, HashMap<String, Value>> = HashMap::new();
        let mut first_error: Option<RunError> = None;
        let mut join_set: JoinSet<UnitOutcome> = JoinSet::new();

        let concurrency_cap = if self.config.parallel_enabled {
            self.config.max_concurrency
        } else {
            1
        };

        'run: loop {
            if ctx.is_cancelled() {
                record_error(
                    &mut first_error,
                    "run",
                    WorkflowError::Aborted("cancelled".to_string()),
                );
                break 'run;
            }
            if ctx.elapsed_exceeded(self.config.max_execution_time_secs) {
                record_error(&mut first_error, "run", WorkflowError::ExecutionTimeout);
                break 'run;
            }

            // Dispatch every unit whose incoming connections are decided.
            let mut progressed = false;
            for index in 0..units.len() {
                if phases[index] != UnitPhase::Pending {
                    continue;
                }
                let gating = graph.gating(index);
                if gating.iter().any(|l| link_states[*l].is_none()) {
                    continue;
                }
                let any_taken = gating
                    .iter()
                    .any(|l| link_states[*l] == Some(LinkDecision::Taken));
                let any_unresolved = gating
                    .iter()
                    .any(|l| link_states[*l] == Some(LinkDecision::Unresolved));

                if gating.is_empty() || any_taken {
                    if concurrency_cap > 0 && join_set.len() >= concurrency_cap {
                        break;
                    }
                    if let Err(error) = ctx.try_step(self.config.max_steps) {
                        record_error(&mut first_error, graph.unit_name(index), error);
                        break 'run;
                    }
                    match self.dispatch_unit(
                        graph,
                        index,
                        &ctx,
                        &link_states,
                        &mut fallback_inputs,
                        &mut join_set,
                    ) {
                        Ok(()) => {
                            phases[index] = UnitPhase::Dispatched;
                        }
                        Err(error) => {
                            // Starved by an unresolvable input: the unit
                            // fails without running.
                            phases[index] = UnitPhase::Done;
                            let name = graph.unit_name(index).to_string();
                            tracing::warn!(unit = %name, error = %error, "unit input unresolved");
                            statuses.insert(
                                name.clone(),
                                UnitStatus::Failed {
                                    error: error.to_string(),
                                },
                            );
                            record_error(&mut first_error, &name, error);
                            skip_unit_outgoing(graph, index, &mut link_states);
                        }
                    }
                    progressed = true;
                } else if any_unresolved {
                    phases[index] = UnitPhase::Done;
                    let name = graph.unit_name(index).to_string();
                    let parameter = gating
                        .iter()
                        .find(|l| link_states[**l] == Some(LinkDecision::Unresolved))
                        .and_then(|l| graph.link(*l).target_path.head())
                        .unwrap_or("?")
                        .to_string();
                    let error = WorkflowError::UnresolvedInput {
                        node_id: name.clone(),
                        parameter,
                    };
                    tracing::warn!(unit = %name, error = %error, "unit starved by undecidable branch");
                    statuses.insert(
                        name.clone(),
                        UnitStatus::Failed {
                            error: error.to_string(),
                        },
                    );
                    record_error(&mut first_error, &name, error);
                    skip_unit_outgoing(graph, index, &mut link_states);
                    progressed = true;
                } else {
                    // Every incoming connection was routed elsewhere.
                    phases[index] = UnitPhase::Done;
                    let name = graph.unit_name(index).to_string();
                    tracing::debug!(unit = %name, "unit skipped");
                    statuses.insert(name, UnitStatus::Skipped);
                    skip_unit_outgoing(graph, index, &mut link_states);
                    progressed = true;
                }
            }

            if join_set.is_empty() {
                if !progressed {
                    break 'run;
                }
                continue;
            }

            let Some(joined) = join_set.join_next().await else {
                continue;
            };
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    record_error(
                        &mut first_error,
                        "run",
                        WorkflowError::Internal(format!("unit task join error: {}", join_error)),
                    );
                    break 'run;
                }
            };

            phases[outcome.unit_index] = UnitPhase::Done;
            let fatal = self.process_outcome(
                graph,
                outcome,
                &ctx,
                &mut link_states,
                &mut statuses,
                &mut fallback_inputs,
                &mut first_error,
            );
            if fatal {
                break 'run;
            }
        }

        join_set.abort_all();
        while join_set.join_next().await.is_some() {}

        let mut outputs = ctx.snapshot_outputs();
        outputs.remove(INPUT_SOURCE);
        tracing::debug!(
            run_id = %ctx.run_id(),
            failed = first_error.is_some(),
            "workflow run finished"
        );
        RunReport {
            run_id: ctx.run_id().to_string(),
            outputs,
            statuses,
            error: first_error,
        }
    }

    /// Resolve a ready unit's inputs and spawn its task.
    fn dispatch_unit(
        &self,
        graph: &Graph,
        unit_index: usize,
        ctx: &Arc<RunContext>,
        link_states: &[Option<LinkDecision>],
        fallback_inputs: &mut HashMap<String, HashMap<String, Value>>,
        join_set: &mut JoinSet<UnitOutcome>,
    ) -> Result<(), WorkflowError> {
        match &graph.units()[unit_index] {
            Unit::Node(node_id) => {
                let inputs =
                    resolve_node_inputs(graph, ctx, node_id, link_states, fallback_inputs)?;
                let node = graph
                    .node(node_id)
                    .expect("unit nodes exist by construction")
                    .clone();
                let node_id = node_id.clone();
                let ctx = ctx.clone();
                let timeout = self.config.node_timeout_secs;
                join_set.spawn(async move {
                    let mut scope = ExecutionScope::plain(ctx.run_id(), node_id.as_str());
                    let result = run_node(
                        node.as_ref(),
                        &node_id,
                        inputs.clone(),
                        &mut scope,
                        timeout,
                    )
                    .await;
                    UnitOutcome {
                        unit_index,
                        result: match result {
                            Ok(bundle) => UnitResult::NodeDone(bundle),
                            Err(error) => UnitResult::NodeFailed { error, inputs },
                        },
                    }
                });
                Ok(())
            }
            Unit::Group(group_index) => {
                let entry_inputs =
                    resolve_entry_inputs(graph, ctx, *group_index, link_states, fallback_inputs)?;
                let runner = CycleRunner::new(
                    graph,
                    *group_index,
                    ctx.clone(),
                    self.config.node_timeout_secs,
                    self.config.max_steps,
                );
                join_set.spawn(async move {
                    let result = match runner.run(entry_inputs).await {
                        Ok(outcome) => UnitResult::GroupDone(outcome),
                        Err(error @ WorkflowError::NodeExecution { .. }) => {
                            UnitResult::GroupFailed(error)
                        }
                        Err(error) => UnitResult::Fatal(error),
                    };
                    UnitOutcome { unit_index, result }
                });
                Ok(())
            }
        }
    }

    /// Apply one finished unit's result. Returns true when the run must
    /// abort.
    #[allow(clippy::too_many_arguments)]
    fn process_outcome(
        &self,
        graph: &Graph,
        outcome: UnitOutcome,
        ctx: &Arc<RunContext>,
        link_states: &mut [Option<LinkDecision>],
        statuses: &mut HashMap<String, UnitStatus>,
        fallback_inputs: &mut HashMap<String, HashMap<String, Value>>,
        first_error: &mut Option<RunError>,
    ) -> bool {
        let unit_index = outcome.unit_index;
        let unit_name = graph.unit_name(unit_index).to_string();
        match outcome.result {
            UnitResult::NodeDone(bundle) => {
                ctx.record_outputs(&unit_name, bundle.clone());
                statuses.insert(unit_name.clone(), UnitStatus::Succeeded);
                tracing::debug!(node = %unit_name, "node succeeded");
                match decide_outgoing(graph, &unit_name, &bundle, link_states) {
                    Ok(()) => false,
                    Err(error) => {
                        record_error(first_error, &unit_name, error);
                        true
                    }
                }
            }
            UnitResult::NodeFailed { error, inputs } => {
                tracing::warn!(node = %unit_name, error = %error, "node failed");
                statuses.insert(
                    unit_name.clone(),
                    UnitStatus::Failed {
                        error: error.to_string(),
                    },
                );
                let mut fallback_taken = false;
                for link_id in graph.outgoing(&unit_name) {
                    let link = graph.link(*link_id);
                    if link.tag == ConnectionTag::Fallback {
                        link_states[*link_id] = Some(LinkDecision::Taken);
                        fallback_inputs.insert(link.target.clone(), inputs.clone());
                        fallback_taken = true;
                    } else {
                        link_states[*link_id] = Some(LinkDecision::Skipped);
                    }
                }
                if fallback_taken {
                    // Recovered through a fallback connection: the node's
                    // status stays failed, the run does not.
                    tracing::debug!(node = %unit_name, "fallback connection taken");
                } else {
                    record_error(
                        first_error,
                        &unit_name,
                        WorkflowError::NodeExecution {
                            node_id: unit_name.clone(),
                            source: error,
                        },
                    );
                }
                false
            }
            UnitResult::GroupDone(cycle) => {
                let Unit::Group(group_index) = &graph.units()[unit_index] else {
                    unreachable!("group outcome for non-group unit")
                };
                let group = graph.group(*group_index);
                for member in &group.members {
                    if let Some(bundle) = cycle.outputs.get(member) {
                        ctx.record_outputs(member, bundle.clone());
                        statuses.insert(member.clone(), UnitStatus::Succeeded);
                    }
                }
                statuses.insert(
                    unit_name.clone(),
                    match cycle.completion {
                        CycleCompletion::Converged => UnitStatus::Converged {
                            iterations: cycle.iterations,
                        },
                        CycleCompletion::Exhausted => UnitStatus::Exhausted {
                            iterations: cycle.iterations,
                        },
                    },
                );
                // Exit connections activate only now that the group has
                // terminated.
                for exit_id in &group.exits {
                    let link = graph.link(*exit_id);
                    let Some(bundle) = cycle.outputs.get(&link.source) else {
                        link_states[*exit_id] = Some(LinkDecision::Skipped);
                        continue;
                    };
                    match route(&link.source, bundle, &[(*exit_id, link)]) {
                        Ok(decided) => {
                            for (id, decision) in decided {
                                link_states[id] = Some(decision);
                            }
                        }
                        Err(error) => {
                            record_error(first_error, &unit_name, error);
                            return true;
                        }
                    }
                }
                false
            }
            UnitResult::GroupFailed(error) => {
                tracing::warn!(group = %unit_name, error = %error, "cycle group failed");
                statuses.insert(
                    unit_name.clone(),
                    UnitStatus::Failed {
                        error: error.to_string(),
                    },
                );
                skip_unit_outgoing(graph, unit_index, link_states);
                record_error(first_error, &unit_name, error);
                false
            }
            UnitResult::Fatal(error) => {
                record_error(first_error, &unit_name, error);
                true
            }
        }
    }
}

fn record_error(first_error: &mut Option<RunError>, unit: &str, error: WorkflowError) {
    if first_error.is_none() {
        *first_error = Some(RunError {
            unit: unit.to_string(),
            error,
        });
    }
}

/// Mark every outgoing connection of a unit as skipped.
fn skip_unit_outgoing(graph: &Graph, unit_index: usize, link_states: &mut [Option<LinkDecision>]) {
    match &graph.units()[unit_index] {
        Unit::Node(node_id) => {
            for link_id in graph.outgoing(node_id) {
                link_states[*link_id] = Some(LinkDecision::Skipped);
            }
        }
        Unit::Group(group_index) => {
            for link_id in &graph.group(*group_index).exits {
                link_states[*link_id] = Some(LinkDecision::Skipped);
            }
        }
    }
}

/// Route a node's outgoing connections from its output bundle.
fn decide_outgoing(
    graph: &Graph,
    node_id: &str,
    bundle: &OutputBundle,
    link_states: &mut [Option<LinkDecision>],
) -> Result<(), WorkflowError> {
    let outgoing: Vec<(LinkId, &crate::graph::Link)> = graph
        .outgoing(node_id)
        .iter()
        .map(|id| (*id, graph.link(*id)))
        .collect();
    for (id, decision) in route(node_id, bundle, &outgoing)? {
        link_states[id] = Some(decision);
    }
    Ok(())
}

/// Resolve a plain node's inputs from its incoming connections.
fn resolve_node_inputs(
    graph: &Graph,
    ctx: &RunContext,
    node_id: &str,
    link_states: &[Option<LinkDecision>],
    fallback_inputs: &mut HashMap<String, HashMap<String, Value>>,
) -> Result<HashMap<String, Value>, WorkflowError> {
    let mut inputs = fallback_inputs.remove(node_id).unwrap_or_default();
    let mut starved: Vec<String> = Vec::new();

    for link_id in graph.incoming(node_id) {
        let link = graph.link(*link_id);
        if link.tag == ConnectionTag::Fallback {
            continue;
        }
        match link_states[*link_id] {
            Some(LinkDecision::Taken) => {
                match ctx.resolve_from(&link.source, &link.source_path) {
                    Some(value) => insert(&mut inputs, &link.target_path, value),
                    None => {
                        if let Some(head) = link.target_path.head() {
                            starved.push(head.to_string());
                        }
                    }
                }
            }
            Some(LinkDecision::Skipped) | Some(LinkDecision::Unresolved) => {
                if let Some(head) = link.target_path.head() {
                    starved.push(head.to_string());
                }
            }
            None => {
                return Err(WorkflowError::Internal(format!(
                    "undecided connection into ready node '{}'",
                    node_id
                )));
            }
        }
    }

    check_starved_required(graph, node_id, &inputs, &starved)?;
    Ok(inputs)
}

/// Resolve a cycle group's entry connections, once per invocation.
fn resolve_entry_inputs(
    graph: &Graph,
    ctx: &RunContext,
    group_index: usize,
    link_states: &[Option<LinkDecision>],
    fallback_inputs: &mut HashMap<String, HashMap<String, Value>>,
) -> Result<HashMap<String, HashMap<String, Value>>, WorkflowError> {
    let group = graph.group(group_index);
    let mut entries: HashMap<String, HashMap<String, Value>> = HashMap::new();
    let mut starved: HashMap<String, Vec<String>> = HashMap::new();

    for member in &group.members {
        if let Some(inputs) = fallback_inputs.remove(member) {
            entries.insert(member.clone(), inputs);
        }
    }

    for link_id in &group.entries {
        let link = graph.link(*link_id);
        if link.tag == ConnectionTag::Fallback {
            continue;
        }
        match link_states[*link_id] {
            Some(LinkDecision::Taken) => {
                match ctx.resolve_from(&link.source, &link.source_path) {
                    Some(value) => insert(
                        entries.entry(link.target.clone()).or_default(),
                        &link.target_path,
                        value,
                    ),
                    None => {
                        if let Some(head) = link.target_path.head() {
                            starved.entry(link.target.clone()).or_default().push(head.to_string());
                        }
                    }
                }
            }
            Some(LinkDecision::Skipped) | Some(LinkDecision::Unresolved) => {
                if let Some(head) = link.target_path.head() {
                    starved.entry(link.target.clone()).or_default().push(head.to_string());
                }
            }
            None => {
                return Err(WorkflowError::Internal(format!(
                    "undecided entry connection into ready group '{}'",
                    group.id
                )));
            }
        }
    }

    for member in &group.members {
        let member_inputs = entries.get(member).cloned().unwrap_or_default();
        if let Some(params) = starved.get(member) {
            check_starved_required(
                graph,
                member,
                &member_inputs,
                params,
            )?;
        }
    }

    Ok(entries)
}

/// A required parameter fed only by skipped/unresolved connections (and
/// lacking a default) starves the unit.
fn check_starved_required(
    graph: &Graph,
    node_id: &str,
    inputs: &HashMap<String, Value>,
    starved: &[String],
) -> Result<(), WorkflowError> {
    let Some(signature) = graph.signature(node_id) else {
        return Ok(());
    };
    for name in starved {
        if inputs.contains_key(name) {
            continue;
        }
        let required_without_default = signature
            .params
            .iter()
            .any(|p| &p.name == name && p.required && p.default.is_none());
        if required_without_default {
            return Err(WorkflowError::UnresolvedInput {
                node_id: node_id.to_string(),
                parameter: name.clone(),
            });
        }
    }
    Ok(())
}
