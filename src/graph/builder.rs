//! Graph construction.
//!
//! [`GraphBuilder`] is the only mutable structure in the model; `build()`
//! validates every invariant and produces an immutable [`Graph`] that any
//! number of concurrent runs share read-only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{WorkflowError, WorkflowResult};
use crate::evaluator::Predicate;
use crate::nodes::{Node, NodeSignature};
use crate::resolver::PathExpr;

use super::types::*;
use super::validator;

/// An immutable workflow graph: nodes, connections and cycle groups.
///
/// Built once via [`Graph::builder`], then shared read-only by all runs.
pub struct Graph {
    nodes: HashMap<String, Arc<dyn Node>>,
    signatures: HashMap<String, NodeSignature>,
    links: Vec<Link>,
    groups: Vec<CycleGroupDef>,
    units: Vec<Unit>,
    unit_gating: Vec<Vec<LinkId>>,
    incoming: HashMap<String, Vec<LinkId>>,
    outgoing: HashMap<String, Vec<LinkId>>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("link_count", &self.links.len())
            .field("group_count", &self.groups.len())
            .field("unit_count", &self.units.len())
            .finish_non_exhaustive()
    }
}

impl Graph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    /// Ids of all registered nodes.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Ids of all declared cycle groups.
    pub fn group_ids(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.id.as_str())
    }

    pub(crate) fn node(&self, id: &str) -> Option<&Arc<dyn Node>> {
        self.nodes.get(id)
    }

    pub(crate) fn signature(&self, id: &str) -> Option<&NodeSignature> {
        self.signatures.get(id)
    }

    pub(crate) fn links(&self) -> &[Link] {
        &self.links
    }

    pub(crate) fn link(&self, id: LinkId) -> &Link {
        &self.links[id]
    }

    pub(crate) fn units(&self) -> &[Unit] {
        &self.units
    }

    pub(crate) fn unit_name(&self, index: usize) -> &str {
        match &self.units[index] {
            Unit::Node(id) => id,
            Unit::Group(g) => &self.groups[*g].id,
        }
    }

    pub(crate) fn gating(&self, index: usize) -> &[LinkId] {
        &self.unit_gating[index]
    }

    pub(crate) fn group(&self, index: usize) -> &CycleGroupDef {
        &self.groups[index]
    }

    pub(crate) fn incoming(&self, node: &str) -> &[LinkId] {
        self.incoming.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn outgoing(&self, node: &str) -> &[LinkId] {
        self.outgoing.get(node).map(Vec::as_slice).unwrap_or(&[])
    }
}

struct CycleDecl {
    id: String,
    members: Vec<String>,
    feedback: Vec<Connection>,
    convergence: Option<String>,
    max_iterations: usize,
}

/// Mutable builder for [`Graph`]. Methods chain by value.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<(String, Arc<dyn Node>)>,
    connections: Vec<Connection>,
    cycles: Vec<CycleDecl>,
}

impl GraphBuilder {
    /// Register a node under `id`.
    pub fn add_node(mut self, id: impl Into<String>, node: impl Node + 'static) -> Self {
        self.nodes.push((id.into(), Arc::new(node)));
        self
    }

    /// Add a connection.
    pub fn connect(mut self, connection: Connection) -> Self {
        self.connections.push(connection);
        self
    }

    /// Declare a cycle group over `members` (in execution order), returning
    /// a scoped builder for its iteration ceiling, convergence predicate and
    /// feedback connections.
    pub fn create_cycle<I, S>(self, id: impl Into<String>, members: I) -> CycleGroupBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CycleGroupBuilder {
            builder: self,
            decl: CycleDecl {
                id: id.into(),
                members: members.into_iter().map(Into::into).collect(),
                feedback: Vec::new(),
                convergence: None,
                max_iterations: 100,
            },
        }
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> WorkflowResult<Graph> {
        // Nodes
        let mut nodes: HashMap<String, Arc<dyn Node>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for (id, node) in self.nodes {
            if id == INPUT_SOURCE {
                return Err(WorkflowError::GraphBuildError(format!(
                    "'{}' is a reserved node id",
                    INPUT_SOURCE
                )));
            }
            if nodes.insert(id.clone(), node).is_some() {
                return Err(WorkflowError::DuplicateNode(id));
            }
            order.push(id);
        }
        let signatures: HashMap<String, NodeSignature> = nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.signature()))
            .collect();

        // Connections
        let mut links: Vec<Link> = Vec::with_capacity(self.connections.len());
        for conn in &self.connections {
            if conn.source != INPUT_SOURCE && !nodes.contains_key(&conn.source) {
                return Err(WorkflowError::UnknownNode(conn.source.clone()));
            }
            if !nodes.contains_key(&conn.target) {
                return Err(WorkflowError::UnknownNode(conn.target.clone()));
            }
            links.push(parse_link(conn)?);
        }

        // Cycle groups
        let mut groups: Vec<CycleGroupDef> = Vec::new();
        let mut node_group: HashMap<String, usize> = HashMap::new();
        let mut group_ids: HashSet<String> = HashSet::new();
        for decl in self.cycles {
            if !group_ids.insert(decl.id.clone()) {
                return Err(WorkflowError::GraphBuildError(format!(
                    "duplicate cycle group id: {}",
                    decl.id
                )));
            }
            if decl.members.is_empty() {
                return Err(WorkflowError::GraphBuildError(format!(
                    "cycle group '{}' has no members",
                    decl.id
                )));
            }
            if decl.max_iterations < 1 {
                return Err(WorkflowError::GraphBuildError(format!(
                    "cycle group '{}' requires max_iterations >= 1",
                    decl.id
                )));
            }
            let group_index = groups.len();
            let mut member_set = HashSet::new();
            for member in &decl.members {
                if !nodes.contains_key(member) {
                    return Err(WorkflowError::UnknownNode(member.clone()));
                }
                if !member_set.insert(member.clone()) {
                    return Err(WorkflowError::GraphBuildError(format!(
                        "node '{}' listed twice in cycle group '{}'",
                        member, decl.id
                    )));
                }
                if node_group.insert(member.clone(), group_index).is_some() {
                    return Err(WorkflowError::GraphBuildError(format!(
                        "node '{}' belongs to more than one cycle group",
                        member
                    )));
                }
            }

            let mut feedback = Vec::with_capacity(decl.feedback.len());
            for conn in &decl.feedback {
                if !member_set.contains(&conn.source) || !member_set.contains(&conn.target) {
                    return Err(WorkflowError::FeedbackOutsideGroup {
                        group: decl.id.clone(),
                        source_node: conn.source.clone(),
                        target: conn.target.clone(),
                    });
                }
                feedback.push(parse_link(conn)?);
            }

            let convergence = match &decl.convergence {
                Some(expr) => Some(Predicate::parse(expr)?),
                None => None,
            };

            groups.push(CycleGroupDef {
                id: decl.id,
                members: decl.members,
                member_set,
                feedback,
                entries: Vec::new(),
                exits: Vec::new(),
                intra: Vec::new(),
                convergence,
                max_iterations: decl.max_iterations,
            });
        }

        // Classify links relative to groups.
        for (link_id, link) in links.iter().enumerate() {
            let source_group = node_group.get(&link.source).copied();
            let target_group = node_group.get(&link.target).copied();
            match (source_group, target_group) {
                (Some(s), Some(t)) if s == t => {
                    let group = &mut groups[s];
                    let src_pos = member_position(&group.members, &link.source);
                    let tgt_pos = member_position(&group.members, &link.target);
                    if src_pos >= tgt_pos {
                        return Err(WorkflowError::GraphBuildError(format!(
                            "connection '{}' -> '{}' goes backwards inside cycle group '{}'; declare it as a feedback connection",
                            link.source, link.target, group.id
                        )));
                    }
                    group.intra.push(link_id);
                }
                (source_group, target_group) => {
                    if let Some(s) = source_group {
                        groups[s].exits.push(link_id);
                    }
                    if let Some(t) = target_group {
                        groups[t].entries.push(link_id);
                    }
                }
            }
        }

        // Convergence predicates reference the group's declared outputs.
        for group in &groups {
            if let Some(predicate) = &group.convergence {
                validator::validate_predicate_fields(group, predicate, &signatures)?;
            }
        }

        // Contracted topological order; rejects undeclared cycles.
        let units = validator::contracted_order(&order, &links, &groups, &node_group)?;

        // Readiness gating: links entering each unit from outside it.
        let mut unit_gating: Vec<Vec<LinkId>> = Vec::with_capacity(units.len());
        for unit in &units {
            let gating = links
                .iter()
                .enumerate()
                .filter(|(_, link)| {
                    link.source != INPUT_SOURCE
                        && unit_contains(unit, &groups, &link.target)
                        && !unit_contains(unit, &groups, &link.source)
                })
                .map(|(id, _)| id)
                .collect();
            unit_gating.push(gating);
        }

        // Adjacency over the acyclic link set.
        let mut incoming: HashMap<String, Vec<LinkId>> = HashMap::new();
        let mut outgoing: HashMap<String, Vec<LinkId>> = HashMap::new();
        for (link_id, link) in links.iter().enumerate() {
            incoming.entry(link.target.clone()).or_default().push(link_id);
            if link.source != INPUT_SOURCE {
                outgoing.entry(link.source.clone()).or_default().push(link_id);
            }
        }

        Ok(Graph {
            nodes,
            signatures,
            links,
            groups,
            units,
            unit_gating,
            incoming,
            outgoing,
        })
    }
}

/// Scoped builder for one cycle group; [`finish`](Self::finish) returns the
/// graph builder.
pub struct CycleGroupBuilder {
    builder: GraphBuilder,
    decl: CycleDecl,
}

impl CycleGroupBuilder {
    /// Hard iteration ceiling (default 100). The group never runs more
    /// passes than this, regardless of the convergence predicate.
    pub fn max_iterations(mut self, max: usize) -> Self {
        self.decl.max_iterations = max;
        self
    }

    /// Convergence predicate over the group's latest output snapshot, e.g.
    /// `"score >= 0.95"`. Parsed and field-validated at build time.
    pub fn converge_when(mut self, expr: impl Into<String>) -> Self {
        self.decl.convergence = Some(expr.into());
        self
    }

    /// Declare a feedback connection: `target` reads `source`'s output from
    /// the previous iteration. Both endpoints must be group members;
    /// self-loops are allowed.
    pub fn feedback(
        mut self,
        source: impl Into<String>,
        source_path: impl Into<String>,
        target: impl Into<String>,
        target_path: impl Into<String>,
    ) -> Self {
        self.decl
            .feedback
            .push(Connection::new(source, source_path, target, target_path));
        self
    }

    /// Attach the group and return the graph builder.
    pub fn finish(mut self) -> GraphBuilder {
        self.builder.cycles.push(self.decl);
        self.builder
    }
}

fn parse_link(conn: &Connection) -> WorkflowResult<Link> {
    let source_path = PathExpr::parse(&conn.source_path).ok_or_else(|| {
        WorkflowError::GraphBuildError(format!(
            "invalid source path '{}' on connection from '{}'",
            conn.source_path, conn.source
        ))
    })?;
    let target_path = PathExpr::parse(&conn.target_path).ok_or_else(|| {
        WorkflowError::GraphBuildError(format!(
            "invalid target path '{}' on connection to '{}'",
            conn.target_path, conn.target
        ))
    })?;
    Ok(Link {
        source: conn.source.clone(),
        source_path,
        target: conn.target.clone(),
        target_path,
        tag: conn.tag.clone(),
    })
}

fn member_position(members: &[String], id: &str) -> usize {
    members
        .iter()
        .position(|m| m == id)
        .expect("membership checked before classification")
}

fn unit_contains(unit: &Unit, groups: &[CycleGroupDef], node: &str) -> bool {
    match unit {
        Unit::Node(id) => id == node,
        Unit::Group(g) => groups[*g].member_set.contains(node),
    }
}
