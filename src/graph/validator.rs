//! Build-time graph validation.

use std::collections::{HashMap, HashSet};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::DiGraph;

use crate::error::{WorkflowError, WorkflowResult};
use crate::evaluator::Predicate;
use crate::nodes::NodeSignature;

use super::types::{CycleGroupDef, Link, Unit, INPUT_SOURCE};

/// Compute the contracted topological order: each cycle group collapses to
/// one schedulable unit. Any cycle not covered by a declared group is the
/// one class of cycle the engine refuses, at build time.
pub(crate) fn contracted_order(
    node_order: &[String],
    links: &[Link],
    groups: &[CycleGroupDef],
    node_group: &HashMap<String, usize>,
) -> WorkflowResult<Vec<Unit>> {
    let mut units: Vec<Unit> = Vec::new();
    let mut unit_of: HashMap<&str, usize> = HashMap::new();

    for id in node_order {
        if !node_group.contains_key(id) {
            unit_of.insert(id.as_str(), units.len());
            units.push(Unit::Node(id.clone()));
        }
    }
    for (group_index, group) in groups.iter().enumerate() {
        let unit_index = units.len();
        units.push(Unit::Group(group_index));
        for member in &group.members {
            unit_of.insert(member.as_str(), unit_index);
        }
    }

    let mut contracted: DiGraph<usize, ()> = DiGraph::new();
    let indices: Vec<_> = (0..units.len()).map(|u| contracted.add_node(u)).collect();
    for link in links {
        if link.source == INPUT_SOURCE {
            continue;
        }
        let source = unit_of[link.source.as_str()];
        let target = unit_of[link.target.as_str()];
        if source != target {
            contracted.update_edge(indices[source], indices[target], ());
        }
    }

    match toposort(&contracted, None) {
        Ok(sorted) => Ok(sorted
            .into_iter()
            .map(|idx| units[contracted[idx]].clone())
            .collect()),
        Err(cycle) => {
            // Name every unit in the offending strongly connected component.
            let culprit = cycle.node_id();
            let nodes = tarjan_scc(&contracted)
                .into_iter()
                .find(|scc| scc.contains(&culprit))
                .unwrap_or_else(|| vec![culprit])
                .into_iter()
                .map(|idx| match &units[contracted[idx]] {
                    Unit::Node(id) => id.clone(),
                    Unit::Group(g) => groups[*g].id.clone(),
                })
                .collect();
            Err(WorkflowError::CyclicDependency { nodes })
        }
    }
}

/// Check that a convergence predicate only references fields some group
/// member declares as an output. Skipped when any member leaves its output
/// surface undeclared.
pub(crate) fn validate_predicate_fields(
    group: &CycleGroupDef,
    predicate: &Predicate,
    signatures: &HashMap<String, NodeSignature>,
) -> WorkflowResult<()> {
    let mut declared: HashSet<&str> = HashSet::new();
    for member in &group.members {
        match signatures.get(member).and_then(|s| s.outputs.as_ref()) {
            Some(outputs) => declared.extend(outputs.iter().map(String::as_str)),
            None => return Ok(()),
        }
    }

    for field in predicate.referenced_fields() {
        if !declared.contains(field.as_str()) {
            return Err(WorkflowError::PredicateValidation {
                group: group.id.clone(),
                field,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::PathExpr;

    fn link(source: &str, target: &str) -> Link {
        Link {
            source: source.to_string(),
            source_path: PathExpr::parse("result").unwrap(),
            target: target.to_string(),
            target_path: PathExpr::parse("value").unwrap(),
            tag: super::super::types::ConnectionTag::Data,
        }
    }

    #[test]
    fn test_contracted_order_respects_dependencies() {
        let nodes: Vec<String> = ["c", "a", "b"].iter().map(|s| s.to_string()).collect();
        let links = vec![link("a", "b"), link("b", "c")];
        let units = contracted_order(&nodes, &links, &[], &HashMap::new()).unwrap();
        let names: Vec<_> = units
            .iter()
            .map(|u| match u {
                Unit::Node(id) => id.clone(),
                Unit::Group(_) => unreachable!(),
            })
            .collect();
        let pos = |n: &str| names.iter().position(|x| x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn test_cycle_reports_participants() {
        let nodes: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let links = vec![link("a", "b"), link("b", "a"), link("b", "c")];
        let err = contracted_order(&nodes, &links, &[], &HashMap::new()).unwrap_err();
        match err {
            WorkflowError::CyclicDependency { mut nodes } => {
                nodes.sort();
                assert_eq!(nodes, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
