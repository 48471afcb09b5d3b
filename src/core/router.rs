//! Conditional connection routing.
//!
//! After a unit completes, its outgoing connections are decided: untagged
//! connections always fire on success, branch-tagged connections fire only
//! when the source's routing decision selects their tag. Routing is
//! mutually exclusive per decision, not fan-out multicast.

use serde_json::Value;

use crate::error::WorkflowError;
use crate::graph::{ConnectionTag, Link, LinkId};
use crate::nodes::BRANCH_KEY;
use crate::resolver::OutputBundle;

/// Post-routing state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkDecision {
    /// Active: the target may consume the source's output.
    Taken,
    /// Inactive: a valid decision selected another tag, or the source was
    /// skipped or failed.
    Skipped,
    /// The source emitted no usable decision, so this tagged connection can
    /// never fire; dependents starved by it report `UnresolvedInput`.
    Unresolved,
}

/// Decide the given outgoing connections of `source_id` from its output
/// bundle.
///
/// Fails with [`WorkflowError::AmbiguousBranch`] when the node violated its
/// routing contract: a non-scalar decision value, or a decision matching
/// more than one connection.
pub(crate) fn route(
    source_id: &str,
    bundle: &OutputBundle,
    links: &[(LinkId, &Link)],
) -> Result<Vec<(LinkId, LinkDecision)>, WorkflowError> {
    let decision = match bundle.get(BRANCH_KEY) {
        None => None,
        Some(Value::String(tag)) => Some(tag.clone()),
        Some(Value::Bool(flag)) => Some(if *flag { "true" } else { "false" }.to_string()),
        Some(_) => {
            return Err(WorkflowError::AmbiguousBranch {
                node_id: source_id.to_string(),
            });
        }
    };

    let mut matched = 0usize;
    let mut decided = Vec::with_capacity(links.len());
    for (link_id, link) in links {
        let state = match &link.tag {
            ConnectionTag::Data => LinkDecision::Taken,
            // Fallback fires on failure, never on success.
            ConnectionTag::Fallback => LinkDecision::Skipped,
            ConnectionTag::Branch(tag) => match &decision {
                Some(selected) if selected == tag => {
                    matched += 1;
                    LinkDecision::Taken
                }
                Some(_) => LinkDecision::Skipped,
                None => LinkDecision::Unresolved,
            },
        };
        decided.push((*link_id, state));
    }

    if matched > 1 {
        return Err(WorkflowError::AmbiguousBranch {
            node_id: source_id.to_string(),
        });
    }

    Ok(decided)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::PathExpr;
    use serde_json::json;

    fn link(tag: ConnectionTag) -> Link {
        Link {
            source: "router".to_string(),
            source_path: PathExpr::parse("result").unwrap(),
            target: "t".to_string(),
            target_path: PathExpr::parse("value").unwrap(),
            tag,
        }
    }

    fn bundle(pairs: &[(&str, Value)]) -> OutputBundle {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_untagged_always_taken() {
        let l = link(ConnectionTag::Data);
        let decided = route("n", &bundle(&[]), &[(0, &l)]).unwrap();
        assert_eq!(decided, vec![(0, LinkDecision::Taken)]);
    }

    #[test]
    fn test_branch_exclusivity() {
        let urgent = link(ConnectionTag::Branch("urgent".into()));
        let standard = link(ConnectionTag::Branch("standard".into()));
        let decided = route(
            "n",
            &bundle(&[(BRANCH_KEY, json!("urgent"))]),
            &[(0, &urgent), (1, &standard)],
        )
        .unwrap();
        assert_eq!(
            decided,
            vec![(0, LinkDecision::Taken), (1, LinkDecision::Skipped)]
        );
    }

    #[test]
    fn test_boolean_decision_maps_to_true_false() {
        let yes = link(ConnectionTag::Branch("true".into()));
        let no = link(ConnectionTag::Branch("false".into()));
        let decided = route(
            "n",
            &bundle(&[(BRANCH_KEY, json!(false))]),
            &[(0, &yes), (1, &no)],
        )
        .unwrap();
        assert_eq!(
            decided,
            vec![(0, LinkDecision::Skipped), (1, LinkDecision::Taken)]
        );
    }

    #[test]
    fn test_missing_decision_leaves_tagged_unresolved() {
        let tagged = link(ConnectionTag::Branch("urgent".into()));
        let plain = link(ConnectionTag::Data);
        let decided = route("n", &bundle(&[]), &[(0, &tagged), (1, &plain)]).unwrap();
        assert_eq!(
            decided,
            vec![(0, LinkDecision::Unresolved), (1, LinkDecision::Taken)]
        );
    }

    #[test]
    fn test_invalid_decision_is_ambiguous() {
        let tagged = link(ConnectionTag::Branch("urgent".into()));
        let err = route("n", &bundle(&[(BRANCH_KEY, json!(7))]), &[(0, &tagged)]).unwrap_err();
        assert!(matches!(err, WorkflowError::AmbiguousBranch { node_id } if node_id == "n"));
    }

    #[test]
    fn test_multicast_match_is_ambiguous() {
        let a = link(ConnectionTag::Branch("urgent".into()));
        let b = link(ConnectionTag::Branch("urgent".into()));
        let err = route(
            "n",
            &bundle(&[(BRANCH_KEY, json!("urgent"))]),
            &[(0, &a), (1, &b)],
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::AmbiguousBranch { .. }));
    }

    #[test]
    fn test_fallback_skipped_on_success() {
        let fb = link(ConnectionTag::Fallback);
        let decided = route("n", &bundle(&[]), &[(0, &fb)]).unwrap();
        assert_eq!(decided, vec![(0, LinkDecision::Skipped)]);
    }
}
