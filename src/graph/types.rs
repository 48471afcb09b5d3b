use std::collections::HashSet;

use crate::evaluator::Predicate;
use crate::resolver::PathExpr;

/// Reserved source id exposing the caller's initial inputs as an output
/// bundle, so entry nodes are fed through ordinary connections.
pub const INPUT_SOURCE: &str = "input";

/// Activation rule of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTag {
    /// Always active once the source succeeds.
    Data,
    /// Active only when the source's routing decision selects this label.
    Branch(String),
    /// Active only when the source node fails; the target receives the
    /// failed node's resolved inputs.
    Fallback,
}

/// A connection as declared on the builder. Paths are raw strings here and
/// are parsed/validated at build time.
#[derive(Debug, Clone)]
pub struct Connection {
    pub(crate) source: String,
    pub(crate) source_path: String,
    pub(crate) target: String,
    pub(crate) target_path: String,
    pub(crate) tag: ConnectionTag,
}

impl Connection {
    /// A data connection mapping `source_path` of `source`'s output bundle
    /// into `target_path` of `target`'s inputs.
    pub fn new(
        source: impl Into<String>,
        source_path: impl Into<String>,
        target: impl Into<String>,
        target_path: impl Into<String>,
    ) -> Self {
        Connection {
            source: source.into(),
            source_path: source_path.into(),
            target: target.into(),
            target_path: target_path.into(),
            tag: ConnectionTag::Data,
        }
    }

    /// Restrict activation to the given branch tag.
    pub fn on_branch(mut self, tag: impl Into<String>) -> Self {
        self.tag = ConnectionTag::Branch(tag.into());
        self
    }

    /// A fallback connection: `target` runs with `source`'s inputs when
    /// `source` fails. Paths are unused for fallback routing.
    pub fn fallback(source: impl Into<String>, target: impl Into<String>) -> Self {
        Connection {
            source: source.into(),
            source_path: "result".to_string(),
            target: target.into(),
            target_path: "result".to_string(),
            tag: ConnectionTag::Fallback,
        }
    }
}

/// Index of a resolved connection in [`Graph::links`].
pub(crate) type LinkId = usize;

/// A build-validated connection with parsed paths.
#[derive(Debug, Clone)]
pub(crate) struct Link {
    pub source: String,
    pub source_path: PathExpr,
    pub target: String,
    pub target_path: PathExpr,
    pub tag: ConnectionTag,
}

/// A declared cycle group after build-time validation.
pub(crate) struct CycleGroupDef {
    pub id: String,
    /// Members in declared execution order.
    pub members: Vec<String>,
    pub member_set: HashSet<String>,
    /// Feedback edges; targets (and sources) are members. Kept separate
    /// from the acyclic link set.
    pub feedback: Vec<Link>,
    /// Links crossing into the group (resolved once per invocation).
    pub entries: Vec<LinkId>,
    /// Links crossing out of the group (activated once it terminates; a
    /// tagged exit may end the loop early).
    pub exits: Vec<LinkId>,
    /// Forward links between members within one pass.
    pub intra: Vec<LinkId>,
    pub convergence: Option<Predicate>,
    pub max_iterations: usize,
}

/// One schedulable unit of the contracted graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Unit {
    Node(String),
    Group(usize),
}
