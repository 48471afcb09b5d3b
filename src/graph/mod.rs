//! The workflow graph model: nodes, connections, cycle groups.

mod builder;
mod types;
mod validator;

pub use builder::{CycleGroupBuilder, Graph, GraphBuilder};
pub use types::{Connection, ConnectionTag, INPUT_SOURCE};

pub(crate) use types::{CycleGroupDef, Link, LinkId, Unit};
