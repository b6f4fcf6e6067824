//! The flow engine: the graph model, run state, branching rules and the
//! [`manager::FlowEngine`] that walks executions through a flow.

pub mod condition;
pub mod execution;
pub mod manager;
pub mod model;
pub mod session;
pub mod state;
pub mod validation;
