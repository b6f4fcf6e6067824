pub mod config;
pub mod conversation;
pub mod error;
pub mod flow;
pub mod flow_commands;
pub mod logger;
pub mod node;
pub mod schema;
pub mod store;
pub mod util;
pub mod webhook;

pub use error::{FlowError, StoreError};
pub use flow::execution::{ExecutionStatus, FlowExecution};
pub use flow::manager::FlowEngine;
pub use flow::model::{Edge, Flow, FlowDefinition, FlowNode, NodeKind, TriggerKind};
pub use flow::state::{StateValue, Variables};
