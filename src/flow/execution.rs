use std::fmt;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::flow::state::{StateValue, Variables};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Allowed edges of the run lifecycle.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Running, Paused | Completed | Failed | Cancelled) => true,
            (Paused, Running | Completed | Failed | Cancelled) => true,
            (Running, Running) | (Paused, Paused) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One run of a flow against one conversation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowExecution {
    pub id: String,
    pub flow_id: String,
    pub conversation_id: String,
    pub instance_id: String,
    pub current_node_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub variables: Variables,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl FlowExecution {
    pub fn new(
        flow_id: &str,
        conversation_id: &str,
        instance_id: &str,
        start_node_id: &str,
        variables: Variables,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            flow_id: flow_id.to_string(),
            conversation_id: conversation_id.to_string(),
            instance_id: instance_id.to_string(),
            current_node_id: start_node_id.to_string(),
            status: ExecutionStatus::Running,
            variables,
            started_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    fn transition(&mut self, next: ExecutionStatus) -> Result<(), FlowError> {
        if !self.status.can_transition_to(next) {
            return Err(FlowError::InvalidTransition { from: self.status, to: next });
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Records the node the run is now at. Only meaningful while active.
    pub fn move_to(&mut self, node_id: &str) -> Result<(), FlowError> {
        if self.status.is_terminal() {
            return Err(FlowError::InvalidTransition { from: self.status, to: ExecutionStatus::Running });
        }
        self.current_node_id = node_id.to_string();
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), FlowError> {
        self.transition(ExecutionStatus::Paused)
    }

    pub fn resume(&mut self) -> Result<(), FlowError> {
        self.transition(ExecutionStatus::Running)
    }

    /// Completing an already-completed run is a no-op.
    pub fn complete(&mut self) -> Result<(), FlowError> {
        if self.status == ExecutionStatus::Completed {
            return Ok(());
        }
        self.transition(ExecutionStatus::Completed)
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), FlowError> {
        self.transition(ExecutionStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), FlowError> {
        self.transition(ExecutionStatus::Cancelled)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<StateValue>) {
        self.variables.insert(name.into(), value.into());
        self.updated_at = Utc::now();
    }

    pub fn variable(&self, name: &str) -> Option<&StateValue> {
        self.variables.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> FlowExecution {
        FlowExecution::new("f", "c", "i", "start", Variables::new())
    }

    #[test]
    fn new_execution_is_running() {
        let exec = running();
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert!(exec.is_active());
        assert!(exec.completed_at.is_none());
    }

    #[test]
    fn pause_resume_complete() {
        let mut exec = running();
        exec.pause().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Paused);
        exec.resume().unwrap();
        exec.complete().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.completed_at.is_some());
    }

    #[test]
    fn complete_is_idempotent() {
        let mut exec = running();
        exec.complete().unwrap();
        let first = exec.completed_at;
        exec.complete().unwrap();
        assert_eq!(exec.completed_at, first);
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let mut exec = running();
        exec.fail("boom").unwrap();
        assert_eq!(exec.error_message.as_deref(), Some("boom"));
        assert!(matches!(
            exec.resume(),
            Err(FlowError::InvalidTransition { from: ExecutionStatus::Failed, to: ExecutionStatus::Running })
        ));
        assert!(exec.complete().is_err());
        assert!(exec.move_to("x").is_err());
    }

    #[test]
    fn paused_can_be_cancelled() {
        let mut exec = running();
        exec.pause().unwrap();
        exec.cancel().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        assert!(exec.completed_at.is_some());
        assert!(exec.pause().is_err());
    }

    #[test]
    fn status_display_matches_serde() {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Paused,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, serde_json::Value::String(status.to_string()));
        }
    }
}
