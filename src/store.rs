use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use crate::conversation::{Conversation, ConversationStatus, MessageRecord};
use crate::error::StoreError;
use crate::flow::execution::FlowExecution;
use crate::flow::model::{Edge, Flow, FlowDefinition, FlowNode, NodeKind, TriggerKind};

pub type FlowStore = Arc<dyn FlowStoreType>;
pub type ExecutionStore = Arc<dyn ExecutionStoreType>;
pub type ConversationStore = Arc<dyn ConversationStoreType>;

/// Flow definitions: flows, their nodes and edges.
#[async_trait]
pub trait FlowStoreType: Send + Sync {
    /// Saves a whole definition, replacing nodes and edges of an existing flow.
    /// The usage counter of an existing flow is preserved.
    async fn publish(&self, definition: FlowDefinition) -> Result<(), StoreError>;

    async fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>, StoreError>;

    /// Active flows of an instance with the given trigger kind, ordered by
    /// `priority` then `created_at`, both ascending.
    async fn find_by_trigger(&self, instance_id: &str, trigger: TriggerKind) -> Result<Vec<Flow>, StoreError>;

    async fn find_start_node(&self, flow_id: &str) -> Result<Option<FlowNode>, StoreError>;

    async fn get_node(&self, flow_id: &str, node_id: &str) -> Result<Option<FlowNode>, StoreError>;

    /// Active edges leaving `node_id`, in store order.
    async fn edges_from(&self, flow_id: &str, node_id: &str) -> Result<Vec<Edge>, StoreError>;

    async fn set_active(&self, flow_id: &str, active: bool) -> Result<(), StoreError>;

    async fn increment_usage(&self, flow_id: &str) -> Result<(), StoreError>;

    /// Removes the flow with its nodes and edges. Executions live in the
    /// [`ExecutionStoreType`] and are removed by the caller.
    async fn delete_flow(&self, flow_id: &str) -> Result<(), StoreError>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn FlowStoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlowStore({})", self.name())
    }
}

/// Run state of flow executions.
#[async_trait]
pub trait ExecutionStoreType: Send + Sync {
    async fn create_execution(&self, execution: &FlowExecution) -> Result<(), StoreError>;

    async fn update_execution(&self, execution: &FlowExecution) -> Result<(), StoreError>;

    async fn get_execution(&self, execution_id: &str) -> Result<Option<FlowExecution>, StoreError>;

    /// The `running` or `paused` execution of a conversation, if any.
    async fn find_active_by_conversation(&self, conversation_id: &str) -> Result<Option<FlowExecution>, StoreError>;

    /// Newest first.
    async fn list_by_flow(&self, flow_id: &str, limit: usize) -> Result<Vec<FlowExecution>, StoreError>;

    async fn delete_by_flow(&self, flow_id: &str) -> Result<usize, StoreError>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn ExecutionStoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecutionStore({})", self.name())
    }
}

/// The slice of the CRM the engine reads and mutates.
#[async_trait]
pub trait ConversationStoreType: Send + Sync {
    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError>;

    async fn save_conversation(&self, conversation: Conversation) -> Result<(), StoreError>;

    /// Sets the status, and the assignee when `assigned_to` is given.
    async fn update_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
        assigned_to: Option<&str>,
    ) -> Result<Conversation, StoreError>;

    async fn record_message(&self, message: MessageRecord) -> Result<(), StoreError>;

    async fn count_messages(&self, conversation_id: &str) -> Result<usize, StoreError>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn ConversationStoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConversationStore({})", self.name())
    }
}

/// Handles to the three stores the engine works against.
#[derive(Clone, Debug)]
pub struct Stores {
    pub flows: FlowStore,
    pub executions: ExecutionStore,
    pub conversations: ConversationStore,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self::from_memory(InMemoryStore::new())
    }

    pub fn from_memory(store: Arc<InMemoryStore>) -> Self {
        Stores {
            flows: store.clone(),
            executions: store.clone(),
            conversations: store,
        }
    }
}

/// All three stores over `DashMap`s. Reads see writes immediately.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    flows: DashMap<String, Flow>,
    nodes: DashMap<String, Vec<FlowNode>>,
    edges: DashMap<String, Vec<Edge>>,
    executions: DashMap<String, (u64, FlowExecution)>,
    conversations: DashMap<String, Conversation>,
    messages: DashMap<String, Vec<MessageRecord>>,
    seq: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl FlowStoreType for InMemoryStore {
    async fn publish(&self, definition: FlowDefinition) -> Result<(), StoreError> {
        let FlowDefinition { mut flow, nodes, edges } = definition;
        if let Some(existing) = self.flows.get(&flow.id) {
            flow.usage_count = existing.usage_count;
            flow.created_at = existing.created_at;
        }
        flow.updated_at = Utc::now();
        let flow_id = flow.id.clone();
        self.nodes.insert(flow_id.clone(), nodes);
        self.edges.insert(flow_id.clone(), edges);
        self.flows.insert(flow_id, flow);
        Ok(())
    }

    async fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>, StoreError> {
        Ok(self.flows.get(flow_id).map(|f| f.clone()))
    }

    async fn find_by_trigger(&self, instance_id: &str, trigger: TriggerKind) -> Result<Vec<Flow>, StoreError> {
        let mut flows: Vec<Flow> = self
            .flows
            .iter()
            .filter(|f| f.is_active && f.trigger == trigger && f.instance_id == instance_id)
            .map(|f| f.value().clone())
            .collect();
        flows.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(flows)
    }

    async fn find_start_node(&self, flow_id: &str) -> Result<Option<FlowNode>, StoreError> {
        Ok(self.nodes.get(flow_id).and_then(|nodes| {
            nodes.iter().find(|n| matches!(n.kind, NodeKind::Start)).cloned()
        }))
    }

    async fn get_node(&self, flow_id: &str, node_id: &str) -> Result<Option<FlowNode>, StoreError> {
        Ok(self
            .nodes
            .get(flow_id)
            .and_then(|nodes| nodes.iter().find(|n| n.node_id == node_id).cloned()))
    }

    async fn edges_from(&self, flow_id: &str, node_id: &str) -> Result<Vec<Edge>, StoreError> {
        Ok(self
            .edges
            .get(flow_id)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|e| e.is_active && e.source_node_id == node_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_active(&self, flow_id: &str, active: bool) -> Result<(), StoreError> {
        let mut flow = self
            .flows
            .get_mut(flow_id)
            .ok_or_else(|| StoreError::not_found("flow", flow_id))?;
        flow.is_active = active;
        flow.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_usage(&self, flow_id: &str) -> Result<(), StoreError> {
        let mut flow = self
            .flows
            .get_mut(flow_id)
            .ok_or_else(|| StoreError::not_found("flow", flow_id))?;
        flow.usage_count += 1;
        Ok(())
    }

    async fn delete_flow(&self, flow_id: &str) -> Result<(), StoreError> {
        if self.flows.remove(flow_id).is_none() {
            return Err(StoreError::not_found("flow", flow_id));
        }
        self.nodes.remove(flow_id);
        self.edges.remove(flow_id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

#[async_trait]
impl ExecutionStoreType for InMemoryStore {
    async fn create_execution(&self, execution: &FlowExecution) -> Result<(), StoreError> {
        if self.executions.contains_key(&execution.id) {
            return Err(StoreError::Conflict(format!("execution `{}` already exists", execution.id)));
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.executions.insert(execution.id.clone(), (seq, execution.clone()));
        Ok(())
    }

    async fn update_execution(&self, execution: &FlowExecution) -> Result<(), StoreError> {
        let mut entry = self
            .executions
            .get_mut(&execution.id)
            .ok_or_else(|| StoreError::not_found("execution", execution.id.clone()))?;
        entry.1 = execution.clone();
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<FlowExecution>, StoreError> {
        Ok(self.executions.get(execution_id).map(|e| e.1.clone()))
    }

    async fn find_active_by_conversation(&self, conversation_id: &str) -> Result<Option<FlowExecution>, StoreError> {
        Ok(self
            .executions
            .iter()
            .filter(|e| e.1.conversation_id == conversation_id && e.1.is_active())
            .max_by_key(|e| e.0)
            .map(|e| e.1.clone()))
    }

    async fn list_by_flow(&self, flow_id: &str, limit: usize) -> Result<Vec<FlowExecution>, StoreError> {
        let mut runs: Vec<(u64, FlowExecution)> = self
            .executions
            .iter()
            .filter(|e| e.1.flow_id == flow_id)
            .map(|e| e.value().clone())
            .collect();
        runs.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at).then(b.0.cmp(&a.0)));
        Ok(runs.into_iter().take(limit).map(|(_, e)| e).collect())
    }

    async fn delete_by_flow(&self, flow_id: &str) -> Result<usize, StoreError> {
        let before = self.executions.len();
        self.executions.retain(|_, e| e.1.flow_id != flow_id);
        Ok(before - self.executions.len())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

#[async_trait]
impl ConversationStoreType for InMemoryStore {
    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.get(conversation_id).map(|c| c.clone()))
    }

    async fn save_conversation(&self, conversation: Conversation) -> Result<(), StoreError> {
        self.conversations.insert(conversation.id.clone(), conversation);
        Ok(())
    }

    async fn update_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
        assigned_to: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let mut conversation = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::not_found("conversation", conversation_id))?;
        conversation.status = status;
        if let Some(agent) = assigned_to {
            conversation.assigned_to_id = Some(agent.to_string());
        }
        conversation.updated_at = Utc::now();
        Ok(conversation.clone())
    }

    async fn record_message(&self, message: MessageRecord) -> Result<(), StoreError> {
        self.messages
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn count_messages(&self, conversation_id: &str) -> Result<usize, StoreError> {
        Ok(self.messages.get(conversation_id).map(|m| m.len()).unwrap_or(0))
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
