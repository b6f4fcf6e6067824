use std::{
    fs,
    path::Path,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};
use opentelemetry::KeyValue;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use wa_transport::{InboundMessage, MessageSender};

use crate::config::EngineSettings;
use crate::conversation::Conversation;
use crate::error::{FlowError, StoreError};
use crate::flow::execution::{ExecutionStatus, FlowExecution};
use crate::flow::model::{Flow, FlowDefinition, FlowNode, TriggerKind};
use crate::flow::session::ConversationLocks;
use crate::flow::state::Variables;
use crate::flow::validation::{validate_flow, ValidationReport};
use crate::logger::{flow_event, EngineMetrics};
use crate::node::{store_user_response, NodeContext, NodeOutcome};
use crate::store::Stores;
use crate::webhook::WebhookCaller;

/// Where a walk picks up.
enum Step {
    /// Execute this node.
    Run(FlowNode),
    /// Follow the first active edge out of this node id.
    After(String),
}

/// Starts, resumes and walks flow executions.
///
/// Every entry point that touches a conversation holds that conversation's
/// lock for its whole duration, so lookups and creates of executions never
/// interleave for one conversation.
pub struct FlowEngine {
    me: Weak<FlowEngine>,
    stores: Stores,
    sender: Arc<dyn MessageSender>,
    webhooks: Arc<dyn WebhookCaller>,
    settings: Arc<EngineSettings>,
    locks: ConversationLocks,
    scheduled: TaskTracker,
    metrics: EngineMetrics,
}

impl FlowEngine {
    pub fn new(
        stores: Stores,
        sender: Arc<dyn MessageSender>,
        webhooks: Arc<dyn WebhookCaller>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        let locks = ConversationLocks::new();
        Arc::new_cyclic(|me| FlowEngine {
            me: me.clone(),
            stores,
            sender,
            webhooks,
            settings: Arc::new(settings),
            locks,
            scheduled: TaskTracker::new(),
            metrics: EngineMetrics::new(),
        })
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // ---- flow lifecycle -------------------------------------------------

    /// Publishes a definition. Validation findings are logged and returned
    /// but never block the publish.
    #[tracing::instrument(skip(self, definition), fields(flow_id = %definition.flow.id))]
    pub async fn publish(&self, definition: FlowDefinition) -> Result<ValidationReport, FlowError> {
        let report = validate_flow(&definition);
        for e in &report.errors {
            error!("flow `{}`: {}", definition.flow.id, e);
        }
        for w in &report.warnings {
            warn!("flow `{}`: {}", definition.flow.id, w);
        }
        self.stores.flows.publish(definition).await?;
        Ok(report)
    }

    pub async fn set_active(&self, flow_id: &str, active: bool) -> Result<(), FlowError> {
        self.stores.flows.set_active(flow_id, active).await?;
        info!(flow_id, active, "flow activation changed");
        Ok(())
    }

    /// Deletes a flow with its nodes, edges and executions.
    pub async fn delete_flow(&self, flow_id: &str) -> Result<(), FlowError> {
        self.stores.flows.delete_flow(flow_id).await?;
        let removed = self.stores.executions.delete_by_flow(flow_id).await?;
        info!(flow_id, executions = removed, "flow deleted");
        Ok(())
    }

    /// Publishes every `.json`, `.yaml` and `.yml` flow file in `dir`.
    /// Files that fail to load are logged and skipped.
    pub async fn load_flows_from_dir(&self, dir: &Path) -> Result<usize, FlowError> {
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| FlowError::Io(e.to_string()))?;
        }
        let entries = fs::read_dir(dir).map_err(|e| FlowError::Io(e.to_string()))?;
        let mut loaded = 0;
        for entry in entries {
            let path = entry.map_err(|e| FlowError::Io(e.to_string()))?.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            if !matches!(ext, "json" | "yaml" | "yml") {
                continue;
            }
            match FlowDefinition::load_from_file(&path) {
                Ok(def) => {
                    self.publish(def).await?;
                    loaded += 1;
                }
                Err(e) => error!("Failed to load {}: {}", path.display(), e),
            }
        }
        Ok(loaded)
    }

    pub async fn list_executions(&self, flow_id: &str, limit: usize) -> Result<Vec<FlowExecution>, FlowError> {
        Ok(self.stores.executions.list_by_flow(flow_id, limit).await?)
    }

    // ---- entry points ---------------------------------------------------

    /// Transport entry point: resumes a paused run of the conversation, or
    /// else looks for a flow to start. Errors are logged, never returned.
    #[tracing::instrument(skip(self, message), fields(conversation_id = %message.conversation_id))]
    pub async fn handle_inbound(&self, message: &InboundMessage) -> Option<FlowExecution> {
        let _guard = self.locks.acquire(&message.conversation_id).await;

        let result = match self.stores.executions.find_active_by_conversation(&message.conversation_id).await {
            Ok(Some(exec)) if exec.status == ExecutionStatus::Paused => {
                self.resume_locked(exec, &message.text).await
            }
            Ok(Some(exec)) => {
                debug!(execution_id = %exec.id, "run in progress, message ignored by the engine");
                Ok(None)
            }
            Ok(None) => {
                self.match_triggers_locked(&message.normalized_text(), &message.conversation_id, &message.instance_id)
                    .await
            }
            Err(e) => Err(e.into()),
        };

        result.unwrap_or_else(|e| {
            error!(error = %e, "inbound message handling failed");
            None
        })
    }

    /// Starts the first matching keyword flow, or failing that the first
    /// welcome flow when this is the conversation's first message.
    #[tracing::instrument(skip(self, message_text))]
    pub async fn check_triggers(&self, message_text: &str, conversation_id: &str, instance_id: &str) {
        let _guard = self.locks.acquire(conversation_id).await;
        let text = message_text.trim().to_lowercase();
        if let Err(e) = self.match_triggers_locked(&text, conversation_id, instance_id).await {
            error!(error = %e, "trigger check failed");
        }
    }

    /// Feeds a user's answer to the conversation's paused run. Returns the
    /// run after it walked as far as it could, or `None` when nothing was
    /// paused.
    #[tracing::instrument(skip(self, user_response))]
    pub async fn continue_execution(
        &self,
        conversation_id: &str,
        user_response: &str,
    ) -> Result<Option<FlowExecution>, FlowError> {
        let _guard = self.locks.acquire(conversation_id).await;
        match self.stores.executions.find_active_by_conversation(conversation_id).await? {
            Some(exec) if exec.status == ExecutionStatus::Paused => self.resume_locked(exec, user_response).await,
            _ => Ok(None),
        }
    }

    /// Starts `flow_id` on a conversation regardless of its trigger kind.
    #[tracing::instrument(skip(self, variables))]
    pub async fn start_manual(
        &self,
        flow_id: &str,
        conversation_id: &str,
        variables: Variables,
    ) -> Result<FlowExecution, FlowError> {
        let _guard = self.locks.acquire(conversation_id).await;
        let flow = self
            .stores
            .flows
            .get_flow(flow_id)
            .await?
            .filter(|f| f.is_active)
            .ok_or_else(|| FlowError::not_found("active flow", flow_id))?;

        self.start_flow_locked(&flow, conversation_id, variables)
            .await?
            .ok_or_else(|| {
                StoreError::Conflict(format!("conversation `{}` already has an active execution", conversation_id))
                    .into()
            })
    }

    /// Runs `node` for `execution` and keeps walking until the run pauses,
    /// waits on a delay or ends. Node failures are recorded on the returned
    /// execution as `failed`.
    pub async fn execute_node(&self, execution: FlowExecution, node: FlowNode) -> Result<FlowExecution, FlowError> {
        let _guard = self.locks.acquire(&execution.conversation_id).await;
        let conversation = self.load_conversation(&execution.conversation_id).await?;
        Ok(self.walk(execution, Step::Run(node), conversation).await)
    }

    /// Follows the first active edge out of `current_node_id` in store
    /// order. No edge, or an edge to a missing node, completes the run.
    pub async fn move_to_next_node(
        &self,
        execution: FlowExecution,
        current_node_id: &str,
    ) -> Result<FlowExecution, FlowError> {
        let _guard = self.locks.acquire(&execution.conversation_id).await;
        let conversation = self.load_conversation(&execution.conversation_id).await?;
        Ok(self.walk(execution, Step::After(current_node_id.to_string()), conversation).await)
    }

    /// Waits until every pending delay continuation has run.
    pub async fn wait_for_scheduled(&self) {
        self.scheduled.close();
        self.scheduled.wait().await;
        self.scheduled.reopen();
    }

    // ---- internals (caller holds the conversation lock) -----------------

    async fn match_triggers_locked(
        &self,
        text: &str,
        conversation_id: &str,
        instance_id: &str,
    ) -> Result<Option<FlowExecution>, FlowError> {
        let keyword_flows = self.stores.flows.find_by_trigger(instance_id, TriggerKind::Keyword).await?;
        if let Some(flow) = keyword_flows.iter().find(|f| f.matches_text(text)) {
            info!(flow_id = %flow.id, "keyword trigger matched");
            return self.start_flow_locked(flow, conversation_id, Variables::new()).await;
        }

        let count = self.stores.conversations.count_messages(conversation_id).await?;
        if count <= 1 {
            let welcome = self.stores.flows.find_by_trigger(instance_id, TriggerKind::Welcome).await?;
            if let Some(flow) = welcome.first() {
                info!(flow_id = %flow.id, "welcome trigger matched");
                return self.start_flow_locked(flow, conversation_id, Variables::new()).await;
            }
        }
        Ok(None)
    }

    /// `None` when the conversation already has an active run.
    async fn start_flow_locked(
        &self,
        flow: &Flow,
        conversation_id: &str,
        variables: Variables,
    ) -> Result<Option<FlowExecution>, FlowError> {
        if let Some(active) = self.stores.executions.find_active_by_conversation(conversation_id).await? {
            debug!(execution_id = %active.id, "conversation already has an active run");
            return Ok(None);
        }
        let conversation = self.load_conversation(conversation_id).await?;
        let start = self
            .stores
            .flows
            .find_start_node(&flow.id)
            .await?
            .ok_or_else(|| FlowError::not_found("start node of flow", flow.id.clone()))?;

        let exec = FlowExecution::new(&flow.id, conversation_id, &flow.instance_id, &start.node_id, variables);
        self.stores.executions.create_execution(&exec).await?;
        self.stores.flows.increment_usage(&flow.id).await?;
        self.metrics
            .executions_started
            .add(1, &[KeyValue::new("flow_id", flow.id.clone())]);
        flow_event(&exec, "started");

        Ok(Some(self.walk(exec, Step::Run(start), conversation).await))
    }

    async fn resume_locked(&self, mut exec: FlowExecution, response: &str) -> Result<Option<FlowExecution>, FlowError> {
        let node = match self.stores.flows.get_node(&exec.flow_id, &exec.current_node_id).await? {
            Some(node) => node,
            None => {
                warn!(execution_id = %exec.id, node_id = %exec.current_node_id, "paused node no longer exists");
                self.finish(&mut exec).await?;
                return Ok(Some(exec));
            }
        };

        store_user_response(&node.kind, &mut exec, response);
        exec.resume()?;
        self.persist(&exec).await?;
        flow_event(&exec, "resumed");

        let conversation = self.load_conversation(&exec.conversation_id).await?;
        Ok(Some(self.walk(exec, Step::After(node.node_id), conversation).await))
    }

    async fn continue_after_delay(&self, conversation_id: &str, execution_id: &str, node_id: &str) {
        let _guard = self.locks.acquire(conversation_id).await;
        let exec = match self.stores.executions.get_execution(execution_id).await {
            Ok(Some(exec)) => exec,
            Ok(None) => {
                debug!(execution_id, "delayed run is gone");
                return;
            }
            Err(e) => {
                error!(execution_id, error = %e, "could not reload delayed run");
                return;
            }
        };
        if exec.status != ExecutionStatus::Running || exec.current_node_id != node_id {
            debug!(execution_id, status = %exec.status, "delayed run moved on, skipping");
            return;
        }
        match self.load_conversation(conversation_id).await {
            Ok(conversation) => {
                self.walk(exec, Step::After(node_id.to_string()), conversation).await;
            }
            Err(e) => error!(execution_id, error = %e, "delayed run lost its conversation"),
        }
    }

    async fn load_conversation(&self, conversation_id: &str) -> Result<Conversation, FlowError> {
        self.stores
            .conversations
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| FlowError::not_found("conversation", conversation_id))
    }

    fn node_context(&self, conversation: Conversation) -> NodeContext {
        NodeContext::new(
            self.stores.flows.clone(),
            self.stores.conversations.clone(),
            self.sender.clone(),
            self.webhooks.clone(),
            self.settings.clone(),
            conversation,
        )
    }

    /// Walks and turns any error into a failed run.
    async fn walk(&self, mut exec: FlowExecution, step: Step, conversation: Conversation) -> FlowExecution {
        let ctx = self.node_context(conversation);
        if let Err(e) = self.walk_inner(&mut exec, step, &ctx).await {
            error!(execution_id = %exec.id, node_id = %exec.current_node_id, error = %e, "flow execution failed");
            if exec.is_active() {
                if let Err(te) = exec.fail(e.to_string()) {
                    error!(execution_id = %exec.id, error = %te, "could not mark run failed");
                }
            }
            if let Err(pe) = self.persist(&exec).await {
                error!(execution_id = %exec.id, error = %pe, "could not persist failed run");
            }
            self.observe(&exec, "failed");
        }
        exec
    }

    async fn walk_inner(&self, exec: &mut FlowExecution, mut step: Step, ctx: &NodeContext) -> Result<(), FlowError> {
        let max_steps = self.settings.max_steps_per_walk;
        let mut executed = 0usize;

        loop {
            let node = match step {
                Step::Run(node) => node,
                Step::After(from) => match self.next_node(exec, &from).await? {
                    Some(node) => node,
                    None => return self.finish(exec).await,
                },
            };

            executed += 1;
            if executed > max_steps {
                return Err(FlowError::StepLimit(max_steps));
            }
            exec.move_to(&node.node_id)?;
            self.persist(exec).await?;

            let started = Instant::now();
            let outcome = node.kind.process(&node.node_id, exec, ctx).await?;
            self.metrics.record_node(node.type_name(), started.elapsed());

            step = match outcome {
                NodeOutcome::Advance => Step::After(node.node_id),
                NodeOutcome::Goto(Some(target)) => {
                    match self.stores.flows.get_node(&exec.flow_id, &target).await? {
                        Some(next) => Step::Run(next),
                        None => {
                            warn!(execution_id = %exec.id, target = %target, "branch target does not exist");
                            return self.finish(exec).await;
                        }
                    }
                }
                NodeOutcome::Goto(None) => return self.finish(exec).await,
                NodeOutcome::Paused => {
                    self.persist(exec).await?;
                    self.observe(exec, "paused");
                    return Ok(());
                }
                NodeOutcome::Completed => {
                    self.persist(exec).await?;
                    self.observe(exec, "completed");
                    return Ok(());
                }
                NodeOutcome::Delay(delay) => {
                    self.persist(exec).await?;
                    self.schedule_continuation(exec, delay);
                    return Ok(());
                }
            };
        }
    }

    /// First active edge out of `from`, in store order. Missing flow,
    /// missing edge and dangling target all yield `None`.
    async fn next_node(&self, exec: &FlowExecution, from: &str) -> Result<Option<FlowNode>, FlowError> {
        let edges = self.stores.flows.edges_from(&exec.flow_id, from).await?;
        let Some(edge) = edges.first() else {
            return Ok(None);
        };
        let target = self.stores.flows.get_node(&exec.flow_id, &edge.target_node_id).await?;
        if target.is_none() {
            warn!(execution_id = %exec.id, edge_id = %edge.id, target = %edge.target_node_id, "edge points to a missing node");
        }
        Ok(target)
    }

    async fn finish(&self, exec: &mut FlowExecution) -> Result<(), FlowError> {
        let already = exec.status == ExecutionStatus::Completed;
        exec.complete()?;
        self.persist(exec).await?;
        if !already {
            self.observe(exec, "completed");
        }
        Ok(())
    }

    async fn persist(&self, exec: &FlowExecution) -> Result<(), FlowError> {
        Ok(self.stores.executions.update_execution(exec).await?)
    }

    fn observe(&self, exec: &FlowExecution, event: &str) {
        let attrs = [KeyValue::new("flow_id", exec.flow_id.clone())];
        match exec.status {
            ExecutionStatus::Completed => self.metrics.executions_completed.add(1, &attrs),
            ExecutionStatus::Failed => self.metrics.executions_failed.add(1, &attrs),
            ExecutionStatus::Paused => self.metrics.executions_paused.add(1, &attrs),
            _ => {}
        }
        flow_event(exec, event);
    }

    fn schedule_continuation(&self, exec: &FlowExecution, delay: Duration) {
        let engine = self.me.clone();
        let conversation_id = exec.conversation_id.clone();
        let execution_id = exec.id.clone();
        let node_id = exec.current_node_id.clone();
        flow_event(exec, "delayed");
        debug!(execution_id = %execution_id, delay_ms = delay.as_millis() as u64, "scheduling continuation");

        self.scheduled.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(engine) = engine.upgrade() {
                engine.continue_after_delay(&conversation_id, &execution_id, &node_id).await;
            }
        });
    }
}
