use std::{fmt, sync::Arc, time::Duration};
use serde_json::Value;
use tracing::{debug, info, warn};
use wa_transport::{MessageDirection, MessageSender};

use crate::config::EngineSettings;
use crate::conversation::{Conversation, ConversationStatus, MessageRecord};
use crate::error::FlowError;
use crate::flow::condition::evaluate_condition;
use crate::flow::execution::FlowExecution;
use crate::flow::model::{
    ActionConfig, ConditionConfig, Edge, HandoffConfig, NodeKind, WebhookConfig,
};
use crate::flow::state::{
    variables_to_json, StateValue, DEFAULT_SAVE_AS, LAST_USER_RESPONSE, WEBHOOK_ERROR, WEBHOOK_RESPONSE,
};
use crate::store::{ConversationStore, FlowStore};
use crate::util::{lookup_variable, render_template};
use crate::webhook::{WebhookCaller, WebhookRequest};

#[derive(Debug, Clone, PartialEq)]
pub enum NodeError {
    InvalidConfig { node_id: String, reason: String },
    SendFailed { node_id: String, reason: String },
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::InvalidConfig { node_id, reason } => {
                write!(f, "Invalid config on node {}: {}", node_id, reason)
            }
            NodeError::SendFailed { node_id, reason } => {
                write!(f, "Failed to send message from node {}: {}", node_id, reason)
            }
        }
    }
}

impl std::error::Error for NodeError {}

/// What the walker does after a node ran.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// Follow the first active outgoing edge.
    Advance,
    /// Jump to the chosen target; `None` completes the run.
    Goto(Option<String>),
    /// Run is waiting for user input.
    Paused,
    /// The node already finished the run.
    Completed,
    /// Continue after the given duration.
    Delay(Duration),
}

/// Everything a node needs to perform its side effects for one conversation.
#[derive(Clone, Debug)]
pub struct NodeContext {
    flows: FlowStore,
    conversations: ConversationStore,
    sender: Arc<dyn MessageSender>,
    webhooks: Arc<dyn WebhookCaller>,
    settings: Arc<EngineSettings>,
    conversation: Conversation,
}

impl NodeContext {
    pub fn new(
        flows: FlowStore,
        conversations: ConversationStore,
        sender: Arc<dyn MessageSender>,
        webhooks: Arc<dyn WebhookCaller>,
        settings: Arc<EngineSettings>,
        conversation: Conversation,
    ) -> Self {
        Self { flows, conversations, sender, webhooks, settings, conversation }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Renders `text` against the run's variables, sends it to the contact
    /// and records it as an outgoing message.
    async fn send(&self, node_id: &str, exec: &FlowExecution, text: &str) -> Result<(), FlowError> {
        let rendered = render_template(text, &exec.variables);
        if rendered.trim().is_empty() {
            warn!(node_id, "skipping empty message");
            return Ok(());
        }
        self.sender
            .send_message(&exec.instance_id, &self.conversation.contact_id, &rendered)
            .await
            .map_err(|e| NodeError::SendFailed { node_id: node_id.to_string(), reason: e.to_string() })?;
        self.conversations
            .record_message(MessageRecord::new(&self.conversation.id, MessageDirection::Outgoing, &rendered))
            .await?;
        Ok(())
    }
}

/// Stores a user's answer on a paused run: always under `lastUserResponse`,
/// and for question nodes also under `saveAs` (default `userResponse`).
pub fn store_user_response(kind: &NodeKind, exec: &mut FlowExecution, response: &str) {
    exec.set_variable(LAST_USER_RESPONSE, response);
    if let NodeKind::Question(config) = kind {
        let key = config
            .save_as
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .unwrap_or(DEFAULT_SAVE_AS);
        exec.set_variable(key, response);
    }
}

impl NodeKind {
    /// Performs this node's side effect on `exec` and tells the walker how
    /// to continue.
    #[tracing::instrument(name = "node_process", skip(self, exec, ctx), fields(node_type = %self.type_name(), execution_id = %exec.id))]
    pub async fn process(
        &self,
        node_id: &str,
        exec: &mut FlowExecution,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, FlowError> {
        match self {
            NodeKind::Start => Ok(NodeOutcome::Advance),
            NodeKind::Message(config) => {
                ctx.send(node_id, exec, &config.message).await?;
                Ok(NodeOutcome::Advance)
            }
            NodeKind::Question(config) => {
                ctx.send(node_id, exec, &config.question).await?;
                exec.pause()?;
                Ok(NodeOutcome::Paused)
            }
            NodeKind::Condition(config) => {
                let edges = ctx.flows.edges_from(&exec.flow_id, node_id).await?;
                Ok(NodeOutcome::Goto(choose_branch(config, edges, exec)))
            }
            NodeKind::Delay(config) => {
                let millis = config.delay.unwrap_or(ctx.settings.default_delay.as_millis() as u64);
                Ok(NodeOutcome::Delay(Duration::from_millis(millis)))
            }
            NodeKind::Action(action) => {
                run_action(node_id, action, exec, ctx).await?;
                Ok(NodeOutcome::Advance)
            }
            NodeKind::Webhook(config) => {
                call_webhook(config, exec, ctx).await;
                Ok(NodeOutcome::Advance)
            }
            NodeKind::HumanHandoff(config) => {
                hand_off(node_id, config, exec, ctx).await?;
                exec.complete()?;
                Ok(NodeOutcome::Completed)
            }
            NodeKind::End(config) => {
                if let Some(message) = &config.message {
                    ctx.send(node_id, exec, message).await?;
                }
                exec.complete()?;
                Ok(NodeOutcome::Completed)
            }
            NodeKind::Unknown { type_name, .. } => {
                warn!(node_id, node_type = %type_name, "unknown node type, advancing");
                Ok(NodeOutcome::Advance)
            }
        }
    }
}

/// Picks the target of a condition node. Conditioned edges are tried in
/// `order`; the first default edge (unconditioned or labelled `default`)
/// is the fallback.
fn choose_branch(config: &ConditionConfig, mut edges: Vec<Edge>, exec: &FlowExecution) -> Option<String> {
    edges.sort_by_key(|e| e.order);

    let taken = edges.iter().find(|edge| match &edge.condition {
        Some(cond) if !edge.is_default() => {
            let variable = cond.variable.as_deref().or(config.variable.as_deref());
            let value = variable.and_then(|name| lookup_variable(&exec.variables, name));
            evaluate_condition(value, &cond.operator, &cond.compare_value)
        }
        _ => false,
    });

    taken
        .or_else(|| edges.iter().find(|e| e.is_default()))
        .map(|e| e.target_node_id.clone())
}

async fn run_action(
    node_id: &str,
    action: &ActionConfig,
    exec: &mut FlowExecution,
    ctx: &NodeContext,
) -> Result<(), FlowError> {
    match action {
        ActionConfig::SetVariable { variable_name, variable_value } => {
            if variable_name.trim().is_empty() {
                return Err(NodeError::InvalidConfig {
                    node_id: node_id.to_string(),
                    reason: "set_variable needs a variableName".into(),
                }
                .into());
            }
            let value = match variable_value {
                Value::String(s) => StateValue::String(render_template(s, &exec.variables)),
                other => StateValue::from(other.clone()),
            };
            exec.set_variable(variable_name.trim(), value);
        }
        ActionConfig::AddTag { tag } => {
            info!(node_id, tag = ?tag, "add_tag has no tag store, ignoring");
        }
        ActionConfig::ChangeStatus { status } => {
            ctx.conversations
                .update_status(&exec.conversation_id, *status, None)
                .await?;
        }
        ActionConfig::Unsupported => {
            warn!(node_id, "unsupported action, skipping");
        }
    }
    Ok(())
}

/// Webhook failures are stored on the run, never raised.
async fn call_webhook(config: &WebhookConfig, exec: &mut FlowExecution, ctx: &NodeContext) {
    let headers = config
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), render_template(v, &exec.variables)))
        .collect();
    let request = WebhookRequest {
        url: render_template(&config.url, &exec.variables),
        method: config.method.clone(),
        headers,
        body: WebhookRequest::node_body(&exec.conversation_id, variables_to_json(&exec.variables), &config.payload),
    };

    match ctx.webhooks.call(request).await {
        Ok(response) => {
            debug!(execution_id = %exec.id, "webhook succeeded");
            exec.set_variable(WEBHOOK_RESPONSE, response);
        }
        Err(e) => {
            warn!(execution_id = %exec.id, error = %e, "webhook failed");
            exec.set_variable(WEBHOOK_ERROR, e.to_string());
        }
    }
}

async fn hand_off(
    node_id: &str,
    config: &HandoffConfig,
    exec: &FlowExecution,
    ctx: &NodeContext,
) -> Result<(), FlowError> {
    let assignee = config.assign_to.as_deref().map(str::trim).filter(|a| !a.is_empty());
    ctx.conversations
        .update_status(&exec.conversation_id, ConversationStatus::Pending, assignee)
        .await?;
    info!(conversation_id = %exec.conversation_id, assignee = ?assignee, "conversation handed off");

    let message = config
        .message
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or(ctx.settings.handoff_message.as_str());
    ctx.send(node_id, exec, message).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::execution::ExecutionStatus;
    use crate::flow::model::{
        ConditionOperator, DelayConfig, EndConfig, Flow, FlowDefinition, FlowNode, MessageConfig,
        QuestionConfig, TriggerKind,
    };
    use crate::flow::state::Variables;
    use crate::store::Stores;
    use crate::webhook::WebhookError;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;
    use wa_transport::RecordingTransport;

    #[derive(Default)]
    struct StubWebhook {
        reply: Option<Value>,
        seen: Mutex<Vec<WebhookRequest>>,
    }

    #[async_trait]
    impl WebhookCaller for StubWebhook {
        async fn call(&self, request: WebhookRequest) -> Result<Value, WebhookError> {
            self.seen.lock().await.push(request);
            match &self.reply {
                Some(v) => Ok(v.clone()),
                None => Err(WebhookError::Status { status: 503, body: String::new() }),
            }
        }

        fn name(&self) -> &'static str {
            "stub"
        }
    }

    struct Fixture {
        stores: Stores,
        transport: Arc<RecordingTransport>,
        webhook: Arc<StubWebhook>,
        ctx: NodeContext,
    }

    async fn fixture(edges: Vec<Edge>, webhook_reply: Option<Value>) -> Fixture {
        let stores = Stores::in_memory();
        let conversation = Conversation::new("c1", "inst", "5511999990000");
        stores.conversations.save_conversation(conversation.clone()).await.unwrap();

        let mut def = FlowDefinition::new(Flow::new("f", "f", "inst", TriggerKind::Manual));
        def.edges = edges;
        stores.flows.publish(def).await.unwrap();

        let transport = RecordingTransport::new();
        let webhook = Arc::new(StubWebhook { reply: webhook_reply, ..Default::default() });
        let ctx = NodeContext::new(
            stores.flows.clone(),
            stores.conversations.clone(),
            transport.clone(),
            webhook.clone(),
            Arc::new(EngineSettings::default()),
            conversation,
        );
        Fixture { stores, transport, webhook, ctx }
    }

    fn exec_with(vars: &[(&str, StateValue)]) -> FlowExecution {
        let variables: Variables = vars.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        FlowExecution::new("f", "c1", "inst", "start", variables)
    }

    #[tokio::test]
    async fn message_node_substitutes_and_records() {
        let fx = fixture(vec![], None).await;
        let mut exec = exec_with(&[("name", "World".into())]);
        let kind = NodeKind::Message(MessageConfig { message: "Hi {{name}}".into() });

        let outcome = kind.process("m", &mut exec, &fx.ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::Advance);
        assert_eq!(fx.transport.texts().await, vec!["Hi World".to_string()]);
        assert_eq!(fx.stores.conversations.count_messages("c1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn question_pauses() {
        let fx = fixture(vec![], None).await;
        let mut exec = exec_with(&[]);
        let kind = NodeKind::Question(QuestionConfig { question: "Idade?".into(), save_as: Some("age".into()) });

        let outcome = kind.process("q", &mut exec, &fx.ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::Paused);
        assert_eq!(exec.status, ExecutionStatus::Paused);

        store_user_response(&kind, &mut exec, "42");
        assert_eq!(exec.variable("age"), Some(&StateValue::from("42")));
        assert_eq!(exec.variable(LAST_USER_RESPONSE), Some(&StateValue::from("42")));
    }

    #[tokio::test]
    async fn response_defaults_to_user_response_key() {
        let mut exec = exec_with(&[]);
        store_user_response(&NodeKind::Question(QuestionConfig::default()), &mut exec, "sim");
        assert_eq!(exec.variable(DEFAULT_SAVE_AS), Some(&StateValue::from("sim")));

        let mut other = exec_with(&[]);
        store_user_response(&NodeKind::Delay(DelayConfig::default()), &mut other, "sim");
        assert!(other.variable(DEFAULT_SAVE_AS).is_none());
        assert!(other.variable(LAST_USER_RESPONSE).is_some());
    }

    #[tokio::test]
    async fn condition_prefers_match_over_default() {
        let edges = vec![
            Edge::new("cond", "fallback").with_label("default"),
            Edge::new("cond", "high")
                .when(None, ConditionOperator::GreaterThan, json!("50"))
                .with_order(1),
        ];
        let fx = fixture(edges, None).await;
        let config = ConditionConfig { variable: Some("score".into()) };

        let mut high = exec_with(&[("score", "85".into())]);
        let outcome = NodeKind::Condition(config.clone()).process("cond", &mut high, &fx.ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::Goto(Some("high".into())));

        let mut low = exec_with(&[("score", "10".into())]);
        let outcome = NodeKind::Condition(config).process("cond", &mut low, &fx.ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::Goto(Some("fallback".into())));
    }

    #[test]
    fn condition_edges_follow_order_and_edge_variable() {
        let edges = vec![
            Edge::new("c", "second").when(Some("plan"), ConditionOperator::Contains, json!("pro")).with_order(2),
            Edge::new("c", "first").when(Some("plan"), ConditionOperator::StartsWith, json!("PRO")).with_order(1),
        ];
        let exec = exec_with(&[("plan", "professional".into())]);
        let chosen = choose_branch(&ConditionConfig { variable: Some("unused".into()) }, edges, &exec);
        assert_eq!(chosen.as_deref(), Some("first"));
    }

    #[test]
    fn condition_without_match_or_default_completes() {
        let edges = vec![Edge::new("c", "x").when(Some("v"), ConditionOperator::Equals, json!("yes"))];
        let exec = exec_with(&[("v", "no".into())]);
        assert_eq!(choose_branch(&ConditionConfig::default(), edges, &exec), None);
    }

    #[tokio::test]
    async fn delay_uses_default_when_unset() {
        let fx = fixture(vec![], None).await;
        let mut exec = exec_with(&[]);
        let outcome = NodeKind::Delay(DelayConfig { delay: None }).process("d", &mut exec, &fx.ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::Delay(Duration::from_millis(1000)));

        let outcome = NodeKind::Delay(DelayConfig { delay: Some(5) }).process("d", &mut exec, &fx.ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::Delay(Duration::from_millis(5)));
    }

    #[tokio::test]
    async fn actions_mutate_variables_and_conversation() {
        let fx = fixture(vec![], None).await;
        let mut exec = exec_with(&[("name", "Ana".into())]);

        let set = NodeKind::Action(ActionConfig::SetVariable {
            variable_name: "greeting".into(),
            variable_value: json!("Oi {{name}}"),
        });
        set.process("a1", &mut exec, &fx.ctx).await.unwrap();
        assert_eq!(exec.variable("greeting"), Some(&StateValue::from("Oi Ana")));

        let status = NodeKind::Action(ActionConfig::ChangeStatus { status: ConversationStatus::Closed });
        status.process("a2", &mut exec, &fx.ctx).await.unwrap();
        let conv = fx.stores.conversations.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(conv.status, ConversationStatus::Closed);

        let tag = NodeKind::Action(ActionConfig::AddTag { tag: Some("vip".into()) });
        assert_eq!(tag.process("a3", &mut exec, &fx.ctx).await.unwrap(), NodeOutcome::Advance);
    }

    #[tokio::test]
    async fn empty_variable_name_is_a_config_error() {
        let fx = fixture(vec![], None).await;
        let mut exec = exec_with(&[]);
        let set = NodeKind::Action(ActionConfig::SetVariable { variable_name: " ".into(), variable_value: json!(1) });
        let err = set.process("a", &mut exec, &fx.ctx).await.unwrap_err();
        assert!(matches!(err, FlowError::Node(NodeError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn webhook_stores_response_or_error() {
        let fx = fixture(vec![], Some(json!({"orderId": 99}))).await;
        let mut exec = exec_with(&[("name", "Ana".into())]);
        let config = WebhookConfig {
            url: "https://crm.example/hooks/{{name}}".into(),
            method: "POST".into(),
            headers: Default::default(),
            payload: serde_json::Map::new(),
        };
        NodeKind::Webhook(config.clone()).process("w", &mut exec, &fx.ctx).await.unwrap();
        let response = exec.variable(WEBHOOK_RESPONSE).and_then(|v| v.as_map()).unwrap();
        assert_eq!(response.get("orderId"), Some(&StateValue::Number(99.0)));

        let seen = fx.webhook.seen.lock().await;
        assert_eq!(seen[0].url, "https://crm.example/hooks/Ana");
        assert_eq!(seen[0].body["conversationId"], "c1");
        drop(seen);

        let failing = fixture(vec![], None).await;
        let mut exec = exec_with(&[]);
        let outcome = NodeKind::Webhook(config).process("w", &mut exec, &failing.ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::Advance);
        assert_eq!(exec.variable(WEBHOOK_ERROR), Some(&StateValue::from("HTTP 503")));
        assert_eq!(exec.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn handoff_assigns_and_completes() {
        let fx = fixture(vec![], None).await;
        let mut exec = exec_with(&[]);
        let kind = NodeKind::HumanHandoff(HandoffConfig { message: None, assign_to: Some("agent-1".into()) });

        let outcome = kind.process("h", &mut exec, &fx.ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::Completed);
        assert_eq!(exec.status, ExecutionStatus::Completed);

        let conv = fx.stores.conversations.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(conv.status, ConversationStatus::Pending);
        assert_eq!(conv.assigned_to_id.as_deref(), Some("agent-1"));
        assert_eq!(fx.transport.texts().await, vec![EngineSettings::default().handoff_message]);
    }

    #[tokio::test]
    async fn end_sends_optional_message() {
        let fx = fixture(vec![], None).await;
        let mut exec = exec_with(&[("name", "Alice".into())]);
        NodeKind::End(EndConfig { message: Some("Bye {{name}}".into()) })
            .process("e", &mut exec, &fx.ctx)
            .await
            .unwrap();
        assert_eq!(fx.transport.texts().await, vec!["Bye Alice".to_string()]);

        let mut silent = exec_with(&[]);
        NodeKind::End(EndConfig::default()).process("e", &mut silent, &fx.ctx).await.unwrap();
        assert_eq!(silent.status, ExecutionStatus::Completed);
        assert_eq!(fx.transport.texts().await.len(), 1);
    }

    #[tokio::test]
    async fn send_failure_names_the_node() {
        let fx = fixture(vec![], None).await;
        fx.transport.set_offline(true);
        let mut exec = exec_with(&[]);
        let err = NodeKind::Message(MessageConfig { message: "oi".into() })
            .process("m7", &mut exec, &fx.ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("m7"));
    }

    #[tokio::test]
    async fn unknown_node_advances() {
        let fx = fixture(vec![], None).await;
        let mut exec = exec_with(&[]);
        let kind = FlowNode::new("x", NodeKind::Unknown { type_name: "carousel".into(), config: json!({}) }).kind;
        assert_eq!(kind.process("x", &mut exec, &fx.ctx).await.unwrap(), NodeOutcome::Advance);
    }
}
