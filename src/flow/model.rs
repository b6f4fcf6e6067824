use std::{collections::HashMap, fmt, fs, path::Path};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use crate::conversation::ConversationStatus;
use crate::error::FlowError;

fn default_true() -> bool {
    true
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// How a flow gets started.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Keyword,
    Welcome,
    Manual,
    Condition,
}

/// A bot conversation definition bound to one WhatsApp instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(rename = "triggerType")]
    pub trigger: TriggerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_value: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        instance_id: impl Into<String>,
        trigger: TriggerKind,
    ) -> Self {
        let now = Utc::now();
        Flow {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            instance_id: instance_id.into(),
            created_by: None,
            trigger,
            trigger_value: None,
            priority: 0,
            is_active: true,
            usage_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_trigger_value(mut self, value: impl Into<String>) -> Self {
        self.trigger_value = Some(value.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Case-insensitive substring match of the trigger value against an
    /// already-normalized message. Empty trigger values never match.
    pub fn matches_text(&self, normalized_text: &str) -> bool {
        match self.trigger_value.as_deref().map(|v| v.trim().to_lowercase()) {
            Some(keyword) if !keyword.is_empty() => normalized_text.contains(&keyword),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Accepts `1500` as well as `"1500"`; editors are not consistent about it.
fn deserialize_millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid delay `{}`", n))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("invalid delay `{}`", s))),
        Some(other) => Err(D::Error::custom(format!("invalid delay `{}`", other))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MessageConfig {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct QuestionConfig {
    #[serde(default)]
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConditionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DelayConfig {
    /// Milliseconds; `None` falls back to the engine default.
    #[serde(default, deserialize_with = "deserialize_millis", skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ActionConfig {
    SetVariable {
        variable_name: String,
        #[serde(default)]
        variable_value: Value,
    },
    AddTag {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
    },
    ChangeStatus {
        status: ConversationStatus,
    },
    #[serde(other)]
    Unsupported,
}

/// An action config without an `action` name is kept as `Unsupported`
/// so the node is skipped at run time instead of failing the whole flow.
fn action_config(config: Value) -> Result<ActionConfig, serde_json::Error> {
    match config.get("action") {
        None | Some(Value::Null) => Ok(ActionConfig::Unsupported),
        Some(_) => serde_json::from_value(config),
    }
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HandoffConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EndConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The closed set of node behaviors, each with its typed config.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Start,
    Message(MessageConfig),
    Question(QuestionConfig),
    Condition(ConditionConfig),
    Delay(DelayConfig),
    Action(ActionConfig),
    Webhook(WebhookConfig),
    HumanHandoff(HandoffConfig),
    End(EndConfig),
    /// A type tag this build does not know. Kept so definitions round-trip;
    /// the interpreter logs it and advances.
    Unknown { type_name: String, config: Value },
}

impl NodeKind {
    pub fn type_name(&self) -> &str {
        match self {
            NodeKind::Start => "start",
            NodeKind::Message(_) => "message",
            NodeKind::Question(_) => "question",
            NodeKind::Condition(_) => "condition",
            NodeKind::Delay(_) => "delay",
            NodeKind::Action(_) => "action",
            NodeKind::Webhook(_) => "webhook",
            NodeKind::HumanHandoff(_) => "human_handoff",
            NodeKind::End(_) => "end",
            NodeKind::Unknown { type_name, .. } => type_name,
        }
    }

    /// Nodes at which a walk stops and later resumes from outside.
    pub fn is_suspension_point(&self) -> bool {
        matches!(self, NodeKind::Question(_) | NodeKind::Delay(_))
    }

    fn from_raw(type_name: &str, config: Value) -> Result<Self, serde_json::Error> {
        let config = match config {
            Value::Null => json!({}),
            other => other,
        };
        Ok(match type_name {
            "start" => NodeKind::Start,
            "message" => NodeKind::Message(serde_json::from_value(config)?),
            "question" => NodeKind::Question(serde_json::from_value(config)?),
            "condition" => NodeKind::Condition(serde_json::from_value(config)?),
            "delay" => NodeKind::Delay(serde_json::from_value(config)?),
            "action" => NodeKind::Action(action_config(config)?),
            "webhook" => NodeKind::Webhook(serde_json::from_value(config)?),
            "human_handoff" => NodeKind::HumanHandoff(serde_json::from_value(config)?),
            "end" => NodeKind::End(serde_json::from_value(config)?),
            other => NodeKind::Unknown { type_name: other.to_string(), config },
        })
    }

    fn config_value(&self) -> Value {
        let value = match self {
            NodeKind::Start => Ok(json!({})),
            NodeKind::Message(c) => serde_json::to_value(c),
            NodeKind::Question(c) => serde_json::to_value(c),
            NodeKind::Condition(c) => serde_json::to_value(c),
            NodeKind::Delay(c) => serde_json::to_value(c),
            NodeKind::Action(c) => serde_json::to_value(c),
            NodeKind::Webhook(c) => serde_json::to_value(c),
            NodeKind::HumanHandoff(c) => serde_json::to_value(c),
            NodeKind::End(c) => serde_json::to_value(c),
            NodeKind::Unknown { config, .. } => Ok(config.clone()),
        };
        value.unwrap_or(Value::Null)
    }
}

/// On-disk / on-wire shape of a node: a string type tag plus free-form config.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RawNode {
    pub node_id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

/// One step of a flow graph, addressed by its `node_id` string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct FlowNode {
    pub node_id: String,
    pub kind: NodeKind,
    pub position: Option<Position>,
}

impl FlowNode {
    pub fn new(node_id: impl Into<String>, kind: NodeKind) -> Self {
        Self { node_id: node_id.into(), kind, position: None }
    }

    pub fn type_name(&self) -> &str {
        self.kind.type_name()
    }
}

impl TryFrom<RawNode> for FlowNode {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let kind = NodeKind::from_raw(&raw.node_type, raw.config)
            .map_err(|e| format!("node `{}` ({}): {}", raw.node_id, raw.node_type, e))?;
        Ok(FlowNode { node_id: raw.node_id, kind, position: raw.position })
    }
}

impl From<FlowNode> for RawNode {
    fn from(node: FlowNode) -> Self {
        RawNode {
            node_type: node.kind.type_name().to_string(),
            config: node.kind.config_value(),
            node_id: node.node_id,
            position: node.position,
        }
    }
}

/// Comparison applied by an edge condition. Unrecognised operator names are
/// kept verbatim and evaluate to `true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionOperator {
    Equals,
    Contains,
    StartsWith,
    GreaterThan,
    LessThan,
    Other(String),
}

impl From<String> for ConditionOperator {
    fn from(s: String) -> Self {
        match s.as_str() {
            "equals" => ConditionOperator::Equals,
            "contains" => ConditionOperator::Contains,
            "starts_with" => ConditionOperator::StartsWith,
            "greater_than" => ConditionOperator::GreaterThan,
            "less_than" => ConditionOperator::LessThan,
            _ => ConditionOperator::Other(s),
        }
    }
}

impl From<ConditionOperator> for String {
    fn from(op: ConditionOperator) -> Self {
        op.to_string()
    }
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionOperator::Equals => f.write_str("equals"),
            ConditionOperator::Contains => f.write_str("contains"),
            ConditionOperator::StartsWith => f.write_str("starts_with"),
            ConditionOperator::GreaterThan => f.write_str("greater_than"),
            ConditionOperator::LessThan => f.write_str("less_than"),
            ConditionOperator::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    #[schemars(with = "String")]
    pub operator: ConditionOperator,
    #[serde(default)]
    pub compare_value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    #[serde(default = "new_id")]
    pub id: String,
    pub source_node_id: String,
    pub target_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<EdgeCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub order: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Edge {
            id: new_id(),
            source_node_id: source.into(),
            target_node_id: target.into(),
            condition: None,
            label: None,
            order: 0,
            is_active: true,
        }
    }

    pub fn when(mut self, variable: Option<&str>, operator: ConditionOperator, compare_value: Value) -> Self {
        self.condition = Some(EdgeCondition {
            variable: variable.map(str::to_string),
            operator,
            compare_value,
        });
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Fallback edge of a condition node: unconditioned, or labelled `default`.
    pub fn is_default(&self) -> bool {
        self.condition.is_none() || self.label.as_deref() == Some("default")
    }
}

/// A complete flow as the editor publishes it and as flow files store it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FlowDefinition {
    pub flow: Flow,
    #[schemars(with = "Vec<RawNode>")]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl FlowDefinition {
    pub fn new(flow: Flow) -> Self {
        Self { flow, nodes: Vec::new(), edges: Vec::new() }
    }

    pub fn node(mut self, node: FlowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Chains `a -> b -> c ...` with unconditioned edges.
    pub fn chain(mut self, node_ids: &[&str]) -> Self {
        for pair in node_ids.windows(2) {
            self.edges.push(Edge::new(pair[0], pair[1]));
        }
        self
    }

    pub fn find_node(&self, node_id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn start_node(&self) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| matches!(n.kind, NodeKind::Start))
    }

    /// Loads a `.json`, `.yaml` or `.yml` flow file.
    pub fn load_from_file(path: &Path) -> Result<Self, FlowError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| FlowError::Io(format!("read error on {}: {}", path.display(), e)))?;

        match extension_of(path).as_str() {
            "json" => serde_json::from_str(&contents)
                .map_err(|e| FlowError::Serialization(format!("JSON parse error: {}", e))),
            "yaml" | "yml" => serde_yaml_bw::from_str(&contents)
                .map_err(|e| FlowError::Serialization(format!("YAML parse error: {}", e))),
            other => Err(FlowError::Serialization(format!(
                "unsupported extension “{}” (expected .json, .yaml or .yml)",
                other
            ))),
        }
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), FlowError> {
        let contents = match extension_of(path).as_str() {
            "json" => serde_json::to_string_pretty(self)
                .map_err(|e| FlowError::Serialization(e.to_string()))?,
            "yaml" | "yml" => serde_yaml_bw::to_string(self)
                .map_err(|e| FlowError::Serialization(e.to_string()))?,
            other => {
                return Err(FlowError::Serialization(format!(
                    "unsupported extension “{}” (expected .json, .yaml or .yml)",
                    other
                )));
            }
        };
        fs::write(path, contents).map_err(|e| FlowError::Io(e.to_string()))
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|os| os.to_str())
        .unwrap_or_default()
        .to_lowercase()
}
