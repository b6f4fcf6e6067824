use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// A fully rendered webhook call.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl WebhookRequest {
    /// Body sent by webhook nodes: the conversation, the variable bag and
    /// the node payload merged on top.
    pub fn node_body(conversation_id: &str, variables: Value, payload: &Map<String, Value>) -> Value {
        let mut body = Map::new();
        body.insert("conversationId".into(), Value::String(conversation_id.to_string()));
        body.insert("variables".into(), variables);
        for (k, v) in payload {
            body.insert(k.clone(), v.clone());
        }
        Value::Object(body)
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid HTTP method `{0}`")]
    InvalidMethod(String),

    #[error("could not build HTTP client: {0}")]
    Client(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status}")]
    Status { status: u16, body: String },
}

/// Outbound HTTP used by `webhook` nodes.
#[async_trait]
pub trait WebhookCaller: Send + Sync {
    /// Performs the call and returns the response body: parsed JSON when it
    /// parses, otherwise the raw text.
    async fn call(&self, request: WebhookRequest) -> Result<Value, WebhookError>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn WebhookCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WebhookCaller({})", self.name())
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestWebhookCaller {
    client: Client,
}

impl ReqwestWebhookCaller {
    /// No retries. `timeout` of `None` leaves reqwest's default (none).
    pub fn new(timeout: Option<Duration>) -> Result<Arc<Self>, WebhookError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| WebhookError::Client(e.to_string()))?;
        Ok(Arc::new(Self { client }))
    }
}

fn parse_body(text: String) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[async_trait]
impl WebhookCaller for ReqwestWebhookCaller {
    #[tracing::instrument(name = "webhook_call", skip(self, request), fields(url = %request.url, method = %request.method))]
    async fn call(&self, request: WebhookRequest) -> Result<Value, WebhookError> {
        let method = Method::from_bytes(request.method.trim().to_uppercase().as_bytes())
            .map_err(|_| WebhookError::InvalidMethod(request.method.clone()))?;

        let mut builder = self.client.request(method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if method != Method::GET {
            builder = builder.json(&request.body);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        debug!(status = status.as_u16(), "webhook answered");

        if !status.is_success() {
            return Err(WebhookError::Status { status: status.as_u16(), body: text });
        }
        Ok(parse_body(text))
    }

    fn name(&self) -> &'static str {
        "reqwest"
    }
}
