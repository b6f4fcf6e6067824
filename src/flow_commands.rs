use anyhow::{bail, Context, Result};
use std::{path::Path, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use wa_transport::{ConsoleTransport, InboundMessage, MessageDirection, Participant};

use crate::config::EngineSettings;
use crate::conversation::{Conversation, MessageRecord};
use crate::flow::manager::FlowEngine;
use crate::flow::model::{FlowDefinition, TriggerKind};
use crate::flow::state::{StateValue, Variables};
use crate::flow::validation::{validate_flow, ValidationReport};
use crate::store::Stores;
use crate::webhook::ReqwestWebhookCaller;

const CONSOLE_CONVERSATION: &str = "console";
const CONSOLE_CONTACT: &str = "console-user";

/// Loads a `.json` / `.yaml` flow file and validates it.
pub fn validate_flow_file(flow_file: &Path) -> Result<ValidationReport> {
    if !flow_file.exists() {
        bail!("File does not exist: {}", flow_file.display());
    }
    let def = FlowDefinition::load_from_file(flow_file)
        .with_context(|| format!("Failed to load flow file: {}", flow_file.display()))?;
    let report = validate_flow(&def);
    info!(
        "validated {}: {} errors, {} warnings",
        flow_file.display(),
        report.errors.len(),
        report.warnings.len()
    );
    Ok(report)
}

/// Parses a `--var key=value` argument. Values that parse as JSON keep
/// their type (`age=30`, `vip=true`); anything else is a string.
pub fn parse_var(raw: &str) -> Result<(String, StateValue)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("expected key=value, got `{}`", raw);
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("empty variable name in `{}`", raw);
    }
    let value = match serde_json::from_str::<serde_json::Value>(value) {
        Ok(json) if !json.is_string() => StateValue::from(json),
        _ => StateValue::from(value),
    };
    Ok((key.to_string(), value))
}

/// Runs a flow against a single console conversation. Each stdin line is
/// an inbound message; bot replies are printed as they are sent.
pub async fn simulate_flow_file(flow_file: &Path, variables: Variables, settings: EngineSettings) -> Result<()> {
    let report = validate_flow_file(flow_file)?;
    for w in &report.warnings {
        println!("⚠️  {}", w);
    }
    if !report.is_valid() {
        bail!("flow is invalid:\n  {}", report.errors.join("\n  "));
    }

    let def = FlowDefinition::load_from_file(flow_file)?;
    let flow_id = def.flow.id.clone();
    let instance_id = def.flow.instance_id.clone();
    let trigger = def.flow.trigger;

    let stores = Stores::in_memory();
    stores
        .conversations
        .save_conversation(Conversation::new(CONSOLE_CONVERSATION, &instance_id, CONSOLE_CONTACT))
        .await?;

    let webhooks = ReqwestWebhookCaller::new(settings.webhook_timeout)?;
    let engine = FlowEngine::new(stores.clone(), Arc::new(ConsoleTransport::new("bot>")), webhooks, settings);
    engine.publish(def).await?;

    if trigger == TriggerKind::Manual {
        engine.start_manual(&flow_id, CONSOLE_CONVERSATION, variables).await?;
        engine.wait_for_scheduled().await;
    } else if !variables.is_empty() {
        warn!("--var is only applied to manual flows; `{}` starts from a trigger", flow_id);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        stores
            .conversations
            .record_message(MessageRecord::new(CONSOLE_CONVERSATION, MessageDirection::Incoming, &line))
            .await?;
        let message = InboundMessage::new(
            &instance_id,
            CONSOLE_CONVERSATION,
            Participant::new(CONSOLE_CONTACT, None),
            line,
        );
        engine.handle_inbound(&message).await;
        engine.wait_for_scheduled().await;
    }

    if let Some(last) = engine.list_executions(&flow_id, 1).await?.into_iter().next() {
        println!("-- run {} ended as {}", last.id, last.status);
        if let Some(err) = last.error_message {
            println!("  error: {}", err);
        }
    }
    Ok(())
}
