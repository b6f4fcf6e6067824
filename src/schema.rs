use std::{fs, path::Path};

use anyhow::{Context, Error};
use schemars::{schema_for, Schema};
use tracing::info;

use crate::flow::execution::FlowExecution;
use crate::flow::model::FlowDefinition;

pub const FLOW_SCHEMA_FILE: &str = "flow-definition.schema.json";
pub const EXECUTION_SCHEMA_FILE: &str = "flow-execution.schema.json";

/// JSON schema of flow definition files (`.json` / `.yaml`).
pub fn flow_definition_schema() -> Schema {
    schema_for!(FlowDefinition)
}

pub fn flow_execution_schema() -> Schema {
    schema_for!(FlowExecution)
}

/// The entry point invoked by `main.rs` for `Commands::Schema`.
pub fn write_schema(out_dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    for (file, schema) in [
        (FLOW_SCHEMA_FILE, flow_definition_schema()),
        (EXECUTION_SCHEMA_FILE, flow_execution_schema()),
    ] {
        let path = out_dir.join(file);
        fs::write(&path, serde_json::to_string_pretty(&schema)?)
            .with_context(|| format!("writing {}", path.display()))?;
        info!("wrote {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    #[test]
    fn flow_schema_names_the_top_level_sections() {
        let schema = serde_json::to_value(flow_definition_schema()).unwrap();
        let props = schema["properties"].as_object().unwrap();
        assert!(props.contains_key("flow"));
        assert!(props.contains_key("nodes"));
        assert!(props.contains_key("edges"));
    }

    #[test]
    fn write_schema_creates_files() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("schemas");
        write_schema(&out).unwrap();

        let text = std::fs::read_to_string(out.join(FLOW_SCHEMA_FILE)).unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["title"], "FlowDefinition");
        assert!(out.join(EXECUTION_SCHEMA_FILE).exists());
    }
}
