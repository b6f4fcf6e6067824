use clap::{Args, Parser, Subcommand};
use std::{env, path::PathBuf, process};
use tracing::error;
use waflow::{
    config::{ConfigManager, EngineSettings, EnvConfigManager, ROOT_KEY},
    flow::state::Variables,
    flow_commands::{parse_var, simulate_flow_file, validate_flow_file},
    logger::init_tracing,
    schema::write_schema,
};

#[derive(Parser, Debug)]
#[command(
    name = "waflow",
    about = "Conversational flow engine for WhatsApp automation",
    version = "0.1.0"
)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// OTLP/HTTP collector base url (e.g. http://localhost:4318). Logs go to
    /// files under the root directory when unset.
    #[arg(long, global = true)]
    otel_endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Emit JSON-Schema for flow definition and execution files
    Schema(SchemaArgs),

    /// Work with flow definition files
    Flow(FlowArgs),
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Output directory. Defaults to `<root>/schemas`.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct FlowArgs {
    #[command(subcommand)]
    command: FlowCommands,
}

#[derive(Subcommand, Debug)]
enum FlowCommands {
    /// Check a flow file for errors and warnings
    Validate { file: PathBuf },

    /// Chat with a flow on the console
    Simulate {
        file: PathBuf,
        /// Initial variable for manual flows, as key=value (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },
}

/// Resolve the waflow root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    match env::var(ROOT_KEY) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => PathBuf::from("./waflow"),
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();

    let telemetry = init_tracing(
        &root,
        "logs/waflow.log",
        "logs/waflow_events.log",
        &cli.log_level,
        cli.otel_endpoint.clone(),
    )?;

    let result = match cli.command {
        Commands::Schema(args) => {
            let out_dir = args.out.unwrap_or_else(|| root.join("schemas"));
            write_schema(&out_dir).map(|_| println!("Schemas written to {}", out_dir.display()))
        }
        Commands::Flow(flow_args) => match flow_args.command {
            FlowCommands::Validate { file } => match validate_flow_file(&file) {
                Ok(report) => {
                    for w in &report.warnings {
                        println!("⚠️  {}", w);
                    }
                    for e in &report.errors {
                        println!("❌ {}", e);
                    }
                    if report.is_valid() {
                        println!("✅ Flow file is valid.");
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!("{} error(s) in {}", report.errors.len(), file.display()))
                    }
                }
                Err(e) => Err(e),
            },
            FlowCommands::Simulate { file, vars } => simulate(root.clone(), file, vars).await,
        },
    };

    if let Some(telemetry) = telemetry {
        telemetry.shutdown();
    }
    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
    Ok(())
}

async fn simulate(root: PathBuf, file: PathBuf, raw_vars: Vec<String>) -> anyhow::Result<()> {
    let config = ConfigManager(EnvConfigManager::new(root.join("config").join(".env")));
    let settings = EngineSettings::from_config(&config).await?;

    let mut variables = Variables::new();
    for raw in &raw_vars {
        let (k, v) = parse_var(raw)?;
        variables.insert(k, v);
    }
    simulate_flow_file(&file, variables, settings).await
}
