use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use opentelemetry::{global, metrics::{Counter, Histogram, MeterProvider}, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider, Resource,
};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::flow::execution::FlowExecution;

/// Target of the JSON execution-event stream.
pub const FLOW_EVENT_TARGET: &str = "flow_event";

const SERVICE_NAME: &str = "waflow";

/// Installs the global subscriber.
///
/// Without an OTLP endpoint, logs go to a daily-rolling text file under
/// `root` and `flow_event` events to a separate JSON file. With one, logs,
/// traces and metrics are exported over OTLP/HTTP and echoed to stdout.
pub fn init_tracing(
    root: &Path,
    log_file: &str,
    event_file: &str,
    log_level: &str,
    otel_endpoint: Option<String>,
) -> Result<Option<Telemetry>> {
    match otel_endpoint.filter(|e| !e.trim().is_empty()) {
        Some(endpoint) => Telemetry::init(log_level, &endpoint).map(Some),
        None => {
            FileTelemetry::init_files(log_level, root.join(log_file), root.join(event_file))?;
            Ok(None)
        }
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();

fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn signal_endpoint(base: &str, signal: &str) -> String {
    format!("{}/v1/{}", base.trim_end_matches('/'), signal)
}

fn init_logs(endpoint: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(signal_endpoint(endpoint, "logs"))
        .build()
        .context("building OTLP log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_traces(endpoint: &str) -> Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(signal_endpoint(endpoint, "traces"))
        .build()
        .context("building OTLP span exporter")?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(endpoint: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(signal_endpoint(endpoint, "metrics"))
        .build()
        .context("building OTLP metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn directive(filter: EnvFilter, raw: &str) -> Result<EnvFilter> {
    Ok(filter.add_directive(raw.parse().with_context(|| format!("bad log directive `{raw}`"))?))
}

/// OTLP providers, kept alive for the life of the process.
pub struct Telemetry {
    pub logger_provider: SdkLoggerProvider,
    pub tracer_provider: SdkTracerProvider,
    pub meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn init(log_level: &str, endpoint: &str) -> Result<Self> {
        let logger_provider = init_logs(endpoint)?;
        let tracer_provider = init_traces(endpoint)?;
        let meter_provider = init_metrics(endpoint)?;

        // exporter internals would otherwise log about their own exports
        let mut bridge_filter = EnvFilter::new(log_level);
        for quiet in ["hyper=off", "tonic=off", "h2=off", "reqwest=off"] {
            bridge_filter = directive(bridge_filter, quiet)?;
        }
        let otel_logs_layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(bridge_filter);

        let fmt_layer = fmt::layer()
            .with_thread_names(true)
            .with_filter(EnvFilter::new(log_level));

        Registry::default()
            .with(otel_logs_layer)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| anyhow!("tracing already initialised: {e}"))?;

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        Ok(Telemetry { logger_provider, tracer_provider, meter_provider })
    }

    /// Flushes pending exports.
    pub fn shutdown(&self) {
        if let Err(e) = self.tracer_provider.shutdown() {
            eprintln!("tracer shutdown failed: {e}");
        }
        if let Err(e) = self.meter_provider.shutdown() {
            eprintln!("meter shutdown failed: {e}");
        }
        if let Err(e) = self.logger_provider.shutdown() {
            eprintln!("logger shutdown failed: {e}");
        }
    }
}

/// File-only logging.
pub struct FileTelemetry;

impl FileTelemetry {
    /// - `log_level` is an `EnvFilter` directive (e.g. `"info"`).
    /// - `log_file` is the rolling text log.
    /// - `event_file` receives one JSON line per `flow_event`.
    pub fn init_files(log_level: &str, log_file: PathBuf, event_file: PathBuf) -> Result<Self> {
        let txt_appender = rolling_appender(&log_file)?;
        let txt_layer = fmt::Layer::default()
            .with_writer(txt_appender)
            .with_ansi(false)
            .with_filter(EnvFilter::new(log_level));

        let json_appender = rolling_appender(&event_file)?;
        let json_layer = fmt::layer()
            .json()
            .with_writer(json_appender)
            .with_target(true)
            .with_filter(EnvFilter::new(format!("{FLOW_EVENT_TARGET}=info")));

        Registry::default()
            .with(txt_layer)
            .with(json_layer)
            .try_init()
            .map_err(|e| anyhow!("tracing already initialised: {e}"))?;

        Ok(FileTelemetry)
    }
}

fn rolling_appender(path: &Path) -> Result<RollingFileAppender> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("log path {} has no parent directory", path.display()))?;
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("log path {} has no file name", path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(RollingFileAppender::new(Rotation::DAILY, dir, name))
}

/// Engine counters and histograms. Backed by whatever meter provider is
/// installed globally; a no-op one when OTLP is off.
#[derive(Clone, Debug)]
pub struct EngineMetrics {
    pub executions_started: Counter<u64>,
    pub executions_completed: Counter<u64>,
    pub executions_failed: Counter<u64>,
    pub executions_paused: Counter<u64>,
    pub node_latency_ms: Histogram<f64>,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        let meter = global::meter_provider().meter(SERVICE_NAME);
        EngineMetrics {
            executions_started: meter
                .u64_counter("executions_started")
                .with_description("Flow executions created")
                .build(),
            executions_completed: meter.u64_counter("executions_completed").build(),
            executions_failed: meter.u64_counter("executions_failed").build(),
            executions_paused: meter.u64_counter("executions_paused").build(),
            node_latency_ms: meter
                .f64_histogram("node_latency_ms")
                .with_description("Time spent in one node")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn record_node(&self, node_type: &str, elapsed: Duration) {
        self.node_latency_ms.record(
            elapsed.as_secs_f64() * 1_000.0,
            &[KeyValue::new("node_type", node_type.to_string())],
        );
    }
}

/// Emits one JSON line on the `flow_event` target for a run status change.
pub fn flow_event(exec: &FlowExecution, event: &str) {
    tracing::event!(
        target: FLOW_EVENT_TARGET,
        tracing::Level::INFO,
        event,
        execution_id = %exec.id,
        flow_id = %exec.flow_id,
        conversation_id = %exec.conversation_id,
        node_id = %exec.current_node_id,
        status = %exec.status,
        error = exec.error_message.as_deref().unwrap_or(""),
    );
}
