use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider};
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const SERVICE_NAME: &str = "darwinflow";

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

/// OTLP providers. Flushed and shut down by [`Telemetry::shutdown`].
pub struct Telemetry {
    pub logger_provider: SdkLoggerProvider,
    pub tracer_provider: SdkTracerProvider,
    pub meter_provider: SdkMeterProvider,
}

impl Telemetry {
    fn init(endpoint: &str) -> Result<Self> {
        let logs = LogExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(endpoint)
            .build()
            .context("log exporter")?;
        let spans = SpanExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(endpoint)
            .build()
            .context("span exporter")?;
        let metrics = MetricExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(endpoint)
            .build()
            .context("metric exporter")?;

        let telemetry = Telemetry {
            logger_provider: SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(get_resource())
                .build(),
            tracer_provider: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(get_resource())
                .build(),
            meter_provider: SdkMeterProvider::builder()
                .with_periodic_exporter(metrics)
                .with_resource(get_resource())
                .build(),
        };
        global::set_tracer_provider(telemetry.tracer_provider.clone());
        global::set_meter_provider(telemetry.meter_provider.clone());
        Ok(telemetry)
    }

    pub fn shutdown(&self) {
        let _ = self.logger_provider.shutdown();
        let _ = self.tracer_provider.shutdown();
        let _ = self.meter_provider.shutdown();
    }
}

/// Install the global subscriber: a daily-rolling text log in `log_dir`,
/// plus the OTLP bridge when an endpoint is given.
///
/// Stdout is left alone; it belongs to command output.
pub fn init_tracing(log_dir: &Path, log_file: &str, log_level: &str, otel_endpoint: Option<&str>) -> Result<Option<Telemetry>> {
    std::fs::create_dir_all(log_dir).with_context(|| format!("creating {}", log_dir.display()))?;

    let telemetry = otel_endpoint.map(Telemetry::init).transpose()?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(log_file)
        .build(log_dir)
        .context("initializing rolling log file")?;
    let file_layer = fmt::layer().with_writer(appender).with_ansi(false).with_target(true);

    let otel_layer = telemetry.as_ref().map(|t| {
        // exporter internals would otherwise log about themselves
        let filter = EnvFilter::new(format!("{log_level},hyper=off,tonic=off,h2=off,reqwest=off"));
        OpenTelemetryTracingBridge::new(&t.logger_provider).with_filter(filter)
    });

    tracing_subscriber::registry()
        .with(EnvFilter::new(log_level))
        .with(file_layer)
        .with(otel_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    info!(log_dir = %log_dir.display(), otel = otel_endpoint.is_some(), "logging initialised");
    Ok(telemetry)
}

/// Runtime counters, created once from the global meter.
pub struct Metrics {
    pub rpc_requests: Counter<u64>,
    pub rpc_failures: Counter<u64>,
    pub rpc_latency_ms: Histogram<f64>,
    pub bus_events_published: Counter<u64>,
    pub bus_handler_failures: Counter<u64>,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let meter = global::meter(SERVICE_NAME);
        Metrics {
            rpc_requests: meter
                .u64_counter("rpc_requests")
                .with_description("Requests sent to subprocess plugins")
                .build(),
            rpc_failures: meter.u64_counter("rpc_failures").build(),
            rpc_latency_ms: meter
                .f64_histogram("rpc_latency_ms")
                .with_description("Round trip per plugin request")
                .with_unit("ms")
                .build(),
            bus_events_published: meter.u64_counter("bus_events_published").build(),
            bus_handler_failures: meter.u64_counter("bus_handler_failures").build(),
        }
    })
}
