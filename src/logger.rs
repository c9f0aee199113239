use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};
use worker_channel::LogLevel;

/// Target of the newline-delimited JSON lines describing every processed event.
pub const IO_TARGET: &str = "io";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TracingOptions {
    pub log_dir: PathBuf,
    pub log_file: String,
    pub event_file: String,
    pub log_level: String,
    pub otel_logs_endpoint: Option<String>,
    pub otel_metrics_endpoint: Option<String>,
}

#[async_trait::async_trait]
#[typetag::serde]
pub trait LoggerType: Send + Sync {
    fn log(&self, level: LogLevel, context: &str, msg: &str);
    fn clone_box(&self) -> Box<dyn LoggerType>;
    fn debug_box(&self) -> String;
}

/// Contextual logger handed to components that log on behalf of a bot or a script.
#[derive(Serialize, Deserialize)]
pub struct Logger(pub Box<dyn LoggerType>);

impl Logger {
    pub fn tracing() -> Self {
        Logger(Box::new(TracingLogger))
    }

    pub fn log(&self, level: LogLevel, context: &str, msg: &str) {
        self.0.log(level, context, msg)
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Logger(self.0.clone_box())
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TracingLogger;

#[typetag::serde]
#[async_trait::async_trait]
impl LoggerType for TracingLogger {
    fn log(&self, level: LogLevel, context: &str, msg: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(%context, "{msg}"),
            LogLevel::Debug => tracing::debug!(%context, "{msg}"),
            LogLevel::Info => tracing::info!(%context, "{msg}"),
            LogLevel::Warn => tracing::warn!(%context, "{msg}"),
            LogLevel::Error => tracing::error!(%context, "{msg}"),
            LogLevel::Critical => tracing::error!(%context, "[CRITICAL] {msg}"),
        }
    }

    fn clone_box(&self) -> Box<dyn LoggerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "TracingLogger".to_string()
    }
}

/// Keeps exporters alive; flushes them on drop.
#[derive(Default)]
pub struct TelemetryGuard {
    logger_provider: Option<SdkLoggerProvider>,
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(p) = self.logger_provider.take() {
            let _ = p.shutdown();
        }
        if let Some(p) = self.tracer_provider.take() {
            let _ = p.shutdown();
        }
        if let Some(p) = self.meter_provider.take() {
            let _ = p.shutdown();
        }
    }
}

/// Installs the global subscriber: OTLP exporters when an endpoint is given,
/// rolling files otherwise. Console output always goes to stderr because a
/// worker's stdout carries the control channel.
pub fn init_tracing(opts: &TracingOptions) -> Result<(Logger, TelemetryGuard)> {
    let guard = if opts.otel_logs_endpoint.is_some() || opts.otel_metrics_endpoint.is_some() {
        init_otel(opts)?
    } else {
        init_files(opts)?
    };
    Ok((Logger::tracing(), guard))
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name("bothost").build())
        .clone()
}

fn init_otel(opts: &TracingOptions) -> Result<TelemetryGuard> {
    let logs_endpoint = opts.otel_logs_endpoint.clone().unwrap_or_default();
    let metrics_endpoint = opts
        .otel_metrics_endpoint
        .clone()
        .unwrap_or_else(|| logs_endpoint.clone());

    let log_exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(&logs_endpoint)
        .build()
        .context("log exporter")?;
    let logger_provider = SdkLoggerProvider::builder()
        .with_batch_exporter(log_exporter)
        .with_resource(get_resource())
        .build();

    let span_exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(&logs_endpoint)
        .build()
        .context("span exporter")?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(span_exporter)
        .with_resource(get_resource())
        .build();

    let metric_exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(&metrics_endpoint)
        .build()
        .context("metric exporter")?;
    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .with_resource(get_resource())
        .build();

    let otel_layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(
        EnvFilter::new(&opts.log_level)
            .add_directive("hyper=off".parse()?)
            .add_directive("tonic=off".parse()?)
            .add_directive("h2=off".parse()?)
            .add_directive("reqwest=off".parse()?),
    );
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(&opts.log_level));

    Registry::default()
        .with(otel_layer)
        .with(console)
        .try_init()
        .context("tracing subscriber already installed")?;

    global::set_tracer_provider(tracer_provider.clone());
    global::set_meter_provider(meter_provider.clone());

    Ok(TelemetryGuard {
        logger_provider: Some(logger_provider),
        tracer_provider: Some(tracer_provider),
        meter_provider: Some(meter_provider),
    })
}

fn init_files(opts: &TracingOptions) -> Result<TelemetryGuard> {
    std::fs::create_dir_all(&opts.log_dir)
        .with_context(|| format!("could not create {}", opts.log_dir.display()))?;

    let txt_appender = RollingFileAppender::new(Rotation::DAILY, &opts.log_dir, &opts.log_file);
    let txt_layer = fmt::layer()
        .with_writer(txt_appender)
        .with_ansi(false)
        .with_filter(EnvFilter::new(&opts.log_level));

    // one JSON line per processed event
    let json_appender =
        RollingFileAppender::new(Rotation::DAILY, &opts.log_dir, &opts.event_file);
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{IO_TARGET}=info")));

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(&opts.log_level));

    Registry::default()
        .with(txt_layer)
        .with(json_layer)
        .with(console)
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(TelemetryGuard::default())
}

/// Maps a CLI level string to the channel log level.
pub fn convert_level(level: &str) -> LogLevel {
    level.to_lowercase().parse().unwrap_or(LogLevel::Info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_fall_back_to_info() {
        assert_eq!(convert_level("DEBUG"), LogLevel::Debug);
        assert_eq!(convert_level("loud"), LogLevel::Info);
    }

    #[test]
    fn logger_clones_through_the_box() {
        let logger = Logger::tracing();
        let copy = logger.clone();
        assert_eq!(format!("{copy:?}"), "TracingLogger");
        copy.log(LogLevel::Info, "test", "hello");
    }
}
