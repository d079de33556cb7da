use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use opentelemetry::metrics::Counter;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tokio::runtime::Runtime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const OTLP_ENDPOINT_OVERRIDE_ENV: &str = "HOTPATCH_OTEL_EXPORTER_OTLP_ENDPOINT";
const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const DEFAULT_SERVICE_NAME: &str = "hotpatch-guard";
const DEFAULT_METRIC_EXPORT_INTERVAL_SECS: u64 = 15;

static BOOT_OUTCOMES_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
static TAMPER_EVENTS_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
static RECOVERY_OUTCOMES_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
static INSTALLS_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();

pub struct ObservabilityGuard {
    _tracer_provider: Option<SdkTracerProvider>,
    _meter_provider: Option<SdkMeterProvider>,
    _tokio_runtime: Option<Runtime>,
}

impl ObservabilityGuard {
    /// Installs the tracing subscriber. OTLP export is only attempted when an
    /// endpoint is configured; otherwise logs go to stderr alone.
    pub fn init() -> Self {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let Some(endpoint) = configured_endpoint() else {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .try_init();
            return Self::disabled();
        };

        match setup_otel_pipeline(endpoint) {
            Ok(pipeline) => {
                let tracer = pipeline.tracer_provider.tracer("hotpatch-guard-observability");
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_target(false)
                            .with_writer(std::io::stderr),
                    )
                    .with(otel_layer)
                    .try_init();

                init_instruments();

                eprintln!(
                    "{{\"event\":\"observability_init\",\"status\":\"ok\",\"otlp_endpoint\":{}}}",
                    serde_json::to_string(&pipeline.endpoint)
                        .unwrap_or_else(|_| "\"\"".to_string())
                );

                Self {
                    _tracer_provider: Some(pipeline.tracer_provider),
                    _meter_provider: Some(pipeline.meter_provider),
                    _tokio_runtime: Some(pipeline.runtime),
                }
            }
            Err(err) => {
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_target(false)
                            .with_writer(std::io::stderr),
                    )
                    .try_init();
                eprintln!(
                    "{{\"event\":\"observability_init\",\"status\":\"degraded\",\"message\":{}}}",
                    serde_json::to_string(&err.to_string())
                        .unwrap_or_else(|_| "\"failed to encode observability error\"".to_string())
                );
                Self::disabled()
            }
        }
    }

    fn disabled() -> Self {
        Self {
            _tracer_provider: None,
            _meter_provider: None,
            _tokio_runtime: None,
        }
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(meter_provider) = self._meter_provider.as_ref() {
            if let Err(err) = meter_provider.force_flush() {
                report_shutdown_error("metrics", "flush_error", &err.to_string());
            }
            if let Err(err) = meter_provider.shutdown() {
                report_shutdown_error("metrics", "shutdown_error", &err.to_string());
            }
        }

        if let Some(tracer_provider) = self._tracer_provider.as_ref() {
            let flush_errors = tracer_provider
                .force_flush()
                .into_iter()
                .filter_map(|result| result.err().map(|err| err.to_string()))
                .collect::<Vec<_>>();
            if !flush_errors.is_empty() {
                report_shutdown_error("traces", "flush_error", &flush_errors.join("; "));
            }
            if let Err(err) = tracer_provider.shutdown() {
                report_shutdown_error("traces", "shutdown_error", &err.to_string());
            }
        }
    }
}

fn report_shutdown_error(component: &str, status: &str, message: &str) {
    eprintln!(
        "{{\"event\":\"observability_shutdown\",\"component\":\"{}\",\"status\":\"{}\",\"message\":{}}}",
        component,
        status,
        serde_json::to_string(message)
            .unwrap_or_else(|_| "\"failed to encode shutdown error\"".to_string())
    );
}

struct PipelineState {
    runtime: Runtime,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    endpoint: String,
}

fn configured_endpoint() -> Option<String> {
    [OTLP_ENDPOINT_OVERRIDE_ENV, OTLP_ENDPOINT_ENV]
        .into_iter()
        .filter_map(|key| env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

fn setup_otel_pipeline(endpoint: String) -> Result<PipelineState> {
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(anyhow!(
            "OTLP endpoint must start with http:// or https://, got {}",
            endpoint
        ));
    }
    let service_name = env::var("OTEL_SERVICE_NAME")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
    let export_interval_secs = env::var("OTEL_METRIC_EXPORT_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_METRIC_EXPORT_INTERVAL_SECS);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(1)
        .thread_name("hotpatch-otel")
        .build()
        .context("failed building tokio runtime for OpenTelemetry")?;
    let _runtime_guard = runtime.enter();

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name)]);

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .build()
        .context("failed building OTLP span exporter")?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(span_exporter, opentelemetry_sdk::runtime::Tokio)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .build()
        .context("failed building OTLP metric exporter")?;

    let periodic_reader =
        PeriodicReader::builder(metric_exporter, opentelemetry_sdk::runtime::Tokio)
            .with_interval(Duration::from_secs(export_interval_secs))
            .build();

    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(periodic_reader)
        .build();
    global::set_meter_provider(meter_provider.clone());

    Ok(PipelineState {
        runtime,
        tracer_provider,
        meter_provider,
        endpoint,
    })
}

fn init_instruments() {
    let meter = global::meter("hotpatch-guard");

    let _ = BOOT_OUTCOMES_COUNTER.get_or_init(|| {
        meter
            .u64_counter("boot_outcomes_total")
            .with_description("Bootstrap integrity decisions by state and integrity label.")
            .build()
    });
    let _ = TAMPER_EVENTS_COUNTER.get_or_init(|| {
        meter
            .u64_counter("tamper_events_total")
            .with_description("Detected content-hash mismatches by lifecycle phase.")
            .build()
    });
    let _ = RECOVERY_OUTCOMES_COUNTER.get_or_init(|| {
        meter
            .u64_counter("recovery_outcomes_total")
            .with_description("Encrypted-archive recovery results.")
            .build()
    });
    let _ = INSTALLS_COUNTER.get_or_init(|| {
        meter
            .u64_counter("installs_total")
            .with_description("Patch install attempts by status and error kind.")
            .build()
    });
}

pub fn record_boot_outcome(state: &str, integrity: Option<&str>) {
    let attrs = vec![
        KeyValue::new("state", state.to_string()),
        KeyValue::new("integrity", integrity.unwrap_or("none").to_string()),
    ];
    if let Some(counter) = BOOT_OUTCOMES_COUNTER.get() {
        counter.add(1, &attrs);
    }
}

pub fn record_tamper_event(phase: &str, tamper_count: u32) {
    let attrs = vec![
        KeyValue::new("phase", phase.to_string()),
        KeyValue::new("tamper_count", i64::from(tamper_count)),
    ];
    if let Some(counter) = TAMPER_EVENTS_COUNTER.get() {
        counter.add(1, &attrs);
    }
}

pub fn record_recovery_outcome(outcome: &str) {
    let attrs = vec![KeyValue::new("outcome", outcome.to_string())];
    if let Some(counter) = RECOVERY_OUTCOMES_COUNTER.get() {
        counter.add(1, &attrs);
    }
}

pub fn record_install(status: &str, error_kind: Option<&str>) {
    let mut attrs = vec![KeyValue::new("status", status.to_string())];
    if let Some(kind) = error_kind {
        attrs.push(KeyValue::new("error_kind", kind.to_string()));
    }
    if let Some(counter) = INSTALLS_COUNTER.get() {
        counter.add(1, &attrs);
    }
}
