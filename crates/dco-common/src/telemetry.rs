//! Process-wide logging, tracing and metrics setup
//!
//! Logs go to stdout as JSON lines, or as plain text with `--development`.
//! When `OTEL_EXPORTER_OTLP_ENDPOINT` is set, spans and the instruments in
//! [`crate::metrics`] are additionally pushed to that collector over gRPC.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,dco=debug,kube=info,tower=warn,hyper=warn";

/// Downward-API variables copied onto the telemetry resource
const POD_ATTRIBUTES: [(&str, &str); 3] = [
    ("POD_NAME", "k8s.pod.name"),
    ("POD_NAMESPACE", "k8s.namespace.name"),
    ("NODE_NAME", "k8s.node.name"),
];

/// Telemetry setup failures
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The span exporter could not be built
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// The metric exporter could not be built
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Telemetry settings
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` of exported spans and metrics
    pub service_name: String,

    /// Collector endpoint, e.g. `http://otel-collector:4317`; `None` keeps
    /// everything local
    pub otlp_endpoint: Option<String>,

    /// Human-readable log lines instead of JSON
    pub development: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: crate::OPERATOR_NAME.to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|e| !e.is_empty()),
            development: false,
        }
    }
}

/// Keeps the exporting providers alive; call [`TelemetryGuard::shutdown`]
/// before exit to flush what is still buffered
#[must_use = "dropping the guard without shutdown loses buffered spans and metrics"]
pub struct TelemetryGuard {
    tracer: Option<TracerProvider>,
    meter: Option<SdkMeterProvider>,
}

impl TelemetryGuard {
    /// Whether spans and metrics leave the process
    pub fn exporting(&self) -> bool {
        self.tracer.is_some()
    }

    /// Flush and stop the exporters
    pub fn shutdown(self) {
        if let Some(tracer) = self.tracer {
            if let Err(e) = tracer.shutdown() {
                warn!(error = %e, "Failed to flush spans");
            }
        }
        if let Some(meter) = self.meter {
            if let Err(e) = meter.shutdown() {
                warn!(error = %e, "Failed to flush metrics");
            }
        }
    }
}

/// Install the global subscriber, propagator and, when configured, the OTLP
/// exporters.
///
/// Call once per process. With an OTLP endpoint this must run inside a Tokio
/// runtime, which drives the batch exporters.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let mut guard = TelemetryGuard {
        tracer: None,
        meter: None,
    };
    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let resource = resource(&config.service_name);
            guard.meter = Some(meter_provider(endpoint, resource.clone())?);
            let provider = tracer_provider(endpoint, resource)?;
            let tracer = provider.tracer(config.service_name.clone());
            guard.tracer = Some(provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let output = if config.development {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    Ok(guard)
}

/// Service identity plus whatever pod placement the downward API exposes
fn resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, service_name.to_string()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    attributes.extend(
        POD_ATTRIBUTES
            .iter()
            .filter_map(|(var, key)| std::env::var(var).ok().map(|v| KeyValue::new(*key, v))),
    );
    Resource::new(attributes)
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(provider.clone());
    Ok(provider)
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let provider = SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build();
    global::set_meter_provider(provider.clone());
    Ok(provider)
}
