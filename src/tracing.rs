//! Logging and optional OpenTelemetry export
//!
//! Logs always go to stderr so stdout stays free for run output. When an OTLP
//! endpoint is configured, spans are also exported over gRPC:
//!
//! ```text
//! codeact ──► stderr (fmt, human or JSON)
//!         └─► OTLP (gRPC) ──► OTel Collector ──► Tempo / Jaeger
//! ```

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set
const DEFAULT_FILTER: &str = "warn,codeact=info";

fn otlp_tracer(
    service_name: &str,
    endpoint: &str,
) -> Result<sdktrace::Tracer, opentelemetry::trace::TraceError> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(runtime::Tokio)
}

/// Install the global subscriber
///
/// # Arguments
/// * `service_name` - Name reported to the trace backend
/// * `otlp_endpoint` - Export spans here when set
/// * `json` - Emit log lines as JSON objects
///
/// Must be called from inside a tokio runtime when an endpoint is given.
pub fn init_tracing(
    service_name: &str,
    otlp_endpoint: Option<&str>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let otel_layer = match otlp_endpoint {
        Some(endpoint) => Some(
            tracing_opentelemetry::layer().with_tracer(otlp_tracer(service_name, endpoint)?),
        ),
        None => None,
    };

    let (plain_layer, json_layer) = if json {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            ),
        )
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            ),
            None,
        )
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(plain_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()?;

    if let Some(endpoint) = otlp_endpoint {
        tracing::info!(
            service = service_name,
            endpoint = endpoint,
            "OpenTelemetry tracing initialized"
        );
    }

    Ok(())
}

/// Flush pending spans to the collector
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}
