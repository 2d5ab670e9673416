//! Tracing pipeline initialisation.
//!
//! Call [`init_tracing`] once at process startup.  Log output always goes to
//! **stderr**; stdout is reserved for the fused-scan stream.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP collector base URL (e.g. `http://localhost:4318`). When set the OTLP HTTP exporter is activated. |
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `RANGEFUSE_LOG_FORMAT=json` | Emit newline-delimited JSON logs. |
//!
//! # Example
//!
//! ```rust,no_run
//! let _guard = rangefuse_runtime::telemetry::init_tracing("rangefuse");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Env var selecting the log line format.
pub const LOG_FORMAT_ENV: &str = "RANGEFUSE_LOG_FORMAT";

/// Initialise the global `tracing` subscriber with an optional OTLP exporter.
///
/// Without `OTEL_EXPORTER_OTLP_ENDPOINT` only the console formatter is
/// installed.  The returned [`TracerProviderGuard`] must outlive every span
/// that should reach the collector.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let use_json = json_requested(std::env::var(LOG_FORMAT_ENV).ok().as_deref());

    let provider = build_provider(service_name);
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("rangefuse")));

    let registry = tracing_subscriber::registry().with(env_filter).with(otel_layer);
    if use_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }

    TracerProviderGuard(provider)
}

fn json_requested(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.eq_ignore_ascii_case("json"))
}

/// Shuts the OTel [`SdkTracerProvider`] down on drop, flushing pending spans.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[rangefuse] OpenTelemetry provider shutdown error: {e}");
        }
    }
}

/// Build an [`SdkTracerProvider`] when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
///
/// Exporter failures are reported on stderr and fall back to console-only
/// output.
fn build_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[rangefuse] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            // Simple exporter: the Tokio runtime does not exist yet at init time.
            .with_simple_exporter(exporter)
            .build(),
    )
}
