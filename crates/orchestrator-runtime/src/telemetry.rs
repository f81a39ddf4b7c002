//! Tracing pipeline.
//!
//! Call [`init_tracing`] once at process start-up and hold the returned
//! guard until exit.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter; overrides the configured level. |
//! | `ORCH_LOG_FORMAT` | `json` or `compact`; overrides `logging.format`. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP/HTTP collector base URL.  When set, spans are exported there as well. |
//!
//! # Example
//!
//! ```rust,no_run
//! use orchestrator_types::LogFormat;
//!
//! let _guard = orchestrator_runtime::telemetry::init_tracing("orchestrator", "info", LogFormat::Compact);
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use orchestrator_types::LogFormat;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `level` is used when `RUST_LOG` is unset or unparsable.  Calling this a
/// second time in one process leaves the first subscriber in place.
pub fn init_tracing(service_name: &str, level: &str, format: LogFormat) -> TracerProviderGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let format = resolve_format(std::env::var("ORCH_LOG_FORMAT").ok().as_deref(), format);
    let provider = build_provider(service_name);
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("orchestrator")));

    let registry = tracing_subscriber::registry().with(env_filter).with(otel_layer);
    let installed = match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Compact => registry.with(tracing_subscriber::fmt::layer().compact()).try_init(),
    };
    if let Err(e) = installed {
        eprintln!("[orchestrator] tracing already initialised: {e}");
    }

    TracerProviderGuard(provider)
}

fn resolve_format(env: Option<&str>, configured: LogFormat) -> LogFormat {
    match env.map(str::to_ascii_lowercase).as_deref() {
        Some("json") => LogFormat::Json,
        Some("compact") => LogFormat::Compact,
        _ => configured,
    }
}

/// Shuts the OTLP provider down on drop, flushing pending spans.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[orchestrator] OpenTelemetry provider shutdown error: {e}");
        }
    }
}

fn build_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[orchestrator] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    // Simple exporter: no runtime exists yet when the CLI calls this.
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}
