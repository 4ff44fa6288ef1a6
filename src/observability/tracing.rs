//! OpenTelemetry trace export.
//!
//! Configures:
//! - OTLP/gRPC exporter authenticated per call
//! - Always-on sampling with batched export on the Tokio runtime

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::{TonicExporterBuilder, WithExportConfig};
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::{Config, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::Resource;
use std::time::Duration;
use tonic::transport::ClientTlsConfig;

use super::credentials::BearerInterceptor;
use super::TelemetryError;
use crate::SCOPE_NAME;

/// Upper bound on one export RPC.
const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// OTLP/gRPC exporter configuration shared by traces and metrics.
///
/// The channel is connected lazily, so building it does no network I/O.
pub fn otlp_exporter(endpoint: &str, interceptor: BearerInterceptor) -> TonicExporterBuilder {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .with_timeout(EXPORT_TIMEOUT)
        .with_interceptor(interceptor);

    if endpoint.starts_with("https://") {
        exporter.with_tls_config(ClientTlsConfig::new().with_native_roots())
    } else {
        exporter
    }
}

/// Build a tracer provider sampling every span and exporting in batches.
pub fn build_tracer_provider(
    exporter: TonicExporterBuilder,
    resource: Resource,
) -> Result<TracerProvider, TelemetryError> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(resource),
        )
        .install_batch(runtime::Tokio)
        .map_err(|e| TelemetryError::init("trace exporter", e))
}

/// The tracer handed to the `tracing` bridge and the log correlator.
pub fn service_tracer(provider: &TracerProvider) -> Tracer {
    provider.tracer(SCOPE_NAME)
}
