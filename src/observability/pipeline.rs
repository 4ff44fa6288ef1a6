//! Telemetry pipeline bootstrap and teardown.
//!
//! [`TelemetryPipeline::initialize`] brings the pipeline up step by step,
//! registering each sub-resource's teardown as soon as it exists. The
//! resulting [`Telemetry`] is the single owner of that registry; the process
//! calls [`Telemetry::shutdown`] once on the way out.

use opentelemetry::global;
use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{Tracer, TracerProvider};
use opentelemetry_sdk::Resource;
use std::sync::Arc;
use std::time::Duration;

use super::credentials::Credentials;
use super::metrics::build_meter_provider;
use super::resource::build_resource;
use super::shutdown::ShutdownRegistry;
use super::tracing::{build_tracer_provider, otlp_exporter, service_tracer};
use super::TelemetryError;
use crate::config::{Config, DEFAULT_OTEL_ENDPOINT};
use crate::environment::Environment;
use crate::SCOPE_NAME;

/// Lifecycle of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Initializing,
    Running,
    ShuttingDown,
    Shutdown,
}

/// Inputs to the pipeline beyond what the environment resolves.
#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub service_name: Option<String>,
    pub service_revision: Option<String>,
    pub region: Option<String>,
    pub otel_endpoint: String,
    pub metric_export_interval: Duration,
    /// Bound on the cleanup that follows a failed initialization.
    pub cleanup_timeout: Duration,
}

impl TelemetrySettings {
    pub fn from_config(config: &Config, region: Option<String>) -> Self {
        Self {
            service_name: config.service_name.clone().filter(|s| !s.is_empty()),
            service_revision: config.service_revision.clone().filter(|s| !s.is_empty()),
            region,
            otel_endpoint: config.otel_endpoint.clone(),
            metric_export_interval: config.metric_export_interval(),
            cleanup_timeout: config.shutdown_timeout(),
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            service_name: None,
            service_revision: None,
            region: None,
            otel_endpoint: DEFAULT_OTEL_ENDPOINT.into(),
            metric_export_interval: Duration::from_secs(60),
            cleanup_timeout: Duration::from_secs(10),
        }
    }
}

/// Builds the tracer and meter providers.
pub trait ExporterFactory: Send + Sync {
    fn tracer_provider(
        &self,
        resource: &Resource,
        credentials: &Credentials,
        project_id: &str,
    ) -> Result<TracerProvider, TelemetryError>;

    fn meter_provider(
        &self,
        resource: &Resource,
        credentials: &Credentials,
        project_id: &str,
    ) -> Result<SdkMeterProvider, TelemetryError>;
}

/// OTLP/gRPC exporters for traces and metrics.
#[derive(Debug, Clone)]
pub struct OtlpExporters {
    endpoint: String,
    metric_export_interval: Duration,
}

impl OtlpExporters {
    pub fn new(settings: &TelemetrySettings) -> Self {
        Self {
            endpoint: settings.otel_endpoint.clone(),
            metric_export_interval: settings.metric_export_interval,
        }
    }
}

impl ExporterFactory for OtlpExporters {
    fn tracer_provider(
        &self,
        resource: &Resource,
        credentials: &Credentials,
        project_id: &str,
    ) -> Result<TracerProvider, TelemetryError> {
        let exporter = otlp_exporter(&self.endpoint, credentials.interceptor(project_id));
        build_tracer_provider(exporter, resource.clone())
    }

    fn meter_provider(
        &self,
        resource: &Resource,
        credentials: &Credentials,
        project_id: &str,
    ) -> Result<SdkMeterProvider, TelemetryError> {
        let exporter = otlp_exporter(&self.endpoint, credentials.interceptor(project_id));
        build_meter_provider(exporter, resource.clone(), self.metric_export_interval)
    }
}

/// Entry point for bringing telemetry up.
pub struct TelemetryPipeline;

impl TelemetryPipeline {
    /// Bring the pipeline up.
    ///
    /// On failure, every sub-resource created so far is shut down and the
    /// error carries both the original cause and any cleanup failures.
    pub async fn initialize<F: ExporterFactory>(
        env: Arc<dyn Environment>,
        exporters: &F,
        settings: &TelemetrySettings,
    ) -> Result<Telemetry, TelemetryError> {
        let mut registry = ShutdownRegistry::new();
        tracing::debug!(state = ?PipelineState::Initializing, "Initializing telemetry");

        match bring_up(env, exporters, settings, &mut registry).await {
            Ok(parts) => Ok(Telemetry {
                project_id: parts.project_id,
                resource: parts.resource,
                tracer_provider: parts.tracer_provider,
                meter_provider: parts.meter_provider,
                credentials: parts.credentials,
                registry,
                state: PipelineState::Running,
            }),
            Err(cause) => {
                let cleanup = registry.run(settings.cleanup_timeout).await;
                Err(cause.with_cleanup(cleanup))
            }
        }
    }
}

struct Parts {
    project_id: String,
    resource: Resource,
    credentials: Credentials,
    tracer_provider: TracerProvider,
    meter_provider: SdkMeterProvider,
}

async fn bring_up<F: ExporterFactory>(
    env: Arc<dyn Environment>,
    exporters: &F,
    settings: &TelemetrySettings,
    registry: &mut ShutdownRegistry,
) -> Result<Parts, TelemetryError> {
    let project_id = env.project_id().await?;

    let resource = build_resource(&project_id, settings);

    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    let credentials = Credentials::new(env.access_token().await?);
    if let Some(refresher) = credentials.spawn_refresher(Arc::clone(&env)) {
        registry.register("credential refresher", move || {
            refresher.abort();
            Ok(())
        });
    }

    let tracer_provider = exporters.tracer_provider(&resource, &credentials, &project_id)?;
    let provider = tracer_provider.clone();
    registry.register("tracer provider", move || {
        provider
            .shutdown()
            .map_err(|e| TelemetryError::shutdown("tracer provider", e))
    });
    global::set_tracer_provider(tracer_provider.clone());

    let meter_provider = exporters.meter_provider(&resource, &credentials, &project_id)?;
    let provider = meter_provider.clone();
    registry.register("meter provider", move || {
        provider
            .shutdown()
            .map_err(|e| TelemetryError::shutdown("meter provider", e))
    });
    global::set_meter_provider(meter_provider.clone());

    Ok(Parts {
        project_id,
        resource,
        credentials,
        tracer_provider,
        meter_provider,
    })
}

/// A running telemetry pipeline.
///
/// Owned by `main` for the life of the process; the logger and the request
/// counter are built from it.
pub struct Telemetry {
    project_id: String,
    resource: Resource,
    tracer_provider: TracerProvider,
    meter_provider: SdkMeterProvider,
    credentials: Credentials,
    registry: ShutdownRegistry,
    state: PipelineState,
}

impl Telemetry {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn tracer(&self) -> Tracer {
        service_tracer(&self.tracer_provider)
    }

    pub fn meter(&self) -> Meter {
        self.meter_provider.meter(SCOPE_NAME)
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Drain and close every sub-resource, in the order they were created.
    ///
    /// All failures are reported together. Calling this again is a no-op
    /// that returns `Ok(())`.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<(), TelemetryError> {
        if self.state == PipelineState::Shutdown {
            return Ok(());
        }
        self.state = PipelineState::ShuttingDown;
        let result = self.registry.run(timeout).await;
        self.state = PipelineState::Shutdown;
        result
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("project_id", &self.project_id)
            .field("state", &self.state)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
