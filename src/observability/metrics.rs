//! OpenTelemetry metrics.
//!
//! Key metrics:
//! - model_call_counter: Counter of successful generations, labeled `language`

use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;
use opentelemetry_otlp::TonicExporterBuilder;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::{runtime, Resource};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::TelemetryError;

/// Name of the generation counter.
pub const MODEL_CALL_COUNTER: &str = "model_call_counter";

/// Build a meter provider exporting periodically over OTLP.
pub fn build_meter_provider(
    exporter: TonicExporterBuilder,
    resource: Resource,
    interval: Duration,
) -> Result<SdkMeterProvider, TelemetryError> {
    opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_exporter(exporter)
        .with_resource(resource)
        .with_period(interval)
        .build()
        .map_err(|e| TelemetryError::init("metrics exporter", e))
}

/// Process-wide count of successful model generations.
///
/// Created once at startup and shared by every request. Safe to increment
/// concurrently; never reset.
#[derive(Debug)]
pub struct GenerationCounter {
    counter: Counter<u64>,
    labels: Vec<KeyValue>,
    total: AtomicU64,
}

impl GenerationCounter {
    /// Create the counter from a meter, labeled `language=rust`.
    pub fn new(meter: &Meter) -> Self {
        Self {
            counter: meter
                .u64_counter(MODEL_CALL_COUNTER)
                .with_description("number of model invocations")
                .with_unit("1")
                .init(),
            labels: vec![KeyValue::new("language", "rust")],
            total: AtomicU64::new(0),
        }
    }

    /// Record one successful generation.
    pub fn record_success(&self) {
        self.counter.add(1, &self.labels);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Generations recorded by this process so far.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn labels(&self) -> &[KeyValue] {
        &self.labels
    }
}
