//! OpenTelemetry observability infrastructure.
//!
//! Provides:
//! - Telemetry pipeline bootstrap with incremental, aggregated teardown
//! - Cloud Logging JSON lines correlated with the active trace
//! - OTLP trace and metric export authenticated with instance credentials

use thiserror::Error;

use crate::environment::ResolutionError;

pub mod credentials;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod resource;
pub mod shutdown;
pub mod tracing;

pub use pipeline::{
    ExporterFactory, OtlpExporters, PipelineState, Telemetry, TelemetryPipeline, TelemetrySettings,
};

/// Failures of the telemetry pipeline.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("environment resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("failed to initialize {component}: {message}")]
    Initialization {
        component: &'static str,
        message: String,
    },

    #[error("failed to shut down {component}: {message}")]
    Shutdown {
        component: &'static str,
        message: String,
    },

    #[error("{component} did not shut down before the deadline")]
    Timeout { component: &'static str },

    #[error("{}", display_joined(.0))]
    Joined(Vec<TelemetryError>),
}

impl TelemetryError {
    pub fn init(component: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Initialization {
            component,
            message: err.to_string(),
        }
    }

    pub fn shutdown(component: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Shutdown {
            component,
            message: err.to_string(),
        }
    }

    /// Combine errors into one: `None` when empty, the error itself when
    /// there is exactly one, [`TelemetryError::Joined`] otherwise.
    pub fn join(errors: impl IntoIterator<Item = TelemetryError>) -> Option<Self> {
        let mut errors: Vec<_> = errors.into_iter().flat_map(Self::into_flat).collect();
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Joined(errors)),
        }
    }

    /// Attach the outcome of the cleanup that followed this error.
    pub fn with_cleanup(self, cleanup: Result<(), TelemetryError>) -> Self {
        match cleanup {
            Ok(()) => self,
            Err(e) => {
                let mut errors = self.into_flat();
                errors.extend(e.into_flat());
                Self::Joined(errors)
            }
        }
    }

    /// The leaf errors, with nested joins expanded.
    pub fn flatten(&self) -> Vec<&TelemetryError> {
        match self {
            Self::Joined(errors) => errors.iter().flat_map(Self::flatten).collect(),
            other => vec![other],
        }
    }

    fn into_flat(self) -> Vec<TelemetryError> {
        match self {
            Self::Joined(errors) => errors.into_iter().flat_map(Self::into_flat).collect(),
            other => vec![other],
        }
    }
}

fn display_joined(errors: &[TelemetryError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}
