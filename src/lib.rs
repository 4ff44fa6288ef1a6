//! Genfacts: a fun-facts generator backed by Vertex AI Gemini.
//!
//! Every request is traced, every log line emitted while serving it carries
//! the trace it belongs to, and successful generations are counted.
//!
//! # Architecture
//!
//! - **Correlated**: JSON log lines carry Cloud Logging trace/span keys
//! - **Traced**: each route opens its own server span, continuing remote parents
//! - **Metered**: a process-wide `model_call_counter` exported over OTLP
//! - **Clean exit**: one shutdown drains every exporter and reports all failures
//!
//! # Modules
//!
//! - [`config`]: CLI and environment configuration
//! - [`environment`]: project, region and credential resolution
//! - [`model`]: Vertex AI `generateContent` client
//! - [`observability`]: telemetry pipeline, correlated logging, metrics
//! - [`server`]: axum router, route instrumentation, serving loop
//! - [`service`]: HTTP handlers

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions, // pipeline::TelemetryPipeline is fine
    clippy::must_use_candidate,      // Not all functions need #[must_use]
    clippy::missing_errors_doc,      // Error docs can be verbose
    clippy::missing_panics_doc       // Panic docs can be verbose
)]

pub mod config;
pub mod environment;
pub mod model;
pub mod observability;
pub mod server;
pub mod service;

/// Instrumentation scope used for the tracer and the meter.
pub const SCOPE_NAME: &str = "o11y/demo/rust";
