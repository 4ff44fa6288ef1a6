//! Configuration parsing for the genfacts server.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides (Cloud Run sets `PORT`, `K_SERVICE`, ...)
//! - Sensible defaults for quick start

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Model used when `MODEL_NAME` is not set.
pub const DEFAULT_MODEL_NAME: &str = "gemini-2.5-flash";

/// Google Cloud Observability OTLP endpoint.
pub const DEFAULT_OTEL_ENDPOINT: &str = "https://telemetry.googleapis.com:443";

/// Genfacts: fun facts from Gemini, fully observable.
#[derive(Parser, Debug, Clone)]
#[command(name = "genfacts")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Host address to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Gemini model identifier
    #[arg(long, env = "MODEL_NAME", default_value = DEFAULT_MODEL_NAME)]
    pub model_name: String,

    /// Explicit project id (skips the metadata server lookup)
    #[arg(long, env = "GOOGLE_CLOUD_PROJECT")]
    pub project_id: Option<String>,

    /// Explicit region (skips the metadata server lookup)
    #[arg(long, env = "LOCATION_ID")]
    pub region: Option<String>,

    /// Service name reported in the telemetry resource
    #[arg(long, env = "K_SERVICE")]
    pub service_name: Option<String>,

    /// Service revision reported in the telemetry resource
    #[arg(long, env = "K_REVISION")]
    pub service_revision: Option<String>,

    /// Log filter (trace, debug, info, warn, error, or EnvFilter directives)
    #[arg(long, env = "RUST_LOG", default_value = "info,genfacts=debug")]
    pub log_level: String,

    /// OTLP/gRPC endpoint for traces and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT", default_value = DEFAULT_OTEL_ENDPOINT)]
    pub otel_endpoint: String,

    /// Interval between periodic metric exports, in milliseconds
    #[arg(long, env = "OTEL_METRIC_EXPORT_INTERVAL", default_value_t = 60_000)]
    pub metric_export_interval_ms: u64,

    /// Upper bound on draining telemetry at exit, in seconds
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,

    /// Directory served at `/`
    #[arg(long, env = "STATIC_DIR", default_value = "./static")]
    pub static_dir: PathBuf,

    /// Metadata server host
    #[arg(long, env = "GCE_METADATA_HOST", default_value = "metadata.google.internal")]
    pub metadata_host: String,

    /// Static OAuth access token (skips the metadata server token lookup)
    #[arg(long, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn metric_export_interval(&self) -> Duration {
        Duration::from_millis(self.metric_export_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Create a configuration for testing.
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0, // Random port
            project_id: Some("test-project".into()),
            region: Some("us-central1".into()),
            access_token: Some("test-token".into()),
            log_level: "debug".into(),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            model_name: DEFAULT_MODEL_NAME.into(),
            project_id: None,
            region: None,
            service_name: None,
            service_revision: None,
            log_level: "info,genfacts=debug".into(),
            otel_endpoint: DEFAULT_OTEL_ENDPOINT.into(),
            metric_export_interval_ms: 60_000,
            shutdown_timeout_secs: 10,
            static_dir: PathBuf::from("./static"),
            metadata_host: "metadata.google.internal".into(),
            access_token: None,
        }
    }
}
