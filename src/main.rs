//! Genfacts: fun facts from Gemini on Vertex AI, with correlated logs,
//! traces and metrics exported to Google Cloud.
//!
//! # Usage
//!
//! ```bash
//! genfacts --port 8080 --project-id my-project --region us-central1
//! ```
//!
//! Environment variables can also be used:
//! - `PORT`: Port to listen on
//! - `GOOGLE_CLOUD_PROJECT` / `LOCATION_ID`: skip the metadata server lookups
//! - `MODEL_NAME`: Gemini model to call
//! - `RUST_LOG`: Log filter (trace, debug, info, warn, error)

use genfacts::config::Config;
use genfacts::environment::{Environment, MetadataEnvironment};
use genfacts::model::VertexModel;
use genfacts::observability::metrics::GenerationCounter;
use genfacts::observability::{
    logging, OtlpExporters, Telemetry, TelemetryError, TelemetryPipeline, TelemetrySettings,
};
use genfacts::server::{run_server, ServerState};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;

/// Print startup banner with version and configuration.
fn print_banner(config: &Config, project_id: &str, region: &str) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        r#"
  Genfacts v{} - fun facts from Gemini

  Configuration:
    Address:    {}:{}
    Project:    {}
    Region:     {}
    Model:      {}
    Telemetry:  {}

  Press Ctrl+C to shutdown gracefully.
"#,
        version,
        config.host,
        config.port,
        project_id,
        region,
        config.model_name,
        config.otel_endpoint,
    );
}

/// Resolve the region, then bring the telemetry pipeline up.
async fn start_telemetry(
    config: &Config,
    env: Arc<dyn Environment>,
) -> Result<(Telemetry, String), TelemetryError> {
    let region = env.region().await?;
    let settings = TelemetrySettings::from_config(config, Some(region.clone()));
    let exporters = OtlpExporters::new(&settings);
    let telemetry = TelemetryPipeline::initialize(env, &exporters, &settings).await?;
    Ok((telemetry, region))
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating shutdown...");
                    }
                }
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    }

    if let Err(e) = ctrl_c.await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        return;
    }
    tracing::info!("Received Ctrl+C, initiating shutdown...");
}

/// Drain telemetry once, logging every failure.
async fn shutdown_telemetry(telemetry: &mut Telemetry, config: &Config) {
    if let Err(e) = telemetry.shutdown(config.shutdown_timeout()).await {
        for failure in e.flatten() {
            tracing::error!(error = %failure, "Telemetry shutdown failed");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration from CLI arguments and environment
    let config = Config::parse_args();
    let env: Arc<dyn Environment> = Arc::new(MetadataEnvironment::from_config(&config));

    // Telemetry first: the logger is built from it
    let (mut telemetry, region) = match start_telemetry(&config, env).await {
        Ok(started) => started,
        Err(e) => {
            let _ = logging::init_fallback(&config.log_level);
            tracing::error!(error = %e, "Failed to initialize telemetry");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&telemetry, &config.log_level) {
        eprintln!("genfacts: {e}");
        shutdown_telemetry(&mut telemetry, &config).await;
        return ExitCode::FAILURE;
    }

    print_banner(&config, telemetry.project_id(), &region);

    let state = Arc::new(ServerState {
        model: Arc::new(VertexModel::new(
            telemetry.credentials().clone(),
            telemetry.project_id(),
            &region,
            &config.model_name,
        )),
        generations: Arc::new(GenerationCounter::new(&telemetry.meter())),
    });

    // Create shutdown signal channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let served = run_server(&config, state, shutdown_rx).await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "HTTP server failed");
    }

    shutdown_telemetry(&mut telemetry, &config).await;

    match served {
        Ok(()) => {
            tracing::info!("Genfacts shutdown complete");
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::FAILURE,
    }
}
