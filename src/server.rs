//! HTTP server setup and lifecycle.
//!
//! Configures the axum router with:
//! - `/facts`, traced per request with its route name
//! - Static assets for everything else
//! - Graceful shutdown support

use axum::http::{HeaderMap, Request, Response};
use axum::routing::{get, MethodRouter};
use axum::Router;
use opentelemetry::propagation::Extractor;
use opentelemetry::{global, Context};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::services::ServeDir;
use tower_http::trace::{MakeSpan, OnResponse, TraceLayer};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::config::Config;
use crate::model::FactsModel;
use crate::observability::metrics::GenerationCounter;
use crate::service::handle_facts;

/// Server state shared across handlers.
pub struct ServerState {
    pub model: Arc<dyn FactsModel>,
    pub generations: Arc<GenerationCounter>,
}

/// Opens one server span per request, named after the route.
#[derive(Debug, Clone, Copy)]
pub struct RouteSpan {
    route: &'static str,
}

impl<B> MakeSpan<B> for RouteSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let span = tracing::info_span!(
            "http.request",
            otel.name = self.route,
            otel.kind = "server",
            http.route = self.route,
            http.request.method = %request.method(),
            url.path = request.uri().path(),
            http.response.status_code = tracing::field::Empty,
        );
        span.set_parent(remote_context(request.headers()));
        span
    }
}

/// Records the status on the request span.
#[derive(Debug, Clone, Copy)]
pub struct RecordStatus;

impl<B> OnResponse<B> for RecordStatus {
    fn on_response(self, response: &Response<B>, latency: Duration, span: &Span) {
        let status = response.status().as_u16();
        span.record("http.response.status_code", status);
        tracing::debug!(
            status,
            latency_ms = latency.as_secs_f64() * 1000.0,
            "Request completed"
        );
    }
}

/// Reads trace context from request headers.
struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

/// Trace context propagated by the caller, through the global propagator.
fn remote_context(headers: &HeaderMap) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}

/// Wrap `route` so each request runs inside its own span named `name`.
///
/// The span continues any trace the caller propagated and is closed when the
/// response finishes, whether the handler succeeded or not.
pub fn instrumented<S>(name: &'static str, route: MethodRouter<S>) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    route.layer(
        TraceLayer::new_for_http()
            .make_span_with(RouteSpan { route: name })
            .on_response(RecordStatus),
    )
}

/// Create the HTTP router.
pub fn create_router(state: Arc<ServerState>, static_dir: &Path) -> Router {
    Router::new()
        .route("/facts", instrumented("/facts", get(handle_facts)))
        .fallback_service(ServeDir::new(static_dir))
        .with_state(state)
}

/// Run the genfacts HTTP server.
///
/// # Arguments
///
/// * `config` - Server configuration
/// * `state` - Shared handler state
/// * `shutdown_rx` - Receiver for shutdown signal
///
/// # Returns
///
/// Returns when the server has shut down and in-flight requests are done.
pub async fn run_server(
    config: &Config,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let app = create_router(state, &config.static_dir);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %listener.local_addr()?, "Starting genfacts HTTP server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            tracing::info!("Shutdown signal received, stopping server");
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}
