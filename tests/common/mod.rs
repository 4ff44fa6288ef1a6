//! Test utilities and server harness for genfacts tests.
//!
//! Provides:
//! - A scripted in-process model
//! - Router setup over a temporary static directory
//! - Captured, correlated log output
//! - A mock metadata server on an ephemeral port

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use genfacts::model::{FactsModel, Generation, GenerationError};
use genfacts::observability::logging::correlated_subscriber;
use genfacts::observability::metrics::{GenerationCounter, MODEL_CALL_COUNTER};
use genfacts::observability::tracing::service_tracer;
use genfacts::server::{create_router, ServerState};
use opentelemetry::metrics::MeterProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::data::Sum;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::testing::metrics::InMemoryMetricsExporter;
use opentelemetry_sdk::trace::TracerProvider;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

pub const TEST_PROJECT: &str = "test-project";

pub const INDEX_HTML: &str = "<html><body><h1>Fun facts</h1></body></html>";

/// What a [`ScriptedModel`] answers.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Facts mentioning the prompt.
    Facts,
    /// A response without candidates.
    Empty,
    /// The backend is overloaded.
    Overloaded,
}

/// In-process model with a fixed behavior.
pub struct ScriptedModel {
    reply: Reply,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply,
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Hold every answer back for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Prompts received so far, in arrival order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

/// HTML the scripted model returns for `prompt`.
pub fn facts_for(prompt: &str) -> String {
    format!("<ul><li>{prompt}</li></ul>")
}

#[async_trait]
impl FactsModel for ScriptedModel {
    async fn generate(&self, prompt: &str) -> Result<Generation, GenerationError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.reply {
            Reply::Facts => Generation::from_raw(json!({
                "candidates": [
                    {"content": {"role": "model", "parts": [{"text": facts_for(prompt)}]}}
                ]
            })),
            Reply::Empty => Generation::from_raw(json!({"candidates": []})),
            Reply::Overloaded => Err(GenerationError::Overloaded(
                reqwest::StatusCode::TOO_MANY_REQUESTS,
            )),
        }
    }
}

/// A response collected in full.
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: String,
}

/// The genfacts router over a scripted model and a temporary static dir.
///
/// The directory is automatically cleaned up when the app is dropped.
pub struct TestApp {
    pub model: Arc<ScriptedModel>,
    pub generations: Arc<GenerationCounter>,
    router: Router,
    meter_provider: SdkMeterProvider,
    exported: InMemoryMetricsExporter,
    _static_dir: TempDir,
}

impl TestApp {
    pub fn new(model: ScriptedModel) -> Self {
        let static_dir = TempDir::new().expect("failed to create temp dir");
        std::fs::write(static_dir.path().join("index.html"), INDEX_HTML)
            .expect("failed to write index.html");

        // The reader's worker gets its own thread, so flushing from a
        // current-thread test runtime cannot deadlock.
        let exported = InMemoryMetricsExporter::default();
        let meter_provider = SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(exported.clone(), runtime::TokioCurrentThread).build())
            .build();
        let generations = Arc::new(GenerationCounter::new(
            &meter_provider.meter("genfacts-test"),
        ));
        let model = Arc::new(model);
        let state = Arc::new(ServerState {
            model: model.clone(),
            generations: generations.clone(),
        });

        Self {
            model,
            generations,
            router: create_router(state, static_dir.path()),
            meter_provider,
            exported,
            _static_dir: static_dir,
        }
    }

    /// Value of the exported `model_call_counter` point labeled exactly
    /// `language=rust`, after flushing the meter provider.
    pub fn exported_generations(&self) -> Option<u64> {
        self.meter_provider.force_flush().unwrap();
        let exported = self.exported.get_finished_metrics().unwrap();
        let latest = exported.last()?;

        let points: Vec<_> = latest
            .scope_metrics
            .iter()
            .flat_map(|scope| &scope.metrics)
            .filter(|metric| metric.name == MODEL_CALL_COUNTER)
            .filter_map(|metric| metric.data.as_any().downcast_ref::<Sum<u64>>())
            .flat_map(|sum| &sum.data_points)
            .collect();
        assert!(points.len() <= 1, "unexpected series: {points:?}");

        let point = points.first()?;
        assert_eq!(point.attributes, vec![KeyValue::new("language", "rust")]);
        Some(point.value)
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        self.request(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn request(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        TestResponse {
            status,
            content_type,
            body: String::from_utf8(bytes.to_vec()).unwrap(),
        }
    }
}

/// In-memory log output, one JSON object per line.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn lines(&self) -> Vec<Value> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).expect("log line is not JSON"))
            .collect()
    }

    /// Lines whose message is `message`.
    pub fn with_message(&self, message: &str) -> Vec<Value> {
        self.lines()
            .into_iter()
            .filter(|line| line["message"] == message)
            .collect()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// The correlated logger, installed for the current thread.
pub struct CorrelatedLogs {
    pub capture: LogCapture,
    _guard: DefaultGuard,
    _provider: TracerProvider,
}

impl CorrelatedLogs {
    pub fn install() -> Self {
        let provider = TracerProvider::builder().build();
        let capture = LogCapture::default();
        let subscriber = correlated_subscriber(
            TEST_PROJECT,
            service_tracer(&provider),
            "debug",
            capture.clone(),
        );
        Self {
            capture,
            _guard: tracing::subscriber::set_default(subscriber),
            _provider: provider,
        }
    }
}

/// Answers of the mock metadata server. `None` answers 404.
#[derive(Debug, Clone, Default)]
pub struct MockMetadata {
    pub project_id: Option<String>,
    pub region: Option<String>,
    pub token: Option<Value>,
}

struct MetadataState {
    answers: MockMetadata,
    hits: AtomicUsize,
}

/// A running mock metadata server.
pub struct MetadataServer {
    pub host: String,
    state: Arc<MetadataState>,
    handle: JoinHandle<()>,
}

impl MetadataServer {
    pub async fn spawn(answers: MockMetadata) -> Self {
        let state = Arc::new(MetadataState {
            answers,
            hits: AtomicUsize::new(0),
        });
        let app = Router::new()
            .route("/computeMetadata/v1/*key", get(metadata))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            host,
            state,
            handle,
        }
    }

    /// Requests that carried the metadata header.
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MetadataServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn metadata(
    State(state): State<Arc<MetadataState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    if headers
        .get("metadata-flavor")
        .and_then(|v| v.to_str().ok())
        != Some("Google")
    {
        return StatusCode::FORBIDDEN.into_response();
    }
    state.hits.fetch_add(1, Ordering::SeqCst);

    let answers = &state.answers;
    let answer = match key.trim_start_matches('/') {
        "project/project-id" => answers.project_id.clone(),
        "instance/region" => answers.region.clone(),
        "instance/service-accounts/default/token" => {
            answers.token.as_ref().map(Value::to_string)
        }
        _ => None,
    };

    match answer {
        Some(body) => body.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
