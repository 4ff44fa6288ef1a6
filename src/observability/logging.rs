//! Structured logging in the Cloud Logging JSON format.
//!
//! Every `tracing` event becomes one JSON object per line with `severity`,
//! `message` and `timestamp` keys. When the event happens inside an
//! OpenTelemetry span, [`Correlated`] adds the keys Cloud Logging uses to
//! link the line to its trace:
//!
//! ```text
//! logging.googleapis.com/trace          projects/<project>/traces/<trace id>
//! logging.googleapis.com/spanId         <span id>
//! logging.googleapis.com/trace_sampled  true | false
//! ```
//!
//! Code that logs only uses the `tracing` macros and does not know whether
//! correlation is on.

use chrono::{DateTime, SecondsFormat, Utc};
use opentelemetry::trace::{SpanContext, TraceContextExt};
use opentelemetry_sdk::trace::Tracer;
use serde_json::{Map, Number, Value};
use std::io::Write;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_opentelemetry::{OtelData, PreSampledTracer};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::{Telemetry, TelemetryError};

pub const TRACE_KEY: &str = "logging.googleapis.com/trace";
pub const SPAN_ID_KEY: &str = "logging.googleapis.com/spanId";
pub const TRACE_SAMPLED_KEY: &str = "logging.googleapis.com/trace_sampled";

const SEVERITY_KEY: &str = "severity";
const MESSAGE_KEY: &str = "message";
const TIMESTAMP_KEY: &str = "timestamp";

/// Filter used when the configured one does not parse.
const FALLBACK_FILTER: &str = "info";

/// One log line before serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: Level,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub attributes: Map<String, Value>,
}

impl LogRecord {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp: Utc::now(),
            message: message.into(),
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Cloud Logging severity for a `tracing` level.
pub fn severity(level: Level) -> &'static str {
    match level {
        Level::TRACE | Level::DEBUG => "DEBUG",
        Level::INFO => "INFO",
        Level::WARN => "WARNING",
        Level::ERROR => "ERROR",
    }
}

/// The JSON object written for `record`.
///
/// Attributes whose key collides with `severity`, `message` or `timestamp`
/// are kept under `attr.<key>`.
pub fn to_json(record: LogRecord) -> Value {
    let mut object = Map::new();
    object.insert(SEVERITY_KEY.into(), severity(record.level).into());
    object.insert(MESSAGE_KEY.into(), record.message.into());
    object.insert(
        TIMESTAMP_KEY.into(),
        record
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
            .into(),
    );
    for (key, value) in record.attributes {
        if matches!(key.as_str(), SEVERITY_KEY | MESSAGE_KEY | TIMESTAMP_KEY) {
            object.insert(format!("attr.{key}"), value);
        } else {
            object.insert(key, value);
        }
    }
    Value::Object(object)
}

/// Destination for log records.
pub trait RecordSink: Send + Sync + 'static {
    /// Emit `record`, produced while `span` was active (if any).
    fn emit(&self, span: Option<&SpanContext>, record: LogRecord);
}

/// Writes records as JSON lines.
pub struct JsonSink<W> {
    make_writer: W,
}

impl<W> JsonSink<W>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    pub fn new(make_writer: W) -> Self {
        Self { make_writer }
    }
}

impl<W> RecordSink for JsonSink<W>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fn emit(&self, _span: Option<&SpanContext>, record: LogRecord) {
        let Ok(mut line) = serde_json::to_vec(&to_json(record)) else {
            return;
        };
        line.push(b'\n');
        // Nowhere left to report a failed log write.
        let _ = self.make_writer.make_writer().write_all(&line);
    }
}

/// Adds trace correlation keys before handing records to `inner`.
pub struct Correlated<S> {
    inner: S,
    trace_prefix: String,
}

impl<S: RecordSink> Correlated<S> {
    pub fn new(inner: S, project_id: &str) -> Self {
        Self {
            inner,
            trace_prefix: format!("projects/{project_id}/traces/"),
        }
    }
}

impl<S: RecordSink> RecordSink for Correlated<S> {
    fn emit(&self, span: Option<&SpanContext>, record: LogRecord) {
        let record = match span.filter(|s| s.is_valid()) {
            Some(span) => record
                .with_attribute(TRACE_KEY, format!("{}{}", self.trace_prefix, span.trace_id()))
                .with_attribute(SPAN_ID_KEY, span.span_id().to_string())
                .with_attribute(TRACE_SAMPLED_KEY, span.is_sampled()),
            None => record,
        };
        self.inner.emit(span, record);
    }
}

/// Bridges `tracing` events to a [`RecordSink`].
pub struct CloudLogLayer<S> {
    sink: S,
    tracer: Option<Tracer>,
}

impl<S: RecordSink> CloudLogLayer<S> {
    pub fn new(sink: S) -> Self {
        Self { sink, tracer: None }
    }

    /// Resolve span contexts with `tracer`, the one the OpenTelemetry layer uses.
    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    fn span_context<Sub>(&self, event: &Event<'_>, ctx: &Context<'_, Sub>) -> Option<SpanContext>
    where
        Sub: Subscriber + for<'a> LookupSpan<'a>,
    {
        let tracer = self.tracer.as_ref()?;
        let span = ctx.event_span(event)?;
        let mut extensions = span.extensions_mut();
        let otel_data = extensions.get_mut::<OtelData>()?;
        // Also fixes the sampling decision the span will be exported with.
        let cx = tracer.sampled_context(otel_data);
        let span_context = cx.span().span_context().clone();
        span_context.is_valid().then_some(span_context)
    }
}

impl<Sub, S> Layer<Sub> for CloudLogLayer<S>
where
    Sub: Subscriber + for<'a> LookupSpan<'a>,
    S: RecordSink,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, Sub>) {
        let mut record = LogRecord::new(*event.metadata().level(), String::new());
        event.record(&mut RecordVisitor(&mut record));

        let span_context = self.span_context(event, &ctx);
        self.sink.emit(span_context.as_ref(), record);
    }
}

struct RecordVisitor<'a>(&'a mut LogRecord);

impl RecordVisitor<'_> {
    fn insert(&mut self, field: &Field, value: Value) {
        self.0.attributes.insert(field.name().to_string(), value);
    }
}

impl Visit for RecordVisitor<'_> {
    fn record_f64(&mut self, field: &Field, value: f64) {
        let value = Number::from_f64(value).map_or_else(|| value.to_string().into(), Value::Number);
        self.insert(field, value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == MESSAGE_KEY {
            self.0.message = value.to_string();
        } else {
            self.insert(field, value.into());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == MESSAGE_KEY {
            self.0.message = format!("{value:?}");
        } else {
            self.insert(field, format!("{value:?}").into());
        }
    }
}

fn env_filter(filter: &str) -> EnvFilter {
    EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(FALLBACK_FILTER))
}

/// The correlated subscriber: filter, OpenTelemetry bridge and JSON lines
/// written to `make_writer`.
pub fn correlated_subscriber<W>(
    project_id: &str,
    tracer: Tracer,
    filter: &str,
    make_writer: W,
) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let sink = Correlated::new(JsonSink::new(make_writer), project_id);

    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(tracing_opentelemetry::layer().with_tracer(tracer.clone()))
        .with(CloudLogLayer::new(sink).with_tracer(tracer))
}

/// Install the correlated stdout logger for the running pipeline.
pub fn init(telemetry: &Telemetry, filter: &str) -> Result<(), TelemetryError> {
    correlated_subscriber(telemetry.project_id(), telemetry.tracer(), filter, std::io::stdout)
        .try_init()
        .map_err(|e| TelemetryError::init("logger", e))
}

/// Install an uncorrelated stdout logger, for when telemetry is unavailable.
pub fn init_fallback(filter: &str) -> Result<(), TelemetryError> {
    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(CloudLogLayer::new(JsonSink::new(std::io::stdout)))
        .try_init()
        .map_err(|e| TelemetryError::init("logger", e))
}
