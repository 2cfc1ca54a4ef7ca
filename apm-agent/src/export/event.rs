//! Records handed to the [`EventQueue`](super::EventQueue).
use crate::capture::LogLevel;
use crate::error::AgentResult;
use crate::trace::{CompressionStrategy, Frame, Outcome, SpanId, TraceId, TraceParent};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One finished unit of telemetry.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    /// A finished transaction.
    Transaction(TransactionRecord),
    /// A finished span or composite span.
    Span(SpanRecord),
    /// A captured error or message.
    Error(ErrorRecord),
}

impl Event {
    /// The intake event type: `"transaction"`, `"span"` or `"error"`.
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::Transaction(_) => "transaction",
            Event::Span(_) => "span",
            Event::Error(_) => "error",
        }
    }

    /// Renders the event as one NDJSON line, `{"<type>": {...}}`, without
    /// the trailing newline.
    pub fn to_ndjson_line(&self) -> AgentResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Mutable access to the free-form context of the event, if it has one.
    pub fn context_mut(&mut self) -> Option<&mut Map<String, Value>> {
        match self {
            Event::Transaction(record) => record.context.as_mut(),
            Event::Span(record) => record.context.as_mut(),
            Event::Error(record) => record.context.as_mut(),
        }
    }
}

/// A causal reference to a span in another trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Link {
    /// Trace of the linked span.
    pub trace_id: TraceId,
    /// The linked span.
    pub span_id: SpanId,
}

impl Link {
    /// Create a link to the given span.
    pub fn new(trace_id: TraceId, span_id: SpanId) -> Self {
        Link { trace_id, span_id }
    }
}

impl From<&TraceParent> for Link {
    fn from(trace_parent: &TraceParent) -> Self {
        Link::new(trace_parent.trace_id(), trace_parent.span_id())
    }
}

/// Started and dropped span counters of a transaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SpanCount {
    /// Spans queued for sending. A composite counts once.
    pub started: usize,
    /// Spans refused by the span budget or discarded as too short.
    pub dropped: usize,
}

/// Aggregated statistics of the dropped spans sharing one destination and
/// outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DroppedSpanStatRecord {
    /// `destination.service.resource` of the dropped spans.
    pub destination_service_resource: String,
    /// Outcome of the dropped spans.
    pub outcome: Outcome,
    /// Count and total duration.
    pub duration: DroppedSpanDuration,
}

/// Count and duration sum of dropped spans.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DroppedSpanDuration {
    /// Number of dropped spans.
    pub count: u64,
    /// Sum of their durations.
    pub sum: DurationSum,
}

/// A duration sum in microseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DurationSum {
    /// Microseconds.
    pub us: u64,
}

/// Aggregate metadata of a compressed span.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompositeRecord {
    /// How the spans were matched.
    pub compression_strategy: CompressionStrategy,
    /// Number of spans merged, always at least 2.
    pub count: usize,
    /// Sum of the merged spans' durations in milliseconds.
    pub sum: f64,
}

/// A finished transaction as sent to the collector.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransactionRecord {
    /// Identifier.
    pub id: SpanId,
    /// Trace the record belongs to.
    pub trace_id: TraceId,
    /// Only set when the transaction continues an inbound trace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SpanId>,
    /// Display name.
    pub name: String,
    /// Free-form category such as `request`.
    #[serde(rename = "type")]
    pub transaction_type: String,
    /// Result string such as `HTTP 2xx`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Outcome of the operation.
    pub outcome: Outcome,
    /// Microseconds since the Unix epoch.
    pub timestamp: u64,
    /// Milliseconds.
    pub duration: f64,
    /// Whether spans and context were recorded.
    pub sampled: bool,
    /// Omitted when the rate is undefined by the parent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<f64>,
    /// Span counters.
    pub span_count: SpanCount,
    /// Statistics of dropped spans.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dropped_spans_stats: Vec<DroppedSpanStatRecord>,
    /// Links to spans in other traces.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    /// Only present for sampled transactions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
}

/// A finished span as sent to the collector.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpanRecord {
    /// Identifier.
    pub id: SpanId,
    /// The owning transaction.
    pub transaction_id: SpanId,
    /// The parent span, or the transaction for direct children.
    pub parent_id: SpanId,
    /// Trace the record belongs to.
    pub trace_id: TraceId,
    /// Display name.
    pub name: String,
    /// Operation type such as `db`.
    #[serde(rename = "type")]
    pub span_type: String,
    /// Operation subtype such as `postgresql`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Operation action such as `query`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Milliseconds since the start of the transaction.
    pub start: f64,
    /// Microseconds since the Unix epoch.
    pub timestamp: u64,
    /// Milliseconds.
    pub duration: f64,
    /// Outcome of the operation.
    pub outcome: Outcome,
    /// Whether the operation ran synchronously.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<bool>,
    /// Sample rate of the trace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<f64>,
    /// Free-form context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    /// Frames of the call site.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stacktrace: Vec<Frame>,
    /// Set when the record stands for several merged spans.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composite: Option<CompositeRecord>,
    /// Links to spans in other traces.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
}

impl SpanRecord {
    /// `context.destination.service.resource`, if set.
    pub fn destination_resource(&self) -> Option<&str> {
        destination_resource(self.context.as_ref()?)
    }
}

/// A captured error or message.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorRecord {
    /// 128-bit error id.
    pub id: TraceId,
    /// Microseconds since the Unix epoch.
    pub timestamp: u64,
    /// Trace the record belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    /// The owning transaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<SpanId>,
    /// Current span, or the transaction when no span is current.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SpanId>,
    /// Function the error originated from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub culprit: Option<String>,
    /// Set for captured errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionRecord>,
    /// Set for captured messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogRecord>,
    /// The transaction the error happened in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<ErrorTransactionRecord>,
    /// Free-form context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
}

/// The error itself and its chain of causes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExceptionRecord {
    /// Message text.
    pub message: String,
    /// Short type name of the error.
    #[serde(rename = "type")]
    pub exception_type: String,
    /// Whether the application handled the error.
    pub handled: bool,
    /// Frames of the call site.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stacktrace: Vec<Frame>,
    /// Errors that caused this one.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cause: Vec<ExceptionRecord>,
}

/// A captured message.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogRecord {
    /// Message text.
    pub message: String,
    /// Severity.
    pub level: LogLevel,
    /// Frames of the call site.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stacktrace: Vec<Frame>,
}

/// Summary of the transaction an error happened in.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorTransactionRecord {
    /// Whether spans and context were recorded.
    pub sampled: bool,
    /// Free-form category such as `request`.
    #[serde(rename = "type")]
    pub transaction_type: String,
    /// Display name.
    pub name: String,
}

pub(crate) fn destination_resource(context: &Map<String, Value>) -> Option<&str> {
    context
        .get("destination")?
        .get("service")?
        .get("resource")?
        .as_str()
}

pub(crate) fn micros_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

pub(crate) fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn span_record() -> SpanRecord {
        SpanRecord {
            id: SpanId::from(2),
            transaction_id: SpanId::from(1),
            parent_id: SpanId::from(1),
            trace_id: TraceId::from(3),
            name: "SELECT".into(),
            span_type: "db".into(),
            subtype: Some("postgresql".into()),
            action: None,
            start: 1.5,
            timestamp: 10,
            duration: 2.0,
            outcome: Outcome::Success,
            sync: None,
            sample_rate: None,
            context: json!({"destination": {"service": {"resource": "postgresql"}}})
                .as_object()
                .cloned(),
            stacktrace: Vec::new(),
            composite: None,
            links: Vec::new(),
        }
    }

    #[test]
    fn ndjson_line_is_keyed_by_event_type() {
        let event = Event::Span(span_record());
        assert_eq!(event.event_type(), "span");
        let line = event.to_ndjson_line().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["span"]["id"], "0000000000000002");
        assert_eq!(value["span"]["type"], "db");
        assert_eq!(value["span"]["outcome"], "success");
        assert!(value["span"].get("action").is_none());
        assert!(value["span"].get("composite").is_none());
        assert!(!line.contains('\n'));
    }

    #[test]
    fn reads_destination_resource() {
        let mut record = span_record();
        assert_eq!(record.destination_resource(), Some("postgresql"));
        record.context = None;
        assert_eq!(record.destination_resource(), None);
    }

    #[test]
    fn time_conversions() {
        assert_eq!(millis(Duration::from_micros(1500)), 1.5);
        assert_eq!(micros_since_epoch(UNIX_EPOCH + Duration::from_secs(2)), 2_000_000);
    }
}
