//! # Span
//!
//! A [`Span`] is one timed operation within a transaction, such as a query
//! or an outbound request. Its name, context and outcome may change until it
//! ends; ending is idempotent.
//!
//! A [`DroppedSpan`] stands in for a span the transaction refused to record.
//! All mutators on it are no-ops, and its children are dropped as well.
use crate::apm_debug;
use crate::export::{destination_resource, micros_since_epoch, millis, Link, SpanRecord};
use crate::trace::transaction::{label_key, label_value};
use crate::trace::{
    lock, CompressionBuffer, FinishedSpan, Outcome, SpanId, TraceParent, Transaction,
};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

/// Describes a span to open.
///
/// ```
/// use apm_agent::trace::SpanBuilder;
/// use serde_json::json;
///
/// let builder = SpanBuilder::new("SELECT FROM users", "db")
///     .with_subtype("postgresql")
///     .with_action("query")
///     .with_context(json!({"db": {"instance": "users"}}).as_object().cloned().unwrap_or_default())
///     .leaf(true);
/// ```
#[derive(Clone, Debug, Default)]
pub struct SpanBuilder {
    pub(crate) name: String,
    pub(crate) span_type: String,
    pub(crate) subtype: Option<String>,
    pub(crate) action: Option<String>,
    pub(crate) context: Map<String, Value>,
    pub(crate) leaf: bool,
    pub(crate) links: Vec<Link>,
    pub(crate) start: Option<Instant>,
    pub(crate) duration: Option<Duration>,
    pub(crate) sync: Option<bool>,
    pub(crate) labels: Map<String, Value>,
}

impl SpanBuilder {
    /// A span with the given name and type, such as `db` or `external`.
    pub fn new(name: impl Into<String>, span_type: impl Into<String>) -> Self {
        SpanBuilder {
            name: name.into(),
            span_type: span_type.into(),
            ..Default::default()
        }
    }

    /// Sets the subtype, such as `postgresql`.
    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    /// Sets the action, such as `query`.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Sets the span context, such as `db`, `http` or `destination`.
    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Marks the span as a leaf. No spans are recorded beneath a leaf span.
    pub fn leaf(mut self, leaf: bool) -> Self {
        self.leaf = leaf;
        self
    }

    /// Links the span to spans of other traces.
    pub fn with_links(mut self, links: Vec<Link>) -> Self {
        self.links = links;
        self
    }

    /// Backdates the start of the span.
    pub fn with_start(mut self, start: Instant) -> Self {
        self.start = Some(start);
        self
    }

    /// Uses a known duration instead of measuring one.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Whether the operation runs synchronously.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Adds a label.
    pub fn with_label(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.labels.insert(label_key(key), label_value(value.into()));
        self
    }
}

/// Why a span was not recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// No transaction is current, or it is not sampled.
    NotRecording,
    /// The transaction reached its span budget. Counted as dropped.
    MaxSpansExceeded,
    /// The parent is a leaf span.
    LeafParent,
}

/// A recorded span.
///
/// `Span` is a cheap handle; clones refer to the same span.
#[derive(Clone)]
pub struct Span(Arc<SpanInner>);

struct SpanInner {
    id: SpanId,
    transaction: Transaction,
    parent: Option<Span>,
    leaf: bool,
    start: Instant,
    start_offset: Duration,
    timestamp: SystemTime,
    /// `None` once the span has ended.
    data: Mutex<Option<SpanData>>,
    buffer: CompressionBuffer,
}

#[derive(Debug)]
struct SpanData {
    name: String,
    span_type: String,
    subtype: Option<String>,
    action: Option<String>,
    context: Map<String, Value>,
    labels: Map<String, Value>,
    links: Vec<Link>,
    outcome: Option<Outcome>,
    sync: Option<bool>,
    duration: Option<Duration>,
    propagated: bool,
}

impl Span {
    pub(crate) fn new(transaction: Transaction, parent: Option<Span>, builder: SpanBuilder) -> Self {
        let start = builder.start.unwrap_or_else(Instant::now);
        let start_offset = start.saturating_duration_since(transaction.start());
        let timestamp = transaction.timestamp() + start_offset;
        let id = transaction.tracer().new_span_id();
        Span(Arc::new(SpanInner {
            id,
            parent,
            leaf: builder.leaf,
            start,
            start_offset,
            timestamp,
            data: Mutex::new(Some(SpanData {
                name: builder.name,
                span_type: builder.span_type,
                subtype: builder.subtype,
                action: builder.action,
                context: builder.context,
                labels: builder.labels,
                links: builder.links,
                outcome: None,
                sync: builder.sync,
                duration: builder.duration,
                propagated: false,
            })),
            buffer: CompressionBuffer::default(),
            transaction,
        }))
    }

    /// The span id.
    pub fn id(&self) -> SpanId {
        self.0.id
    }

    /// The owning transaction.
    pub fn transaction(&self) -> &Transaction {
        &self.0.transaction
    }

    /// The enclosing span, or the transaction for direct children.
    pub fn parent_id(&self) -> SpanId {
        self.0
            .parent
            .as_ref()
            .map_or_else(|| self.0.transaction.id(), Span::id)
    }

    /// Whether spans opened beneath this one are suppressed.
    pub fn is_leaf(&self) -> bool {
        self.0.leaf
    }

    /// Whether the span has ended.
    pub fn is_ended(&self) -> bool {
        lock(&self.0.data).is_none()
    }

    /// Operate on the span data if the span has not ended.
    fn with_data<T>(&self, f: impl FnOnce(&mut SpanData) -> T) -> Option<T> {
        lock(&self.0.data).as_mut().map(f)
    }

    /// Current name of the span.
    pub fn name(&self) -> Option<String> {
        self.with_data(|data| data.name.clone())
    }

    /// Renames the span.
    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.with_data(|data| data.name = name);
    }

    /// Sets the outcome, overriding the default applied at end.
    pub fn set_outcome(&self, outcome: Outcome) {
        self.with_data(|data| data.outcome = Some(outcome));
    }

    /// Derives the outcome from an HTTP response status; 4xx and 5xx are
    /// failures.
    pub fn set_outcome_from_http_status(&self, status_code: u16) {
        self.set_outcome(Outcome::for_span_status(status_code));
    }

    /// Merges `data` into the object stored under `key` in the span context.
    pub fn set_context(&self, key: &str, data: Map<String, Value>) {
        self.with_data(|span| merge_context(&mut span.context, key, data));
    }

    /// Sets a label on the span.
    pub fn label(&self, key: &str, value: impl Into<Value>) {
        let value = label_value(value.into());
        self.with_data(|data| data.labels.insert(label_key(key), value));
    }

    /// Links the span to a span of another trace.
    pub fn add_link(&self, link: Link) {
        self.with_data(|data| data.links.push(link));
    }

    /// Trace parent to send on an outgoing request made by this span.
    ///
    /// The span is marked as propagated: it is neither compressed nor
    /// discarded, because the downstream service refers to it.
    pub fn outbound_trace_parent(&self) -> TraceParent {
        self.with_data(|data| data.propagated = true);
        self.0.transaction.trace_parent().with_span_id(self.0.id)
    }

    /// Ends the span. The outcome defaults to success.
    pub fn end(&self) {
        self.end_with_default(Outcome::Success);
    }

    pub(crate) fn end_with_default(&self, default_outcome: Outcome) {
        let Some(data) = lock(&self.0.data).take() else {
            apm_debug!(name: "Span.AlreadyEnded", span_id = self.0.id.to_string());
            return;
        };
        let transaction = &self.0.transaction;
        let limits = transaction.limits();
        let duration = data.duration.unwrap_or_else(|| self.0.start.elapsed());
        let outcome = data.outcome.unwrap_or(default_outcome);

        let mut context = data.context;
        let resource = if self.0.leaf {
            Some(autofill_resource(
                &mut context,
                &data.span_type,
                data.subtype.as_deref(),
            ))
        } else {
            destination_resource(&context).map(str::to_owned)
        };
        if !data.labels.is_empty() {
            context.insert("tags".into(), Value::Object(data.labels));
        }

        let stacktrace = match limits.span_stack_trace_min_duration {
            Some(min) if duration >= min && limits.stack_trace_limit > 0 => {
                transaction.tracer().collect_frames(limits.stack_trace_limit)
            }
            _ => Vec::new(),
        };

        // A child that ended before us is reported before us.
        if let Some(child) = self.0.buffer.close() {
            transaction.report_span(child);
        }

        let finished = FinishedSpan {
            record: SpanRecord {
                id: self.0.id,
                transaction_id: transaction.id(),
                parent_id: self.parent_id(),
                trace_id: transaction.trace_id(),
                name: data.name,
                span_type: data.span_type,
                subtype: data.subtype,
                action: data.action,
                start: millis(self.0.start_offset),
                timestamp: micros_since_epoch(self.0.timestamp),
                duration: millis(duration),
                outcome,
                sync: data.sync,
                sample_rate: transaction.sample_rate(),
                context: (!context.is_empty()).then_some(context),
                stacktrace,
                composite: None,
                links: data.links,
            },
            start_offset: self.0.start_offset,
            duration,
            leaf: self.0.leaf,
            propagated: data.propagated,
            resource,
            composite: None,
        };

        let ready = match &self.0.parent {
            Some(parent) => parent.0.buffer.on_child_end(finished, &limits.compression),
            None => transaction
                .buffer()
                .on_child_end(finished, &limits.compression),
        };
        for span in ready {
            transaction.report_span(span);
        }
    }
}

impl PartialEq for Span {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("id", &self.0.id)
            .field("parent_id", &self.parent_id())
            .field("leaf", &self.0.leaf)
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// A span the transaction refused to record.
#[derive(Clone)]
pub struct DroppedSpan(Arc<DroppedSpanInner>);

struct DroppedSpanInner {
    reason: DropReason,
    transaction: Option<Transaction>,
    resource: Option<String>,
    start: Instant,
    duration: Option<Duration>,
    outcome: Mutex<Option<Outcome>>,
    ended: AtomicBool,
}

impl DroppedSpan {
    pub(crate) fn new(
        reason: DropReason,
        transaction: Option<Transaction>,
        builder: &SpanBuilder,
    ) -> Self {
        // Only spans refused by the budget show up in the dropped span
        // statistics.
        let resource = match reason {
            DropReason::MaxSpansExceeded => match destination_resource(&builder.context) {
                Some(resource) => Some(resource.to_owned()),
                None if builder.leaf => Some(resource_for(
                    &builder.context,
                    &builder.span_type,
                    builder.subtype.as_deref(),
                )),
                None => None,
            },
            _ => None,
        };
        DroppedSpan(Arc::new(DroppedSpanInner {
            reason,
            transaction,
            resource,
            start: builder.start.unwrap_or_else(Instant::now),
            duration: builder.duration,
            outcome: Mutex::new(None),
            ended: AtomicBool::new(false),
        }))
    }

    /// Why the span was not recorded.
    pub fn reason(&self) -> DropReason {
        self.0.reason
    }

    /// The transaction that refused the span, if there is one.
    pub fn transaction(&self) -> Option<&Transaction> {
        self.0.transaction.as_ref()
    }

    fn set_outcome(&self, outcome: Outcome) {
        *lock(&self.0.outcome) = Some(outcome);
    }

    fn end_with_default(&self, default_outcome: Outcome) {
        if self.0.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let (Some(transaction), Some(resource)) = (&self.0.transaction, &self.0.resource) else {
            return;
        };
        let outcome = lock(&self.0.outcome).unwrap_or(default_outcome);
        let duration = self.0.duration.unwrap_or_else(|| self.0.start.elapsed());
        transaction.track_dropped_spans(resource, outcome, 1, duration);
    }
}

impl fmt::Debug for DroppedSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DroppedSpan")
            .field("reason", &self.0.reason)
            .field("resource", &self.0.resource)
            .finish()
    }
}

/// The span handle instrumentation holds: either a recorded span or a
/// dropped stand-in with the same interface.
#[derive(Clone, Debug)]
pub enum ActiveSpan {
    /// The span is recorded.
    Recording(Span),
    /// The span was dropped; every operation is a no-op.
    Dropped(DroppedSpan),
}

impl ActiveSpan {
    /// Whether the span is recorded.
    pub fn is_recording(&self) -> bool {
        matches!(self, ActiveSpan::Recording(_))
    }

    /// Whether spans opened beneath this one are suppressed.
    pub fn is_leaf(&self) -> bool {
        match self {
            ActiveSpan::Recording(span) => span.is_leaf(),
            ActiveSpan::Dropped(_) => false,
        }
    }

    /// The span id of a recorded span.
    pub fn id(&self) -> Option<SpanId> {
        self.as_span().map(Span::id)
    }

    /// The recorded span, if any.
    pub fn as_span(&self) -> Option<&Span> {
        match self {
            ActiveSpan::Recording(span) => Some(span),
            ActiveSpan::Dropped(_) => None,
        }
    }

    /// The owning transaction.
    pub fn transaction(&self) -> Option<&Transaction> {
        match self {
            ActiveSpan::Recording(span) => Some(span.transaction()),
            ActiveSpan::Dropped(dropped) => dropped.transaction(),
        }
    }

    /// See [`Span::set_name`].
    pub fn set_name(&self, name: impl Into<String>) {
        if let ActiveSpan::Recording(span) = self {
            span.set_name(name);
        }
    }

    /// See [`Span::set_outcome`].
    pub fn set_outcome(&self, outcome: Outcome) {
        match self {
            ActiveSpan::Recording(span) => span.set_outcome(outcome),
            ActiveSpan::Dropped(dropped) => dropped.set_outcome(outcome),
        }
    }

    /// See [`Span::set_outcome_from_http_status`].
    pub fn set_outcome_from_http_status(&self, status_code: u16) {
        self.set_outcome(Outcome::for_span_status(status_code));
    }

    /// See [`Span::set_context`].
    pub fn set_context(&self, key: &str, data: Map<String, Value>) {
        if let ActiveSpan::Recording(span) = self {
            span.set_context(key, data);
        }
    }

    /// See [`Span::label`].
    pub fn label(&self, key: &str, value: impl Into<Value>) {
        if let ActiveSpan::Recording(span) = self {
            span.label(key, value);
        }
    }

    /// See [`Span::add_link`].
    pub fn add_link(&self, link: Link) {
        if let ActiveSpan::Recording(span) = self {
            span.add_link(link);
        }
    }

    /// Trace parent for an outgoing request. A dropped span propagates its
    /// transaction.
    pub fn outbound_trace_parent(&self) -> Option<TraceParent> {
        match self {
            ActiveSpan::Recording(span) => Some(span.outbound_trace_parent()),
            ActiveSpan::Dropped(dropped) => dropped
                .transaction()
                .map(Transaction::outbound_trace_parent),
        }
    }

    /// Ends the span. The outcome defaults to success.
    pub fn end(&self) {
        self.end_with_default(Outcome::Success);
    }

    pub(crate) fn end_with_default(&self, default_outcome: Outcome) {
        match self {
            ActiveSpan::Recording(span) => span.end_with_default(default_outcome),
            ActiveSpan::Dropped(dropped) => dropped.end_with_default(default_outcome),
        }
    }
}

impl From<Span> for ActiveSpan {
    fn from(span: Span) -> Self {
        ActiveSpan::Recording(span)
    }
}

impl From<DroppedSpan> for ActiveSpan {
    fn from(span: DroppedSpan) -> Self {
        ActiveSpan::Dropped(span)
    }
}

pub(crate) fn merge_context(context: &mut Map<String, Value>, key: &str, data: Map<String, Value>) {
    match context.get_mut(key) {
        Some(Value::Object(existing)) => existing.extend(data),
        _ => {
            context.insert(key.to_owned(), Value::Object(data));
        }
    }
}

/// `destination.service.resource` an exit span would get: the explicit
/// value, else `subtype/instance` for databases, `subtype/queue` for
/// messaging, else the subtype or the type.
fn resource_for(context: &Map<String, Value>, span_type: &str, subtype: Option<&str>) -> String {
    if let Some(resource) = destination_resource(context) {
        return resource.to_owned();
    }
    let kind = subtype.unwrap_or(span_type);
    let nested = |outer: &str, middle: &str, inner: Option<&str>| -> Option<String> {
        let value = context.get(outer)?.get(middle)?;
        let value = match inner {
            Some(inner) => value.get(inner)?,
            None => value,
        };
        value.as_str().map(str::to_owned)
    };
    if let Some(instance) = nested("db", "instance", None) {
        format!("{kind}/{instance}")
    } else if let Some(queue) = nested("message", "queue", Some("name")) {
        format!("{kind}/{queue}")
    } else {
        kind.to_owned()
    }
}

fn autofill_resource(
    context: &mut Map<String, Value>,
    span_type: &str,
    subtype: Option<&str>,
) -> String {
    let resource = resource_for(context, span_type, subtype);
    if destination_resource(context).is_none() {
        let mut destination = take_object(context, "destination");
        let mut service = take_object(&mut destination, "service");
        service.insert("resource".into(), Value::String(resource.clone()));
        destination.insert("service".into(), Value::Object(service));
        context.insert("destination".into(), Value::Object(destination));
    }
    resource
}

fn take_object(map: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    match map.remove(key) {
        Some(Value::Object(object)) => object,
        _ => Map::new(),
    }
}
