use crate::config::Config;
use crate::export::{
    micros_since_epoch, millis, DroppedSpanDuration, DroppedSpanStatRecord, DurationSum, Event,
    Link, SpanCount, TransactionRecord,
};
use crate::trace::span::merge_context;
use crate::trace::{
    lock, ActiveSpan, CompressionBuffer, CompressionSettings, DropReason, DroppedSpan,
    FinishedSpan, Outcome, Span, SpanBuilder, SpanId, TraceId, TraceParent, Tracer,
};
use crate::{apm_debug, apm_warn};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

const MAX_LABEL_VALUE_LEN: usize = 1024;
const MAX_DROPPED_SPAN_STATS: usize = 128;

/// Settings resolved once, when the transaction begins.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct TransactionLimits {
    /// `0` means unlimited.
    pub(crate) max_spans: usize,
    pub(crate) compression: CompressionSettings,
    pub(crate) span_stack_trace_min_duration: Option<Duration>,
    pub(crate) exit_span_min_duration: Duration,
    pub(crate) stack_trace_limit: usize,
    pub(crate) use_legacy_traceparent_header: bool,
}

impl From<&Config> for TransactionLimits {
    fn from(config: &Config) -> Self {
        TransactionLimits {
            max_spans: config.transaction_max_spans,
            compression: CompressionSettings {
                enabled: config.span_compression_enabled,
                exact_match_max_duration: config.span_compression_exact_match_max_duration,
                same_kind_max_duration: config.span_compression_same_kind_max_duration,
            },
            span_stack_trace_min_duration: config.span_stack_trace_min_duration,
            exit_span_min_duration: config.exit_span_min_duration,
            stack_trace_limit: config.stack_trace_limit,
            use_legacy_traceparent_header: config.use_legacy_traceparent_header,
        }
    }
}

/// Everything a transaction needs to begin.
pub(crate) struct TransactionStart {
    pub(crate) id: SpanId,
    pub(crate) transaction_type: String,
    pub(crate) trace_parent: TraceParent,
    pub(crate) sample_rate: Option<f64>,
    pub(crate) links: Vec<Link>,
    pub(crate) timestamp: Option<SystemTime>,
    pub(crate) limits: TransactionLimits,
}

/// One top-level unit of work, the root of a span tree.
///
/// `Transaction` is a cheap handle; clones refer to the same transaction.
/// Once ended, mutators are no-ops.
#[derive(Clone)]
pub struct Transaction(Arc<TransactionInner>);

struct TransactionInner {
    id: SpanId,
    transaction_type: String,
    trace_parent: Mutex<TraceParent>,
    sampled: bool,
    sample_rate: Option<f64>,
    start: Instant,
    timestamp: SystemTime,
    limits: TransactionLimits,
    tracer: Tracer,
    /// Spans admitted against the budget.
    created: AtomicUsize,
    /// Spans queued, a composite counting once.
    started: AtomicUsize,
    dropped: AtomicUsize,
    ended: AtomicBool,
    data: Mutex<TransactionData>,
    buffer: CompressionBuffer,
}

#[derive(Debug, Default)]
struct TransactionData {
    name: String,
    result: Option<String>,
    outcome: Option<Outcome>,
    context: Map<String, Value>,
    labels: Map<String, Value>,
    links: Vec<Link>,
    dropped_stats: Vec<DroppedSpanStat>,
}

#[derive(Debug)]
struct DroppedSpanStat {
    resource: String,
    outcome: Outcome,
    count: u64,
    sum: Duration,
}

impl Transaction {
    pub(crate) fn new(tracer: Tracer, start: TransactionStart) -> Self {
        let (timestamp, started_at) = match start.timestamp {
            Some(timestamp) => {
                let elapsed = SystemTime::now()
                    .duration_since(timestamp)
                    .unwrap_or_default();
                let now = Instant::now();
                (timestamp, now.checked_sub(elapsed).unwrap_or(now))
            }
            None => (SystemTime::now(), Instant::now()),
        };
        Transaction(Arc::new(TransactionInner {
            id: start.id,
            transaction_type: start.transaction_type,
            sampled: start.trace_parent.trace_options().is_recorded(),
            trace_parent: Mutex::new(start.trace_parent),
            sample_rate: start.sample_rate,
            start: started_at,
            timestamp,
            limits: start.limits,
            tracer,
            created: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            ended: AtomicBool::new(false),
            data: Mutex::new(TransactionData {
                links: start.links,
                ..Default::default()
            }),
            buffer: CompressionBuffer::default(),
        }))
    }

    /// The transaction id, which is also the root span id of the trace.
    pub fn id(&self) -> SpanId {
        self.0.id
    }

    /// The trace this transaction belongs to.
    pub fn trace_id(&self) -> TraceId {
        lock(&self.0.trace_parent).trace_id()
    }

    /// The trace parent the transaction was started with.
    pub fn trace_parent(&self) -> TraceParent {
        lock(&self.0.trace_parent).clone()
    }

    /// The transaction type, such as `request`.
    pub fn transaction_type(&self) -> &str {
        &self.0.transaction_type
    }

    /// Whether spans and context are recorded.
    pub fn is_sampled(&self) -> bool {
        self.0.sampled
    }

    /// The sample rate, when known.
    pub fn sample_rate(&self) -> Option<f64> {
        self.0.sample_rate
    }

    /// Whether the transaction has ended.
    pub fn is_ended(&self) -> bool {
        self.0.ended.load(Ordering::Acquire)
    }

    /// Current name.
    pub fn name(&self) -> String {
        lock(&self.0.data).name.clone()
    }

    /// Current result.
    pub fn result(&self) -> Option<String> {
        lock(&self.0.data).result.clone()
    }

    /// Outcome set so far, if any.
    pub fn outcome(&self) -> Option<Outcome> {
        lock(&self.0.data).outcome
    }

    /// Started and dropped span counters.
    pub fn span_count(&self) -> SpanCount {
        SpanCount {
            started: self.0.started.load(Ordering::Acquire),
            dropped: self.0.dropped.load(Ordering::Acquire),
        }
    }

    /// The context stored under `key`, if any.
    pub fn context(&self, key: &str) -> Option<Value> {
        lock(&self.0.data).context.get(key).cloned()
    }

    /// The whole context with labels under `tags`, as an error captured in
    /// this transaction reports it.
    pub(crate) fn context_snapshot(&self) -> Map<String, Value> {
        let data = lock(&self.0.data);
        let mut context = data.context.clone();
        if !data.labels.is_empty() {
            context.insert("tags".into(), Value::Object(data.labels.clone()));
        }
        context
    }

    fn with_data(&self, f: impl FnOnce(&mut TransactionData)) {
        if self.is_ended() {
            apm_debug!(
                name: "Transaction.ModifiedAfterEnd",
                transaction_id = self.0.id.to_string()
            );
            return;
        }
        f(&mut lock(&self.0.data));
    }

    /// Renames the transaction.
    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.with_data(|data| data.name = name);
    }

    /// Sets the result, such as `HTTP 2xx`.
    pub fn set_result(&self, result: impl Into<String>) {
        let result = result.into();
        self.with_data(|data| data.result = Some(result));
    }

    /// Sets the outcome.
    pub fn set_outcome(&self, outcome: Outcome) {
        self.with_data(|data| data.outcome = Some(outcome));
    }

    /// Derives the outcome from the status of the response this
    /// transaction served; only 5xx is a failure.
    pub fn set_outcome_from_http_status(&self, status_code: u16) {
        self.set_outcome(Outcome::for_transaction_status(status_code));
    }

    /// Merges `data` into the object stored under `key`, such as `request`,
    /// `response`, `user` or `custom`.
    pub fn set_context(&self, key: &str, data: Map<String, Value>) {
        self.with_data(|transaction| merge_context(&mut transaction.context, key, data));
    }

    /// Sets a label. `.`, `*` and `"` in the key become `_`; objects and
    /// arrays are stored as their JSON text.
    pub fn label(&self, key: &str, value: impl Into<Value>) {
        let value = label_value(value.into());
        self.with_data(|data| {
            data.labels.insert(label_key(key), value);
        });
    }

    /// Links the transaction to a span of another trace.
    pub fn add_link(&self, link: Link) {
        self.with_data(|data| data.links.push(link));
    }

    /// The parent id to hand to a client that will report the trace's real
    /// root, minting one if the transaction is the root itself.
    pub fn ensure_parent_id(&self) -> SpanId {
        let mut trace_parent = lock(&self.0.trace_parent);
        if trace_parent.span_id() == self.0.id {
            let parent_id = self.0.tracer.new_span_id();
            trace_parent.set_span_id(parent_id);
            apm_debug!(
                name: "Transaction.ParentIdCreated",
                transaction_id = self.0.id.to_string(),
                parent_id = parent_id.to_string()
            );
        }
        trace_parent.span_id()
    }

    /// Trace parent to send on an outgoing request made directly by the
    /// transaction.
    pub fn outbound_trace_parent(&self) -> TraceParent {
        lock(&self.0.trace_parent).with_span_id(self.0.id)
    }

    /// Opens a span in this transaction without making it current.
    ///
    /// `parent` is the enclosing span; `None` makes the span a direct child
    /// of the transaction. The span is dropped when the transaction is not
    /// sampled or has ended, when `parent` is dropped or a leaf, or when the
    /// span budget is used up.
    pub fn begin_span(&self, builder: SpanBuilder, parent: Option<&ActiveSpan>) -> ActiveSpan {
        if !self.is_sampled() || self.is_ended() {
            return self.dropped_span(DropReason::NotRecording, &builder);
        }
        let parent = match parent {
            Some(ActiveSpan::Dropped(dropped)) => {
                return match dropped.reason() {
                    DropReason::MaxSpansExceeded => self.refuse_span(&builder),
                    reason => self.dropped_span(reason, &builder),
                };
            }
            Some(ActiveSpan::Recording(span)) if span.is_leaf() => {
                return self.dropped_span(DropReason::LeafParent, &builder);
            }
            Some(ActiveSpan::Recording(span)) if span.transaction() == self => Some(span.clone()),
            _ => None,
        };
        if !self.try_reserve_span() {
            return self.refuse_span(&builder);
        }
        ActiveSpan::Recording(Span::new(self.clone(), parent, builder))
    }

    fn try_reserve_span(&self) -> bool {
        let max_spans = self.0.limits.max_spans;
        self.0
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |created| {
                (max_spans == 0 || created < max_spans).then_some(created + 1)
            })
            .is_ok()
    }

    fn dropped_span(&self, reason: DropReason, builder: &SpanBuilder) -> ActiveSpan {
        ActiveSpan::Dropped(DroppedSpan::new(reason, Some(self.clone()), builder))
    }

    fn refuse_span(&self, builder: &SpanBuilder) -> ActiveSpan {
        if self.0.dropped.fetch_add(1, Ordering::AcqRel) == 0 {
            apm_debug!(
                name: "Transaction.MaxSpansExceeded",
                transaction_id = self.0.id.to_string(),
                max_spans = self.0.limits.max_spans
            );
        }
        self.dropped_span(DropReason::MaxSpansExceeded, builder)
    }

    /// Queues a finished span, or discards it if it is a short exit span.
    pub(crate) fn report_span(&self, span: FinishedSpan) {
        if span.is_discardable() && span.duration < self.0.limits.exit_span_min_duration {
            let count = span.count();
            self.0.dropped.fetch_add(count, Ordering::AcqRel);
            if let Some(resource) = &span.resource {
                let sum = span
                    .composite
                    .as_ref()
                    .map_or(span.duration, |composite| composite.sum);
                self.track_dropped_spans(resource, span.record.outcome, count as u64, sum);
            }
            return;
        }
        self.0.started.fetch_add(1, Ordering::AcqRel);
        self.0.tracer.queue(Event::Span(span.into_record()), false);
    }

    pub(crate) fn track_dropped_spans(
        &self,
        resource: &str,
        outcome: Outcome,
        count: u64,
        duration: Duration,
    ) {
        let mut data = lock(&self.0.data);
        if let Some(stat) = data
            .dropped_stats
            .iter_mut()
            .find(|stat| stat.resource == resource && stat.outcome == outcome)
        {
            stat.count += count;
            stat.sum += duration;
        } else if data.dropped_stats.len() < MAX_DROPPED_SPAN_STATS {
            data.dropped_stats.push(DroppedSpanStat {
                resource: resource.to_owned(),
                outcome,
                count,
                sum: duration,
            });
        }
    }

    /// Ends the transaction, flushes its buffered span and queues it.
    ///
    /// `result` and `name` override the current values when given. Returns
    /// `false` if the transaction had already ended.
    pub fn end(&self, result: Option<&str>, name: Option<&str>) -> bool {
        if self.0.ended.swap(true, Ordering::AcqRel) {
            apm_warn!(
                name: "Transaction.AlreadyEnded",
                transaction_id = self.0.id.to_string()
            );
            return false;
        }
        let duration = self.0.start.elapsed();
        {
            let mut data = lock(&self.0.data);
            if let Some(result) = result {
                data.result = Some(result.to_owned());
            }
            if let Some(name) = name {
                data.name = name.to_owned();
            }
        }
        if let Some(span) = self.0.buffer.close() {
            self.report_span(span);
        }
        let record = self.to_record(duration);
        self.0.tracer.queue(Event::Transaction(record), false);
        true
    }

    fn to_record(&self, duration: Duration) -> TransactionRecord {
        let trace_parent = self.trace_parent();
        let span_count = self.span_count();
        let mut data = lock(&self.0.data);
        let context = if self.0.sampled {
            let mut context = std::mem::take(&mut data.context);
            if !data.labels.is_empty() {
                context.insert("tags".into(), Value::Object(std::mem::take(&mut data.labels)));
            }
            (!context.is_empty()).then_some(context)
        } else {
            None
        };
        TransactionRecord {
            id: self.0.id,
            trace_id: trace_parent.trace_id(),
            parent_id: (trace_parent.span_id() != self.0.id).then(|| trace_parent.span_id()),
            name: data.name.clone(),
            transaction_type: self.0.transaction_type.clone(),
            result: data.result.clone(),
            outcome: data.outcome.unwrap_or_default(),
            timestamp: micros_since_epoch(self.0.timestamp),
            duration: millis(duration),
            sampled: self.0.sampled,
            sample_rate: self.0.sample_rate,
            span_count,
            dropped_spans_stats: data
                .dropped_stats
                .iter()
                .map(|stat| DroppedSpanStatRecord {
                    destination_service_resource: stat.resource.clone(),
                    outcome: stat.outcome,
                    duration: DroppedSpanDuration {
                        count: stat.count,
                        sum: DurationSum {
                            us: stat.sum.as_micros() as u64,
                        },
                    },
                })
                .collect(),
            links: data.links.clone(),
            context,
        }
    }

    pub(crate) fn start(&self) -> Instant {
        self.0.start
    }

    pub(crate) fn timestamp(&self) -> SystemTime {
        self.0.timestamp
    }

    pub(crate) fn limits(&self) -> &TransactionLimits {
        &self.0.limits
    }

    pub(crate) fn tracer(&self) -> &Tracer {
        &self.0.tracer
    }

    pub(crate) fn buffer(&self) -> &CompressionBuffer {
        &self.0.buffer
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.0.id)
            .field("type", &self.0.transaction_type)
            .field("sampled", &self.0.sampled)
            .field("ended", &self.is_ended())
            .finish()
    }
}

pub(crate) fn label_key(key: &str) -> String {
    key.replace(['.', '*', '"'], "_")
}

pub(crate) fn label_value(value: Value) -> Value {
    match value {
        Value::String(text) => Value::String(truncate(text)),
        Value::Null | Value::Bool(_) | Value::Number(_) => value,
        other => Value::String(truncate(other.to_string())),
    }
}

fn truncate(text: String) -> String {
    match text.char_indices().nth(MAX_LABEL_VALUE_LEN) {
        Some((end, _)) => text[..end].to_owned(),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::InMemoryEventQueue;
    use crate::trace::IncrementIdGenerator;
    use serde_json::json;

    fn tracer(config: Config) -> (Tracer, InMemoryEventQueue) {
        let queue = InMemoryEventQueue::default();
        let tracer = Tracer::builder()
            .with_config(config)
            .with_queue(queue.clone())
            .with_id_generator(IncrementIdGenerator::new())
            .build();
        (tracer, queue)
    }

    fn detached(tracer: &Tracer) -> Transaction {
        tracer
            .transaction_builder("request")
            .auto_activate(false)
            .start()
    }

    #[test]
    fn labels_are_normalized() {
        assert_eq!(label_key("a.b*c\"d"), "a_b_c_d");
        assert_eq!(label_value(json!([1, 2])), json!("[1,2]"));
        assert_eq!(label_value(json!(true)), json!(true));
        let long = "x".repeat(MAX_LABEL_VALUE_LEN + 10);
        assert_eq!(
            label_value(json!(long)).as_str().map(str::len),
            Some(MAX_LABEL_VALUE_LEN)
        );
    }

    #[test]
    fn budget_counts_refusals_once_per_call_site() {
        let (tracer, queue) = tracer(Config {
            transaction_max_spans: 2,
            ..Default::default()
        });
        let transaction = detached(&tracer);
        let spans: Vec<_> = (0..5)
            .map(|i| transaction.begin_span(SpanBuilder::new(format!("s{i}"), "app"), None))
            .collect();
        assert_eq!(spans.iter().filter(|span| span.is_recording()).count(), 2);

        // children of a refused span are refused as well
        let refused = &spans[4];
        let child = transaction.begin_span(SpanBuilder::new("child", "app"), Some(refused));
        assert!(!child.is_recording());

        spans.iter().for_each(ActiveSpan::end);
        assert!(transaction.end(None, None));
        assert_eq!(
            transaction.span_count(),
            SpanCount {
                started: 2,
                dropped: 4
            }
        );
        assert_eq!(queue.spans().len(), 2);
    }

    #[test]
    fn leaf_parent_suppresses_children_silently() {
        let (tracer, _queue) = tracer(Config::default());
        let transaction = detached(&tracer);
        let leaf = transaction.begin_span(SpanBuilder::new("GET", "cache").leaf(true), None);
        let child = transaction.begin_span(SpanBuilder::new("inner", "cache"), Some(&leaf));
        let grandchild = transaction.begin_span(SpanBuilder::new("deeper", "cache"), Some(&child));
        for span in [&child, &grandchild] {
            match span {
                ActiveSpan::Dropped(dropped) => assert_eq!(dropped.reason(), DropReason::LeafParent),
                ActiveSpan::Recording(_) => panic!("span beneath a leaf was recorded"),
            }
        }
        assert_eq!(transaction.span_count().dropped, 0);
    }

    #[test]
    fn ensure_parent_id_mints_once() {
        let (tracer, queue) = tracer(Config::default());
        let transaction = detached(&tracer);
        assert_eq!(transaction.trace_parent().span_id(), transaction.id());
        let parent_id = transaction.ensure_parent_id();
        assert_ne!(parent_id, transaction.id());
        assert_eq!(transaction.ensure_parent_id(), parent_id);
        transaction.end(None, None);
        assert_eq!(queue.transactions()[0].parent_id, Some(parent_id));
    }

    #[test]
    fn mutations_after_end_are_ignored() {
        let (tracer, queue) = tracer(Config::default());
        let transaction = detached(&tracer);
        transaction.set_name("before");
        transaction.label("key", "value");
        assert!(transaction.end(Some("ok"), None));
        transaction.set_name("after");
        assert!(!transaction.end(None, None));

        let records = queue.transactions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "before");
        assert_eq!(records[0].result.as_deref(), Some("ok"));
        assert_eq!(records[0].outcome, Outcome::Unknown);
        assert_eq!(records[0].context, json!({"tags": {"key": "value"}}).as_object().cloned());
        assert_eq!(transaction.name(), "before");
    }

    #[test]
    fn dropped_span_stats_are_keyed_by_resource_and_outcome() {
        let (tracer, queue) = tracer(Config {
            transaction_max_spans: 1,
            ..Default::default()
        });
        let transaction = detached(&tracer);
        transaction
            .begin_span(SpanBuilder::new("first", "app"), None)
            .end();
        for outcome in [Outcome::Success, Outcome::Success, Outcome::Failure] {
            let span = transaction.begin_span(
                SpanBuilder::new("GET", "db")
                    .with_subtype("redis")
                    .leaf(true)
                    .with_duration(Duration::from_millis(2)),
                None,
            );
            span.set_outcome(outcome);
            span.end();
        }
        transaction.end(None, None);

        let stats = &queue.transactions()[0].dropped_spans_stats;
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].destination_service_resource, "redis");
        assert_eq!(stats[0].outcome, Outcome::Success);
        assert_eq!(stats[0].duration.count, 2);
        assert_eq!(stats[0].duration.sum.us, 4000);
        assert_eq!(stats[1].outcome, Outcome::Failure);
    }
}
