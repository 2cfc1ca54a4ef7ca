//! # Tracer
//!
//! The [`Tracer`] begins and ends transactions, opens spans beneath the
//! current transaction and span, and queues finished records.
//!
//! Settings are read from its [`ConfigHandle`] each time a transaction
//! begins, so a changed sample rate or span budget applies to the next
//! transaction. A transaction keeps the settings it began with.
use crate::config::{round_sample_rate, Config, ConfigHandle, TraceContinuationStrategy};
use crate::context::{self, Context, FutureContextExt};
use crate::error::AgentResult;
use crate::export::{Event, EventQueue, Link, NoopEventQueue};
use crate::trace::sampler::Sampler;
use crate::trace::scope::{InSpan, SpanGuard};
use crate::trace::trace_parent::SAMPLE_RATE_KEY;
use crate::trace::transaction::{TransactionLimits, TransactionStart};
use crate::trace::{
    ActiveSpan, BacktraceCollector, DropReason, DroppedSpan, Frame, FramesCollector, IdGenerator,
    RandomIdGenerator, SpanBuilder, SpanId, TraceId, TraceParent, Transaction,
};
use crate::apm_debug;
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

/// Entry point for instrumentation.
///
/// `Tracer` is a cheap handle; clones share configuration, queue and
/// sampling state.
#[derive(Clone, Debug)]
pub struct Tracer(Arc<TracerInner>);

#[derive(Debug)]
struct TracerInner {
    config: ConfigHandle,
    queue: Arc<dyn EventQueue>,
    id_generator: Box<dyn IdGenerator>,
    sampler: Sampler,
    frames: Box<dyn FramesCollector>,
}

impl Tracer {
    /// Create a new [`TracerBuilder`].
    pub fn builder() -> TracerBuilder {
        TracerBuilder::default()
    }

    /// The configuration that the next transaction will use.
    pub fn config(&self) -> Arc<Config> {
        self.0.config.current()
    }

    /// Handle for updating the configuration at runtime.
    pub fn config_handle(&self) -> &ConfigHandle {
        &self.0.config
    }

    /// Starts describing a transaction with more options than
    /// [`begin_transaction`](Self::begin_transaction) takes.
    pub fn transaction_builder(&self, transaction_type: impl Into<String>) -> TransactionBuilder<'_> {
        TransactionBuilder {
            tracer: self,
            transaction_type: transaction_type.into(),
            trace_parent: None,
            links: Vec::new(),
            start: None,
            auto_activate: true,
        }
    }

    /// Begins a transaction and makes it current.
    ///
    /// With an inbound `trace_parent` the transaction continues that trace
    /// or starts a new one linked to it, depending on the configured
    /// [`TraceContinuationStrategy`].
    pub fn begin_transaction(
        &self,
        transaction_type: impl Into<String>,
        trace_parent: Option<TraceParent>,
    ) -> Transaction {
        let builder = self.transaction_builder(transaction_type);
        match trace_parent {
            Some(trace_parent) => builder.with_trace_parent(trace_parent).start(),
            None => builder.start(),
        }
    }

    /// Ends the current transaction and clears the current transaction and
    /// span.
    ///
    /// Returns the ended transaction, or `None` when no transaction is
    /// current, for example on a second call.
    pub fn end_transaction(&self, result: Option<&str>, name: Option<&str>) -> Option<Transaction> {
        let Some(transaction) = context::get_transaction() else {
            apm_debug!(name: "Tracer.NoCurrentTransaction");
            return None;
        };
        context::set_transaction(None);
        transaction.end(result, name);
        Some(transaction)
    }

    /// Opens a span beneath the current span, or beneath the current
    /// transaction when no span is current, without making it current.
    ///
    /// Without a current transaction the span is a [`DroppedSpan`].
    pub fn begin_span(&self, builder: SpanBuilder) -> ActiveSpan {
        let (transaction, parent) =
            Context::map_current(|cx| (cx.transaction().cloned(), cx.span().cloned()));
        match transaction {
            Some(transaction) => transaction.begin_span(builder, parent.as_ref()),
            None => ActiveSpan::Dropped(DroppedSpan::new(DropReason::NotRecording, None, &builder)),
        }
    }

    /// Opens a span and makes it current until the returned guard drops.
    ///
    /// Dropping the guard ends the span, with outcome failure when the
    /// thread is panicking and success otherwise, unless an outcome was set.
    /// The guard must not be held across an `.await`; use
    /// [`in_span_async`](Self::in_span_async) there.
    pub fn capture_span(&self, builder: SpanBuilder) -> SpanGuard {
        let span = self.begin_span(builder);
        let cx_guard = Context::current().with_span(span.clone()).attach();
        SpanGuard::new(span, cx_guard)
    }

    /// Runs `f` inside a new current span.
    pub fn in_span<T>(&self, builder: SpanBuilder, f: impl FnOnce(&ActiveSpan) -> T) -> T {
        let guard = self.capture_span(builder);
        f(guard.span())
    }

    /// Runs a future inside a new span that is current whenever the future
    /// is polled.
    ///
    /// The span ends with outcome success when the future completes, and
    /// with outcome failure when it is dropped before completing.
    pub fn in_span_async<F: Future>(&self, builder: SpanBuilder, future: F) -> InSpan<F> {
        let span = self.begin_span(builder);
        let cx = Context::current().with_span(span.clone());
        InSpan::new(future.with_context(cx), span)
    }

    /// Flushes the event queue.
    pub fn force_flush(&self) -> AgentResult<()> {
        self.0.queue.force_flush()
    }

    /// Shuts the event queue down.
    pub fn shutdown(&self) -> AgentResult<()> {
        self.0.queue.shutdown()
    }

    pub(crate) fn queue(&self, event: Event, flush: bool) {
        self.0.queue.queue(event, flush);
    }

    pub(crate) fn new_span_id(&self) -> SpanId {
        self.0.id_generator.new_span_id()
    }

    pub(crate) fn new_trace_id(&self) -> TraceId {
        self.0.id_generator.new_trace_id()
    }

    pub(crate) fn collect_frames(&self, limit: usize) -> Vec<Frame> {
        self.0.frames.collect(limit)
    }
}

/// Builder for [`Tracer`].
#[derive(Debug, Default)]
pub struct TracerBuilder {
    config: Option<ConfigHandle>,
    queue: Option<Arc<dyn EventQueue>>,
    id_generator: Option<Box<dyn IdGenerator>>,
    sampling_seed: Option<u64>,
    frames: Option<Box<dyn FramesCollector>>,
}

impl TracerBuilder {
    /// Use a fixed configuration. Without one, the configuration is read
    /// from the environment.
    pub fn with_config(self, config: Config) -> Self {
        self.with_config_handle(ConfigHandle::new(config))
    }

    /// Use a shared configuration that may change at runtime.
    pub fn with_config_handle(mut self, config: ConfigHandle) -> Self {
        self.config = Some(config);
        self
    }

    /// Where finished events go. Events are discarded without a queue.
    pub fn with_queue<T: EventQueue + 'static>(mut self, queue: T) -> Self {
        self.queue = Some(Arc::new(queue));
        self
    }

    /// Specify the id generator to be used.
    pub fn with_id_generator<T: IdGenerator + 'static>(mut self, id_generator: T) -> Self {
        self.id_generator = Some(Box::new(id_generator));
        self
    }

    /// Seed the sampling decisions, making them reproducible.
    pub fn with_sampling_seed(mut self, seed: u64) -> Self {
        self.sampling_seed = Some(seed);
        self
    }

    /// Specify how span and error stack traces are collected.
    pub fn with_frames_collector<T: FramesCollector + 'static>(mut self, frames: T) -> Self {
        self.frames = Some(Box::new(frames));
        self
    }

    /// Create the tracer.
    pub fn build(self) -> Tracer {
        Tracer(Arc::new(TracerInner {
            config: self
                .config
                .unwrap_or_else(|| ConfigHandle::new(Config::from_env())),
            queue: self.queue.unwrap_or_else(|| Arc::new(NoopEventQueue::new())),
            id_generator: self
                .id_generator
                .unwrap_or_else(|| Box::new(RandomIdGenerator::default())),
            sampler: Sampler::new(self.sampling_seed),
            frames: self
                .frames
                .unwrap_or_else(|| Box::new(BacktraceCollector::default())),
        }))
    }
}

/// Describes a transaction to begin.
#[derive(Debug)]
pub struct TransactionBuilder<'a> {
    tracer: &'a Tracer,
    transaction_type: String,
    trace_parent: Option<TraceParent>,
    links: Vec<Link>,
    start: Option<SystemTime>,
    auto_activate: bool,
}

impl TransactionBuilder<'_> {
    /// Continue, or link to, an inbound trace.
    pub fn with_trace_parent(mut self, trace_parent: TraceParent) -> Self {
        self.trace_parent = Some(trace_parent);
        self
    }

    /// Links the transaction to spans of other traces.
    pub fn with_links(mut self, links: Vec<Link>) -> Self {
        self.links = links;
        self
    }

    /// Backdates the start of the transaction.
    pub fn with_start(mut self, start: SystemTime) -> Self {
        self.start = Some(start);
        self
    }

    /// Whether the transaction becomes current. Defaults to `true`.
    pub fn auto_activate(mut self, auto_activate: bool) -> Self {
        self.auto_activate = auto_activate;
        self
    }

    /// Begins the transaction.
    pub fn start(self) -> Transaction {
        let tracer = self.tracer;
        let config = tracer.config();
        let id = tracer.new_span_id();
        let mut links = self.links;

        let restart = match (&self.trace_parent, config.trace_continuation_strategy) {
            (None, _) | (Some(_), TraceContinuationStrategy::Continue) => false,
            (Some(_), TraceContinuationStrategy::Restart) => true,
            // Only a parent without our vendor state comes from outside.
            (Some(parent), TraceContinuationStrategy::RestartExternal) => {
                parent.vendor_entries().is_empty()
            }
        };

        let (trace_parent, sample_rate) = match self.trace_parent {
            Some(parent) if !restart => {
                let sample_rate = parent.sample_rate();
                (parent, sample_rate)
            }
            inbound => {
                if let Some(parent) = &inbound {
                    apm_debug!(
                        name: "Tracer.TraceRestarted",
                        inbound_trace_id = parent.trace_id().to_string()
                    );
                    links.push(Link::from(parent));
                }
                let rate = round_sample_rate(config.transaction_sample_rate);
                let sampled = tracer.0.sampler.should_sample(rate);
                let rate = if sampled { rate } else { 0.0 };
                let mut trace_parent = TraceParent::new(tracer.new_trace_id(), id, sampled);
                trace_parent.add_tracestate(SAMPLE_RATE_KEY, rate);
                (trace_parent, Some(rate))
            }
        };

        let transaction = Transaction::new(
            tracer.clone(),
            TransactionStart {
                id,
                transaction_type: self.transaction_type,
                trace_parent,
                sample_rate,
                links,
                timestamp: self.start,
                limits: TransactionLimits::from(&*config),
            },
        );
        if self.auto_activate {
            context::set_transaction(Some(transaction.clone()));
            context::set_span(None);
        }
        transaction
    }
}
