//! Event queues hand finished events over for reporting.
//!
//! The tracer calls [`EventQueue::queue`] from whichever thread ends a
//! transaction or span, so implementations must never block the caller.
//! [`BatchEventQueue`] buffers events on a dedicated thread and hands
//! batches to an [`EventExporter`].
use crate::error::{AgentError, AgentResult};
use crate::export::{Event, ProcessorChain};
use crate::{apm_debug, apm_error, apm_warn};
use futures_executor::block_on;
use futures_util::future::BoxFuture;
use std::cmp::min;
use std::env;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Max number of events buffered before new ones are dropped.
pub(crate) const APM_AGENT_QUEUE_MAX_SIZE: &str = "APM_AGENT_QUEUE_MAX_SIZE";
/// Default max queue size.
pub(crate) const APM_AGENT_QUEUE_MAX_SIZE_DEFAULT: usize = 2_048;
/// Max delay between two exports, in milliseconds.
pub(crate) const APM_AGENT_QUEUE_FLUSH_INTERVAL: &str = "APM_AGENT_QUEUE_FLUSH_INTERVAL";
/// Default flush interval.
pub(crate) const APM_AGENT_QUEUE_FLUSH_INTERVAL_DEFAULT: Duration = Duration::from_millis(1_000);
/// Max number of events in one export batch.
pub(crate) const APM_AGENT_QUEUE_MAX_BATCH_SIZE: &str = "APM_AGENT_QUEUE_MAX_BATCH_SIZE";
/// Default max batch size.
pub(crate) const APM_AGENT_QUEUE_MAX_BATCH_SIZE_DEFAULT: usize = 512;
/// How long flush and shutdown wait for the export thread, in milliseconds.
pub(crate) const APM_AGENT_QUEUE_EXPORT_TIMEOUT: &str = "APM_AGENT_QUEUE_EXPORT_TIMEOUT";
/// Default export timeout.
pub(crate) const APM_AGENT_QUEUE_EXPORT_TIMEOUT_DEFAULT: Duration = Duration::from_millis(10_000);

/// Receives finished events from the tracer.
pub trait EventQueue: Send + Sync + Debug {
    /// Hands over one event.
    ///
    /// `flush` asks the queue to send everything it holds soon, for example
    /// after an unhandled error. This must not block.
    fn queue(&self, event: Event, flush: bool);

    /// Sends every buffered event before returning.
    fn force_flush(&self) -> AgentResult<()> {
        Ok(())
    }

    /// Flushes and releases the queue. Later events are discarded.
    fn shutdown(&self) -> AgentResult<()> {
        Ok(())
    }
}

/// Sends batches of events to a backend.
pub trait EventExporter: Send + Debug {
    /// Exports one batch.
    ///
    /// Called from the export thread of a [`BatchEventQueue`], never
    /// concurrently.
    fn export(&mut self, batch: Vec<Event>) -> BoxFuture<'static, AgentResult<()>>;

    /// Releases the exporter.
    fn shutdown(&mut self) {}
}

/// A queue that discards every event.
#[derive(Debug, Default)]
pub struct NoopEventQueue {
    _private: (),
}

impl NoopEventQueue {
    /// Create a new no-op queue.
    pub fn new() -> Self {
        NoopEventQueue { _private: () }
    }
}

impl EventQueue for NoopEventQueue {
    fn queue(&self, _event: Event, _flush: bool) {}
}

#[derive(Debug)]
enum BatchMessage {
    Event(Event, bool),
    ForceFlush(SyncSender<AgentResult<()>>),
    Shutdown(SyncSender<AgentResult<()>>),
}

/// Buffers events and exports them in batches from a background thread.
///
/// A batch is exported once it reaches the max batch size, once the flush
/// interval has passed since the last export, or as soon as an event
/// arrives with the flush hint set. Configured processors run on the export
/// thread before an event is buffered. When the buffer is full new events
/// are dropped and counted.
///
/// ```
/// use apm_agent::export::{BatchEventQueue, InMemoryEventExporter};
/// use apm_agent::trace::Tracer;
/// use apm_agent::Config;
///
/// let exporter = InMemoryEventExporter::default();
/// let queue = BatchEventQueue::builder(exporter.clone()).build();
/// let tracer = Tracer::builder()
///     .with_config(Config::default())
///     .with_queue(queue)
///     .build();
///
/// let transaction = tracer.begin_transaction("request", None);
/// tracer.end_transaction(Some("HTTP 2xx"), Some("GET /"));
/// tracer.force_flush().unwrap();
///
/// assert_eq!(exporter.get_exported_events().unwrap().len(), 1);
/// # drop(transaction);
/// ```
#[derive(Debug)]
pub struct BatchEventQueue {
    message_sender: SyncSender<BatchMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
    export_timeout: Duration,
    is_shutdown: AtomicBool,
    dropped_event_count: AtomicUsize,
}

impl BatchEventQueue {
    /// A builder exporting through `exporter`.
    pub fn builder<E: EventExporter + 'static>(exporter: E) -> BatchEventQueueBuilder<E> {
        BatchEventQueueBuilder {
            exporter,
            config: BatchConfig::default(),
            processors: ProcessorChain::default(),
        }
    }

    /// Starts the export thread.
    pub fn new<E: EventExporter + 'static>(
        mut exporter: E,
        config: BatchConfig,
        processors: ProcessorChain,
    ) -> Self {
        let (message_sender, message_receiver) = mpsc::sync_channel(config.max_queue_size);
        let export_timeout = config.max_export_timeout;

        let spawned = thread::Builder::new()
            .name("BatchEventQueueThread".to_string())
            .spawn(move || {
                let mut events = Vec::with_capacity(config.max_export_batch_size);
                let mut last_export_time = Instant::now();

                loop {
                    let remaining = config
                        .scheduled_delay
                        .saturating_sub(last_export_time.elapsed());
                    match message_receiver.recv_timeout(remaining) {
                        Ok(BatchMessage::Event(event, flush)) => {
                            if let Some(event) = processors.process(event) {
                                events.push(event);
                            }
                            if flush
                                || events.len() >= config.max_export_batch_size
                                || last_export_time.elapsed() >= config.scheduled_delay
                            {
                                let _ = export_batch(&mut exporter, &mut events);
                                last_export_time = Instant::now();
                            }
                        }
                        Ok(BatchMessage::ForceFlush(sender)) => {
                            apm_debug!(name: "BatchEventQueue.ExportingDueToForceFlush");
                            let result = export_batch(&mut exporter, &mut events);
                            last_export_time = Instant::now();
                            let _ = sender.send(result);
                        }
                        Ok(BatchMessage::Shutdown(sender)) => {
                            apm_debug!(name: "BatchEventQueue.ExportingDueToShutdown");
                            let result = export_batch(&mut exporter, &mut events);
                            exporter.shutdown();
                            let _ = sender.send(result);
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if !events.is_empty() {
                                apm_debug!(
                                    name: "BatchEventQueue.ExportingDueToTimer",
                                    events = events.len()
                                );
                                let _ = export_batch(&mut exporter, &mut events);
                            }
                            last_export_time = Instant::now();
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            apm_debug!(name: "BatchEventQueue.ChannelDisconnected");
                            let _ = export_batch(&mut exporter, &mut events);
                            exporter.shutdown();
                            break;
                        }
                    }
                }
                apm_debug!(name: "BatchEventQueue.ThreadExiting");
            });

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                apm_error!(
                    name: "BatchEventQueue.ThreadSpawnFailed",
                    error = err.to_string()
                );
                None
            }
        };

        BatchEventQueue {
            message_sender,
            handle: Mutex::new(handle),
            export_timeout,
            is_shutdown: AtomicBool::new(false),
            dropped_event_count: AtomicUsize::new(0),
        }
    }

    /// Number of events dropped because the buffer was full.
    pub fn dropped_event_count(&self) -> usize {
        self.dropped_event_count.load(Ordering::Relaxed)
    }

    fn request(
        &self,
        message: impl FnOnce(SyncSender<AgentResult<()>>) -> BatchMessage,
    ) -> AgentResult<()> {
        let (sender, receiver) = mpsc::sync_channel(1);
        self.message_sender
            .send(message(sender))
            .map_err(|err| AgentError::Other(format!("failed to reach export thread: {err}")))?;
        receiver
            .recv_timeout(self.export_timeout)
            .map_err(|err| match err {
                RecvTimeoutError::Timeout => AgentError::ExportTimedOut(self.export_timeout),
                RecvTimeoutError::Disconnected => {
                    AgentError::Other("export thread exited".to_string())
                }
            })?
    }
}

impl EventQueue for BatchEventQueue {
    fn queue(&self, event: Event, flush: bool) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            apm_debug!(
                name: "BatchEventQueue.QueueAfterShutdown",
                event_type = event.event_type()
            );
            return;
        }
        if self
            .message_sender
            .try_send(BatchMessage::Event(event, flush))
            .is_err()
            && self.dropped_event_count.fetch_add(1, Ordering::Relaxed) == 0
        {
            apm_warn!(
                name: "BatchEventQueue.EventDroppingStarted",
                message = "Buffer full or export thread gone. Further drops are counted silently."
            );
        }
    }

    fn force_flush(&self) -> AgentResult<()> {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(AgentError::AlreadyShutdown);
        }
        self.request(BatchMessage::ForceFlush)
    }

    fn shutdown(&self) -> AgentResult<()> {
        if self.is_shutdown.swap(true, Ordering::Relaxed) {
            return Err(AgentError::AlreadyShutdown);
        }
        let dropped = self.dropped_event_count();
        if dropped > 0 {
            apm_warn!(
                name: "BatchEventQueue.EventsDropped",
                dropped_events = dropped
            );
        }
        let result = self.request(BatchMessage::Shutdown);
        if result.is_ok() {
            let handle = self
                .handle
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    apm_error!(name: "BatchEventQueue.ThreadPanicked");
                }
            }
        }
        result
    }
}

fn export_batch<E: EventExporter>(exporter: &mut E, events: &mut Vec<Event>) -> AgentResult<()> {
    if events.is_empty() {
        return Ok(());
    }
    let count = events.len();
    let result = block_on(exporter.export(events.split_off(0)));
    if let Err(err) = &result {
        apm_warn!(
            name: "BatchEventQueue.ExportFailed",
            events = count,
            error = err.to_string()
        );
    }
    result
}

/// Builder for [`BatchEventQueue`].
#[derive(Debug)]
pub struct BatchEventQueueBuilder<E> {
    exporter: E,
    config: BatchConfig,
    processors: ProcessorChain,
}

impl<E: EventExporter + 'static> BatchEventQueueBuilder<E> {
    /// Buffering and batching settings.
    pub fn with_batch_config(self, config: BatchConfig) -> Self {
        BatchEventQueueBuilder { config, ..self }
    }

    /// Processors to run over every event before it is buffered.
    pub fn with_processors(self, processors: ProcessorChain) -> Self {
        BatchEventQueueBuilder { processors, ..self }
    }

    /// Starts the queue.
    pub fn build(self) -> BatchEventQueue {
        BatchEventQueue::new(self.exporter, self.config, self.processors)
    }
}

/// Buffering and batching settings of a [`BatchEventQueue`].
#[derive(Clone, Debug, PartialEq)]
pub struct BatchConfig {
    pub(crate) max_queue_size: usize,
    pub(crate) scheduled_delay: Duration,
    pub(crate) max_export_batch_size: usize,
    pub(crate) max_export_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfigBuilder::default().build()
    }
}

impl BatchConfig {
    /// Max number of buffered events.
    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Max delay between two exports.
    pub fn scheduled_delay(&self) -> Duration {
        self.scheduled_delay
    }

    /// Max number of events in one export batch.
    pub fn max_export_batch_size(&self) -> usize {
        self.max_export_batch_size
    }

    /// How long flush and shutdown wait for the export thread.
    pub fn max_export_timeout(&self) -> Duration {
        self.max_export_timeout
    }
}

/// Builder for [`BatchConfig`]. Defaults come from the `APM_AGENT_QUEUE_*`
/// environment variables when they are set and valid.
#[derive(Debug)]
pub struct BatchConfigBuilder {
    max_queue_size: usize,
    scheduled_delay: Duration,
    max_export_batch_size: usize,
    max_export_timeout: Duration,
}

impl Default for BatchConfigBuilder {
    fn default() -> Self {
        BatchConfigBuilder {
            max_queue_size: APM_AGENT_QUEUE_MAX_SIZE_DEFAULT,
            scheduled_delay: APM_AGENT_QUEUE_FLUSH_INTERVAL_DEFAULT,
            max_export_batch_size: APM_AGENT_QUEUE_MAX_BATCH_SIZE_DEFAULT,
            max_export_timeout: APM_AGENT_QUEUE_EXPORT_TIMEOUT_DEFAULT,
        }
        .init_from_env_vars()
    }
}

impl BatchConfigBuilder {
    /// Max number of buffered events. Default 2048.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Max delay between two exports. Default one second.
    pub fn with_scheduled_delay(mut self, scheduled_delay: Duration) -> Self {
        self.scheduled_delay = scheduled_delay;
        self
    }

    /// Max events per batch, capped at the queue size. Default 512.
    pub fn with_max_export_batch_size(mut self, max_export_batch_size: usize) -> Self {
        self.max_export_batch_size = max_export_batch_size;
        self
    }

    /// How long flush and shutdown wait. Default ten seconds.
    pub fn with_max_export_timeout(mut self, max_export_timeout: Duration) -> Self {
        self.max_export_timeout = max_export_timeout;
        self
    }

    /// Builds the config.
    pub fn build(self) -> BatchConfig {
        let max_queue_size = self.max_queue_size.max(1);
        BatchConfig {
            max_queue_size,
            scheduled_delay: self.scheduled_delay,
            max_export_batch_size: min(self.max_export_batch_size.max(1), max_queue_size),
            max_export_timeout: self.max_export_timeout,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(max_queue_size) = env_usize(APM_AGENT_QUEUE_MAX_SIZE) {
            self.max_queue_size = max_queue_size;
        }
        if let Some(delay) = env_usize(APM_AGENT_QUEUE_FLUSH_INTERVAL) {
            self.scheduled_delay = Duration::from_millis(delay as u64);
        }
        if let Some(max_export_batch_size) = env_usize(APM_AGENT_QUEUE_MAX_BATCH_SIZE) {
            self.max_export_batch_size = max_export_batch_size;
        }
        if let Some(timeout) = env_usize(APM_AGENT_QUEUE_EXPORT_TIMEOUT) {
            self.max_export_timeout = Duration::from_millis(timeout as u64);
        }
        self
    }
}

fn env_usize(key: &str) -> Option<usize> {
    let value = env::var(key).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            apm_warn!(name: "BatchConfig.InvalidEnvValue", key = key, value = value.as_str());
            None
        }
    }
}
