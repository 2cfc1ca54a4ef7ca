use crate::error::{AgentError, AgentResult};
use crate::export::{
    ErrorRecord, Event, EventExporter, EventQueue, ProcessorChain, SpanRecord, TransactionRecord,
};
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex};

/// An [`EventQueue`] that keeps every event in memory, for tests and
/// debugging.
///
/// Clones share the same storage, so a clone handed to the tracer can be
/// inspected through the original.
///
/// ```
/// use apm_agent::export::InMemoryEventQueue;
/// use apm_agent::trace::Tracer;
/// use apm_agent::Config;
///
/// let queue = InMemoryEventQueue::default();
/// let tracer = Tracer::builder()
///     .with_config(Config::default())
///     .with_queue(queue.clone())
///     .build();
///
/// tracer.begin_transaction("request", None);
/// tracer.end_transaction(None, Some("GET /"));
///
/// assert_eq!(queue.transactions()[0].name, "GET /");
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventQueue {
    events: Arc<Mutex<Vec<(Event, bool)>>>,
    processors: Arc<ProcessorChain>,
}

impl InMemoryEventQueue {
    /// A queue that runs `processors` over every event before storing it.
    pub fn with_processors(processors: ProcessorChain) -> Self {
        InMemoryEventQueue {
            events: Arc::default(),
            processors: Arc::new(processors),
        }
    }

    /// All stored events, oldest first.
    pub fn get_events(&self) -> Vec<Event> {
        self.get_events_with_flush()
            .into_iter()
            .map(|(event, _)| event)
            .collect()
    }

    /// All stored events with the flush hint each was queued with.
    pub fn get_events_with_flush(&self) -> Vec<(Event, bool)> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Stored transactions, oldest first.
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.get_events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Transaction(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    /// Stored spans, in the order they were reported.
    pub fn spans(&self) -> Vec<SpanRecord> {
        self.get_events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Span(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    /// Stored errors and messages, oldest first.
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.get_events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Error(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    /// Clears the stored events.
    pub fn reset(&self) {
        let _ = self.events.lock().map(|mut events| events.clear());
    }
}

impl EventQueue for InMemoryEventQueue {
    fn queue(&self, event: Event, flush: bool) {
        if let Some(event) = self.processors.process(event) {
            let _ = self.events.lock().map(|mut events| events.push((event, flush)));
        }
    }
}

/// An [`EventExporter`] that keeps exported batches in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventExporter {
    events: Arc<Mutex<Vec<Event>>>,
}

impl InMemoryEventExporter {
    /// Every exported event, in export order.
    pub fn get_exported_events(&self) -> AgentResult<Vec<Event>> {
        self.events
            .lock()
            .map(|events| events.clone())
            .map_err(AgentError::from)
    }

    /// Clears the exported events.
    pub fn reset(&self) {
        let _ = self.events.lock().map(|mut events| events.clear());
    }
}

impl EventExporter for InMemoryEventExporter {
    fn export(&mut self, mut batch: Vec<Event>) -> BoxFuture<'static, AgentResult<()>> {
        let result = self
            .events
            .lock()
            .map(|mut events| events.append(&mut batch))
            .map_err(|err| AgentError::ExportFailed(format!("failed to lock events: {err}")));
        Box::pin(std::future::ready(result))
    }
}
