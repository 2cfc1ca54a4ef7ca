//! # Event export
//!
//! Finished transactions, spans and errors become [`Event`]s and are handed
//! to an [`EventQueue`]. The queue decides when and how they leave the
//! process:
//!
//! * [`BatchEventQueue`] buffers events on a background thread, runs the
//!   configured [`Processor`]s and passes batches to an [`EventExporter`].
//! * [`InMemoryEventQueue`] and [`InMemoryEventExporter`] keep everything in
//!   memory for tests.
//! * [`NoopEventQueue`] discards everything.
mod event;
mod in_memory;
mod processor;
mod queue;

pub use event::{
    CompositeRecord, DroppedSpanDuration, DroppedSpanStatRecord, DurationSum, ErrorRecord,
    ErrorTransactionRecord, Event, ExceptionRecord, Link, LogRecord, SpanCount, SpanRecord,
    TransactionRecord,
};
pub use in_memory::{InMemoryEventExporter, InMemoryEventQueue};
pub use processor::{FieldMatcher, Processor, ProcessorChain, REDACTED};
pub use queue::{
    BatchConfig, BatchConfigBuilder, BatchEventQueue, BatchEventQueueBuilder, EventExporter,
    EventQueue, NoopEventQueue,
};

pub(crate) use event::{destination_resource, micros_since_epoch, millis};
