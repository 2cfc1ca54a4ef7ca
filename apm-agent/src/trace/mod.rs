//! # Trace
//!
//! A [`Transaction`] is one top-level unit of work, such as one HTTP request
//! or one background job. While it runs, instrumentation opens nested
//! [`Span`]s for the operations it performs. Every span has exactly one
//! parent: an enclosing span, or the transaction itself.
//!
//! The [`Tracer`] decides per transaction whether it is sampled, refuses
//! spans beyond the transaction's span budget, and compresses runs of
//! similar exit spans into a single composite span before handing records
//! to the [`EventQueue`](crate::export::EventQueue).
//!
//! Spans refused by the budget, or opened beneath a leaf span, are
//! [`DroppedSpan`]s. Callers always hold an [`ActiveSpan`], so code using a
//! dropped span behaves exactly like code using a recorded one.
use std::sync::{Mutex, MutexGuard, PoisonError};

mod compression;
mod id_generator;
mod ids;
mod outcome;
mod sampler;
mod scope;
mod span;
mod stacktrace;
mod trace_parent;
mod tracer;
mod transaction;

pub use compression::CompressionStrategy;
pub use id_generator::{IdGenerator, IncrementIdGenerator, RandomIdGenerator};
pub use ids::{SpanId, TraceFlags, TraceId};
pub use outcome::Outcome;
pub use scope::{InSpan, SpanGuard};
pub use span::{ActiveSpan, DropReason, DroppedSpan, Span, SpanBuilder};
pub use stacktrace::{BacktraceCollector, Frame, FramesCollector, NoopFramesCollector};
pub use trace_parent::{
    Extractor, Injector, TraceParent, TraceParentError, TraceStateError, TRACEPARENT_HEADER,
    TRACEPARENT_LEGACY_HEADER, TRACESTATE_HEADER,
};
pub use tracer::{Tracer, TracerBuilder, TransactionBuilder};
pub use transaction::Transaction;

pub use crate::export::Link;

pub(crate) use compression::{CompressionBuffer, CompressionSettings, FinishedSpan};
pub(crate) use stacktrace::culprit;

/// Locks a mutex, recovering the data if another thread panicked while
/// holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
