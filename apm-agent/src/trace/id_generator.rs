//! Id Generator
use crate::trace::{SpanId, TraceId};
use rand::{rngs, Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of trace, transaction, span and error identifiers.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new `TraceId`. Also used for 128-bit error ids.
    fn new_trace_id(&self) -> TraceId;

    /// Generate a new `SpanId`. Transactions and spans share the id space.
    fn new_span_id(&self) -> SpanId;
}

/// Default [`IdGenerator`] implementation.
///
/// Draws ids from a per-thread pseudo-random generator, so id generation
/// never contends across threads.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        CURRENT_RNG.with(|rng| TraceId::from(non_zero(|| rng.borrow_mut().random::<u128>())))
    }

    fn new_span_id(&self) -> SpanId {
        CURRENT_RNG.with(|rng| SpanId::from(non_zero(|| rng.borrow_mut().random::<u64>())))
    }
}

fn non_zero<T: Default + PartialEq>(mut draw: impl FnMut() -> T) -> T {
    loop {
        let value = draw();
        if value != T::default() {
            return value;
        }
    }
}

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_os_rng());
}

/// [`IdGenerator`] that increments a shared counter for each new id, which
/// gives tests predictable ids.
#[derive(Clone, Debug)]
pub struct IncrementIdGenerator(Arc<AtomicU64>);

impl IncrementIdGenerator {
    /// Create a new [`IncrementIdGenerator`] starting at 1.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for IncrementIdGenerator {
    fn default() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }
}

impl IdGenerator for IncrementIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        TraceId::from(self.0.fetch_add(1, Ordering::SeqCst) as u128)
    }

    fn new_span_id(&self) -> SpanId {
        SpanId::from(self.0.fetch_add(1, Ordering::SeqCst))
    }
}
