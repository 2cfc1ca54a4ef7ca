//! Execution-scoped "current transaction" and "current span".
//!
//! Each thread has a stack of [`Context`] snapshots. The top of the stack is
//! the current context: [`get_transaction`] and [`get_span`] read it and
//! [`set_transaction`] and [`set_span`] replace its pointers in place.
//! Attaching a context with [`Context::attach`] pushes a new top, and
//! dropping the returned [`ContextGuard`] restores what was current before.
//!
//! # Async tasks
//!
//! Several tasks may interleave on one thread, so a task must carry its own
//! context. Wrap the task's future with
//! [`FutureContextExt::with_context`]: the wrapper attaches the task's
//! context for the duration of each poll and stores back any change made
//! during the poll, so a transaction begun inside the task is still current
//! after the next `.await`, and other tasks never see it.
//!
//! ```
//! use apm_agent::context::{get_transaction, FutureContextExt};
//! use apm_agent::trace::Tracer;
//! use apm_agent::Context;
//!
//! # futures_executor::block_on(async {
//! let tracer = Tracer::builder().build();
//! let task = async {
//!     tracer.begin_transaction("job", None);
//!     std::future::ready(()).await;
//!     assert!(get_transaction().is_some());
//!     tracer.end_transaction(None, None);
//! };
//! task.with_context(Context::new()).await;
//! assert!(get_transaction().is_none());
//! # });
//! ```
//!
//! A [`SpanGuard`](crate::trace::SpanGuard) borrows the thread's context
//! stack and must not be held across an `.await`; use
//! [`Tracer::in_span_async`](crate::trace::Tracer::in_span_async) instead.
use crate::apm_warn;
use crate::trace::{ActiveSpan, Transaction};
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;

#[cfg(test)]
mod tests;

mod future_ext;

pub use future_ext::{FutureContextExt, StreamContextExt, WithContext};

thread_local! {
    static CURRENT_CONTEXT: RefCell<ContextStack> = RefCell::new(ContextStack::default());
}

/// A snapshot of the current transaction and span.
///
/// Contexts are cheap to clone; both pointers are shared handles.
#[derive(Clone, Default)]
pub struct Context {
    transaction: Option<Transaction>,
    span: Option<ActiveSpan>,
}

impl Context {
    /// Creates an empty `Context`.
    pub fn new() -> Self {
        Context::default()
    }

    /// Returns a snapshot of the current thread's context.
    pub fn current() -> Self {
        Self::map_current(|cx| cx.clone())
    }

    /// Applies a function to the current context returning its value.
    ///
    /// Note: This function will panic if you attempt to attach another
    /// context while the current one is still borrowed.
    pub fn map_current<T>(f: impl FnOnce(&Context) -> T) -> T {
        CURRENT_CONTEXT.with(|cx| f(&cx.borrow().current_cx))
    }

    /// The transaction of this context. An ended transaction is no longer
    /// current, even in contexts saved before it ended.
    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction
            .as_ref()
            .filter(|transaction| !transaction.is_ended())
    }

    /// The span of this context, unless its transaction has ended.
    pub fn span(&self) -> Option<&ActiveSpan> {
        match &self.transaction {
            Some(transaction) if transaction.is_ended() => None,
            _ => self.span.as_ref(),
        }
    }

    /// A context with the given transaction and no current span.
    pub fn with_transaction(&self, transaction: Transaction) -> Self {
        Context {
            transaction: Some(transaction),
            span: None,
        }
    }

    /// A copy of this context with the given span as current.
    pub fn with_span(&self, span: ActiveSpan) -> Self {
        Context {
            transaction: self.transaction.clone(),
            span: Some(span),
        }
    }

    /// Makes this context current on this thread.
    ///
    /// Dropping the returned [`ContextGuard`] restores the previous context.
    pub fn attach(self) -> ContextGuard {
        let cx_pos = CURRENT_CONTEXT.with(|cx| cx.borrow_mut().push(self));

        ContextGuard {
            cx_pos,
            _marker: PhantomData,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("transaction", &self.transaction.as_ref().map(Transaction::id))
            .field("span", &self.span.as_ref().and_then(ActiveSpan::id))
            .finish()
    }
}

/// The current transaction, if any.
pub fn get_transaction() -> Option<Transaction> {
    Context::map_current(|cx| cx.transaction().cloned())
}

/// The current span, if any. This may be a dropped stand-in.
pub fn get_span() -> Option<ActiveSpan> {
    Context::map_current(|cx| cx.span().cloned())
}

/// Replaces the current transaction. Clearing it also clears the current
/// span.
pub fn set_transaction(transaction: Option<Transaction>) {
    let previous = CURRENT_CONTEXT.with(|cx| {
        let mut stack = cx.borrow_mut();
        let span = if transaction.is_none() {
            stack.current_cx.span.take()
        } else {
            None
        };
        (
            std::mem::replace(&mut stack.current_cx.transaction, transaction),
            span,
        )
    });
    drop(previous);
}

/// Replaces the current span.
pub fn set_span(span: Option<ActiveSpan>) {
    let previous = CURRENT_CONTEXT.with(|cx| {
        std::mem::replace(&mut cx.borrow_mut().current_cx.span, span)
    });
    drop(previous);
}

/// A guard that resets the current context to the prior context when dropped.
#[derive(Debug)]
pub struct ContextGuard {
    // The position of the context in the stack. This is used to pop the context.
    cx_pos: u16,
    // Ensure this type is !Send as it relies on thread locals
    _marker: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let id = self.cx_pos;
        if id > ContextStack::BASE_POS && id < ContextStack::MAX_POS {
            // The popped context may hold the last reference to a span, so it
            // is dropped after the stack borrow is released.
            let popped = CURRENT_CONTEXT.with(|context_stack| context_stack.borrow_mut().pop_id(id));
            drop(popped);
        }
    }
}

/// The contexts attached to a thread.
///
/// Guards may be dropped out of order; an out of order pop only clears its
/// slot, and the current context is restored once the top is popped.
struct ContextStack {
    /// The current context, kept out of `stack` for fast access.
    current_cx: Context,
    /// Contexts that were current before each attach.
    stack: Vec<Option<Context>>,
    /// Ensure this type is !Send as it relies on thread locals
    _marker: PhantomData<*const ()>,
}

impl ContextStack {
    const BASE_POS: u16 = 0;
    const MAX_POS: u16 = u16::MAX;
    const INITIAL_CAPACITY: usize = 8;

    #[inline(always)]
    fn push(&mut self, cx: Context) -> u16 {
        // Position zero is the base context, which is never in `stack`.
        let next_id = self.stack.len() + 1;
        if next_id < ContextStack::MAX_POS.into() {
            let current_cx = std::mem::replace(&mut self.current_cx, cx);
            self.stack.push(Some(current_cx));
            next_id as u16
        } else {
            apm_warn!(
                name: "Context.AttachFailed",
                message = format!("Too many contexts. Max limit is {}. \
                  The current context remains unchanged as this attach failed.",
                  ContextStack::MAX_POS)
            );
            ContextStack::MAX_POS
        }
    }

    /// Pops the context at `pos`, returning whatever was released so the
    /// caller can drop it outside the borrow.
    #[inline(always)]
    fn pop_id(&mut self, pos: u16) -> Vec<Context> {
        let mut released = Vec::new();
        let len: u16 = self.stack.len() as u16;
        if pos == len {
            // Shrink the stack if possible to clear out any out of order pops.
            while let Some(None) = self.stack.last() {
                _ = self.stack.pop();
            }
            if let Some(Some(next_cx)) = self.stack.pop() {
                released.push(std::mem::replace(&mut self.current_cx, next_cx));
            }
        } else if pos > len {
            apm_warn!(
                name: "Context.PopOutOfBounds",
                position = pos,
                stack_length = len,
                message = "Attempted to pop beyond the end of the context stack"
            );
        } else if let Some(cx) = self.stack[pos as usize].take() {
            released.push(cx);
        }
        released
    }
}

impl Default for ContextStack {
    fn default() -> Self {
        ContextStack {
            current_cx: Context::default(),
            stack: Vec::with_capacity(ContextStack::INITIAL_CAPACITY),
            _marker: PhantomData,
        }
    }
}
