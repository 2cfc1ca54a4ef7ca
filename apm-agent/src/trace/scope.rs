//! Scoped spans that always end, however their scope is left.
use crate::context::{ContextGuard, WithContext};
use crate::trace::{ActiveSpan, Outcome};
use pin_project_lite::pin_project;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

/// A span that is current until the guard drops.
///
/// Dropping the guard ends the span and restores the previous current span.
/// When the guard drops during a panic the outcome defaults to failure.
#[derive(Debug)]
pub struct SpanGuard {
    span: ActiveSpan,
    _cx: ContextGuard,
}

impl SpanGuard {
    pub(crate) fn new(span: ActiveSpan, cx: ContextGuard) -> Self {
        SpanGuard { span, _cx: cx }
    }

    /// The guarded span.
    pub fn span(&self) -> &ActiveSpan {
        &self.span
    }
}

impl Deref for SpanGuard {
    type Target = ActiveSpan;

    fn deref(&self) -> &ActiveSpan {
        &self.span
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        let outcome = if std::thread::panicking() {
            Outcome::Failure
        } else {
            Outcome::Success
        };
        self.span.end_with_default(outcome);
    }
}

pin_project! {
    /// A future running inside a span, returned by
    /// [`Tracer::in_span_async`](crate::trace::Tracer::in_span_async).
    ///
    /// The span is current while the future is polled. It ends with outcome
    /// success when the future completes, and with outcome failure when the
    /// future is dropped first, for example when its task is cancelled.
    #[derive(Debug)]
    pub struct InSpan<F> {
        #[pin]
        inner: WithContext<F>,
        finisher: SpanFinisher,
    }
}

impl<F> InSpan<F> {
    pub(crate) fn new(inner: WithContext<F>, span: ActiveSpan) -> Self {
        InSpan {
            inner,
            finisher: SpanFinisher { span, done: false },
        }
    }

    /// The span the future runs in.
    pub fn span(&self) -> &ActiveSpan {
        &self.finisher.span
    }
}

impl<F: Future> Future for InSpan<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let poll = this.inner.poll(task_cx);
        if poll.is_ready() {
            this.finisher.finish(Outcome::Success);
        }
        poll
    }
}

#[derive(Debug)]
struct SpanFinisher {
    span: ActiveSpan,
    done: bool,
}

impl SpanFinisher {
    fn finish(&mut self, outcome: Outcome) {
        if !self.done {
            self.done = true;
            self.span.end_with_default(outcome);
        }
    }
}

impl Drop for SpanFinisher {
    fn drop(&mut self) {
        self.finish(Outcome::Failure);
    }
}
