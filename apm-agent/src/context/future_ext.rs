use crate::Context;
use futures_core::Stream;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::Context as TaskContext;
use std::task::Poll;

impl<T: std::future::Future> std::future::Future for WithContext<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.apm_cx.clone().attach();

        let poll = this.inner.poll(task_cx);
        // Keep whatever the task made current during this poll.
        *this.apm_cx = Context::current();
        poll
    }
}

impl<T: Stream> Stream for WithContext<T> {
    type Item = T::Item;

    fn poll_next(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let _guard = this.apm_cx.clone().attach();

        let poll = T::poll_next(this.inner, task_cx);
        *this.apm_cx = Context::current();
        poll
    }
}

pin_project! {
    /// A future or stream that carries its own [`Context`].
    #[derive(Clone, Debug)]
    pub struct WithContext<T> {
        #[pin]
        inner: T,
        apm_cx: Context,
    }
}

impl<T> WithContext<T> {
    /// The context the wrapped value will see on its next poll.
    pub fn context(&self) -> &Context {
        &self.apm_cx
    }
}

// The two extension traits are almost identical but must stay separate to
// avoid overlapping implementations.

impl<F: std::future::Future> FutureContextExt for F {}
/// Extension trait giving a future its own execution context.
pub trait FutureContextExt: Sized {
    /// Attaches the provided [`Context`] to this future, returning a
    /// `WithContext` wrapper.
    ///
    /// The context is current while the future is polled, and changes made
    /// to the current transaction or span during a poll are kept for the
    /// next one.
    fn with_context(self, apm_cx: Context) -> WithContext<Self> {
        WithContext {
            inner: self,
            apm_cx,
        }
    }

    /// Attaches a snapshot of the current [`Context`] to this future.
    fn with_current_context(self) -> WithContext<Self> {
        let apm_cx = Context::current();
        self.with_context(apm_cx)
    }
}

impl<S: Stream> StreamContextExt for S {}
/// Extension trait giving a stream its own execution context.
pub trait StreamContextExt: Sized {
    /// Attaches the provided [`Context`] to this stream, returning a
    /// `WithContext` wrapper.
    fn with_context(self, apm_cx: Context) -> WithContext<Self> {
        WithContext {
            inner: self,
            apm_cx,
        }
    }

    /// Attaches a snapshot of the current [`Context`] to this stream.
    fn with_current_context(self) -> WithContext<Self> {
        let apm_cx = Context::current();
        self.with_context(apm_cx)
    }
}
