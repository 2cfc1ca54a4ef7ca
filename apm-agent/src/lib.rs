//! Transaction and span aggregation core of an application performance
//! monitoring agent.
//!
//! The crate models a traced unit of work as a [`Transaction`] holding a tree
//! of nested [`Span`]s. Instrumentation code talks to a [`Tracer`], which
//! decides sampling, enforces the per-transaction span budget, compresses
//! runs of similar exit spans and hands finished records to an
//! [`EventQueue`].
//!
//! # Getting started
//!
//! ```
//! use apm_agent::export::InMemoryEventQueue;
//! use apm_agent::trace::{SpanBuilder, Tracer};
//!
//! let queue = InMemoryEventQueue::default();
//! let tracer = Tracer::builder().with_queue(queue.clone()).build();
//!
//! tracer.begin_transaction("request", None);
//! {
//!     let _span = tracer.capture_span(SpanBuilder::new("SELECT FROM users", "db"));
//! }
//! tracer.end_transaction(Some("HTTP 2xx"), Some("GET /users"));
//!
//! assert_eq!(queue.transactions().len(), 1);
//! assert_eq!(queue.spans().len(), 1);
//! ```
//!
//! # Execution context
//!
//! The current transaction and span live in a per-thread [`Context`] stack.
//! Async tasks keep their own slot by wrapping the task future with
//! [`FutureContextExt::with_context`]; see the [`context`] module.
//!
//! # Internal logging
//!
//! With the default `internal-logs` feature the agent reports its own faults
//! through the [`tracing`](https://docs.rs/tracing) crate, with the crate name
//! as target. Nothing is ever raised into the instrumented application.
//!
//! [`Transaction`]: trace::Transaction
//! [`Span`]: trace::Span
//! [`Tracer`]: trace::Tracer
//! [`EventQueue`]: export::EventQueue
//! [`FutureContextExt::with_context`]: context::FutureContextExt::with_context
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(
    docsrs,
    feature(doc_cfg, doc_auto_cfg),
    deny(rustdoc::broken_intra_doc_links)
)]

mod internal_logging;

pub mod api;
mod capture;
pub mod config;
pub mod context;
mod error;
pub mod export;
pub mod trace;

pub use capture::LogLevel;
pub use config::{Config, ConfigHandle, TraceContinuationStrategy};
pub use context::{Context, ContextGuard};
pub use error::{AgentError, AgentResult};

#[doc(hidden)]
pub mod _private {
    #[cfg(feature = "internal-logs")]
    pub use tracing::{debug, error, info, warn};
}
