//! Helpers acting on the current transaction.
//!
//! Every function looks up the transaction current on this thread or task
//! and does nothing when there is none. They never fail.
//!
//! ```
//! use apm_agent::api;
//! use apm_agent::export::InMemoryEventQueue;
//! use apm_agent::trace::Tracer;
//! use apm_agent::Config;
//!
//! let queue = InMemoryEventQueue::default();
//! let tracer = Tracer::builder()
//!     .with_config(Config::default())
//!     .with_queue(queue.clone())
//!     .build();
//!
//! tracer.begin_transaction("request", None);
//! api::set_transaction_name("GET /users/:id");
//! api::set_transaction_result("HTTP 2xx");
//! api::label("tenant", "acme");
//! tracer.end_transaction(None, None);
//!
//! let record = &queue.transactions()[0];
//! assert_eq!(record.name, "GET /users/:id");
//! assert_eq!(record.result.as_deref(), Some("HTTP 2xx"));
//! ```
use crate::context::{get_span, get_transaction};
use crate::trace::{Injector, Outcome, SpanId, TraceId, TraceParent};
use serde_json::{Map, Value};

/// Renames the current transaction.
pub fn set_transaction_name(name: impl Into<String>) {
    if let Some(transaction) = get_transaction() {
        transaction.set_name(name);
    }
}

/// Sets the result of the current transaction, such as `HTTP 2xx`.
pub fn set_transaction_result(result: impl Into<String>) {
    if let Some(transaction) = get_transaction() {
        transaction.set_result(result);
    }
}

/// Sets the outcome of the current transaction.
pub fn set_transaction_outcome(outcome: Outcome) {
    if let Some(transaction) = get_transaction() {
        transaction.set_outcome(outcome);
    }
}

/// Sets the outcome of the current transaction from the status code of the
/// response it served.
pub fn set_transaction_outcome_from_http_status(status_code: u16) {
    if let Some(transaction) = get_transaction() {
        transaction.set_outcome_from_http_status(status_code);
    }
}

/// Merges `data` into the context stored under `key` of the current
/// transaction. Unsampled transactions keep no context.
pub fn set_context(key: &str, data: Map<String, Value>) {
    set_context_with(key, || data);
}

/// Like [`set_context`], but only builds the data when the current
/// transaction is sampled.
pub fn set_context_with(key: &str, data: impl FnOnce() -> Map<String, Value>) {
    match get_transaction() {
        Some(transaction) if transaction.is_sampled() => transaction.set_context(key, data()),
        _ => {}
    }
}

/// Records who the current transaction ran on behalf of.
pub fn set_user_context(username: Option<&str>, email: Option<&str>, user_id: Option<&str>) {
    set_context_with("user", || {
        let mut user = Map::new();
        for (key, value) in [("username", username), ("email", email), ("id", user_id)] {
            if let Some(value) = value {
                user.insert(key.to_string(), Value::String(value.to_string()));
            }
        }
        user
    });
}

/// Labels the current transaction. `.`, `*` and `"` in the key become `_`;
/// objects and arrays are stored as their JSON text.
pub fn label(key: &str, value: impl Into<Value>) {
    if let Some(transaction) = get_transaction() {
        transaction.label(key, value);
    }
}

/// Id of the current transaction.
pub fn get_transaction_id() -> Option<SpanId> {
    get_transaction().map(|transaction| transaction.id())
}

/// Trace id of the current transaction.
pub fn get_trace_id() -> Option<TraceId> {
    get_transaction().map(|transaction| transaction.trace_id())
}

/// Id of the current span, if it is recorded.
pub fn get_span_id() -> Option<SpanId> {
    get_span().and_then(|span| span.id())
}

fn outbound_trace_parent() -> Option<TraceParent> {
    match get_span() {
        Some(span) => span.outbound_trace_parent(),
        None => get_transaction().map(|transaction| transaction.outbound_trace_parent()),
    }
}

/// `traceparent` header value for an outgoing request from the current
/// span, or from the current transaction when no span is current.
pub fn get_trace_parent_header() -> Option<String> {
    outbound_trace_parent().map(|trace_parent| trace_parent.to_string())
}

/// Writes the propagation headers for an outgoing request from the current
/// span or transaction. The legacy `elastic-apm-traceparent` header is added
/// when the transaction began with `use_legacy_traceparent_header` set.
///
/// Returns `false`, writing nothing, when there is no current transaction.
pub fn inject_trace_parent_headers(injector: &mut dyn Injector) -> bool {
    let Some(transaction) = get_transaction() else {
        return false;
    };
    let Some(trace_parent) = outbound_trace_parent() else {
        return false;
    };
    trace_parent.inject(injector, transaction.limits().use_legacy_traceparent_header);
    true
}
