//! Captured errors and messages.
use crate::apm_debug;
use crate::context::Context;
use crate::export::{
    micros_since_epoch, ErrorRecord, ErrorTransactionRecord, Event, ExceptionRecord, LogRecord,
};
use crate::trace::{culprit, ActiveSpan, SpanId, TraceId, Tracer, Transaction};
use serde::Serialize;
use std::any::type_name;
use std::error::Error;
use std::fmt;
use std::time::SystemTime;

/// Upper bound on the `source` chain reported for one error.
const MAX_CAUSES: usize = 32;

/// Severity of a captured message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug.
    Debug,
    /// Info.
    #[default]
    Info,
    /// Warning.
    Warning,
    /// Error.
    Error,
    /// Critical.
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        })
    }
}

impl Tracer {
    /// Reports an error, with its `source` chain as causes.
    ///
    /// Inside a transaction the record is tied to the trace, the
    /// transaction and the current span. Unhandled errors ask the queue to
    /// flush. Returns the id of the error record.
    pub fn capture_error<E>(&self, error: &E, handled: bool) -> TraceId
    where
        E: Error + ?Sized + 'static,
    {
        let frames = self.collect_frames(self.config().stack_trace_limit);
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            if causes.len() == MAX_CAUSES {
                break;
            }
            causes.push(ExceptionRecord {
                message: cause.to_string(),
                exception_type: debug_type_name(cause),
                handled,
                stacktrace: Vec::new(),
                cause: Vec::new(),
            });
            source = cause.source();
        }
        let cause = causes.into_iter().rev().fold(Vec::new(), |inner, mut record| {
            record.cause = inner;
            vec![record]
        });
        let culprit = culprit(&frames);
        let exception = ExceptionRecord {
            message: error.to_string(),
            exception_type: short_type_name(type_name::<E>()),
            handled,
            stacktrace: frames,
            cause,
        };
        self.queue_error(
            ErrorRecordParts {
                culprit,
                exception: Some(exception),
                log: None,
            },
            !handled,
        )
    }

    /// Reports a message at the given level. Returns the id of the record.
    pub fn capture_message(&self, message: impl Into<String>, level: LogLevel) -> TraceId {
        let frames = self.collect_frames(self.config().stack_trace_limit);
        self.queue_error(
            ErrorRecordParts {
                culprit: culprit(&frames),
                exception: None,
                log: Some(LogRecord {
                    message: message.into(),
                    level,
                    stacktrace: frames,
                }),
            },
            false,
        )
    }

    fn queue_error(&self, parts: ErrorRecordParts, flush: bool) -> TraceId {
        let id = self.new_trace_id();
        let (transaction, span) =
            Context::map_current(|cx| (cx.transaction().cloned(), cx.span().and_then(ActiveSpan::id)));
        let mut record = ErrorRecord {
            id,
            timestamp: micros_since_epoch(SystemTime::now()),
            trace_id: None,
            transaction_id: None,
            parent_id: None,
            culprit: parts.culprit,
            exception: parts.exception,
            log: parts.log,
            transaction: None,
            context: None,
        };
        if let Some(transaction) = transaction {
            attach_transaction(&mut record, &transaction, span);
        }
        apm_debug!(
            name: "Tracer.ErrorCaptured",
            error_id = id.to_string(),
            flush = flush
        );
        self.queue(Event::Error(record), flush);
        id
    }
}

struct ErrorRecordParts {
    culprit: Option<String>,
    exception: Option<ExceptionRecord>,
    log: Option<LogRecord>,
}

fn attach_transaction(
    record: &mut ErrorRecord,
    transaction: &Transaction,
    span: Option<SpanId>,
) {
    record.trace_id = Some(transaction.trace_id());
    record.transaction_id = Some(transaction.id());
    record.parent_id = Some(span.unwrap_or_else(|| transaction.id()));
    record.transaction = Some(ErrorTransactionRecord {
        sampled: transaction.is_sampled(),
        transaction_type: transaction.transaction_type().to_string(),
        name: transaction.name(),
    });
    if transaction.is_sampled() {
        let context = transaction.context_snapshot();
        record.context = (!context.is_empty()).then_some(context);
    }
}

/// `my_app::errors::DbError<T>` becomes `DbError`.
fn short_type_name(full: &str) -> String {
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
        .to_string()
}

/// Type names of `source` errors are erased; the leading identifier of the
/// `Debug` output usually names the type or variant.
fn debug_type_name(error: &dyn Error) -> String {
    let debug = format!("{error:?}");
    let name: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if name.is_empty() {
        "Error".to_string()
    } else {
        name
    }
}
