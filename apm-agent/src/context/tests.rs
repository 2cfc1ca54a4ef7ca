use super::*;
use crate::export::NoopEventQueue;
use crate::trace::{SpanBuilder, Tracer};
use crate::Config;
use futures_util::{stream, StreamExt};
use std::time::Duration;
use tokio::time::sleep;

fn tracer() -> Tracer {
    Tracer::builder()
        .with_config(Config::default())
        .with_queue(NoopEventQueue::new())
        .build()
}

fn detached(tracer: &Tracer, name: &str) -> Transaction {
    let transaction = tracer
        .transaction_builder("test")
        .auto_activate(false)
        .start();
    transaction.set_name(name);
    transaction
}

fn current_transaction_name() -> Option<String> {
    get_transaction().map(|transaction| transaction.name())
}

#[test]
fn context_immutable() {
    let tracer = tracer();
    let cx = Context::current();
    assert!(cx.transaction().is_none());
    assert!(cx.span().is_none());

    let transaction = detached(&tracer, "a");
    let cx_new = cx.with_transaction(transaction.clone());
    assert!(cx.transaction().is_none());
    assert_eq!(cx_new.transaction(), Some(&transaction));

    let span = transaction.begin_span(SpanBuilder::new("s", "app"), None);
    let cx_newer = cx_new.with_span(span.clone());
    assert!(cx_new.span().is_none());
    assert_eq!(cx_newer.span().and_then(ActiveSpan::id), span.id());
    assert_eq!(cx_newer.transaction(), Some(&transaction));

    // Switching transaction forgets the span of the previous one.
    let other = detached(&tracer, "b");
    assert!(cx_newer.with_transaction(other).span().is_none());
}

#[test]
fn nested_contexts() {
    let tracer = tracer();
    let outer = detached(&tracer, "outer");
    let inner = detached(&tracer, "inner");

    let _outer_guard = Context::new().with_transaction(outer).attach();
    assert_eq!(current_transaction_name().as_deref(), Some("outer"));

    {
        let _inner_guard = Context::current().with_transaction(inner).attach();
        assert_eq!(current_transaction_name().as_deref(), Some("inner"));
    }

    assert_eq!(current_transaction_name().as_deref(), Some("outer"));
}

#[test]
fn overlapping_contexts() {
    let tracer = tracer();
    let outer_guard = Context::new()
        .with_transaction(detached(&tracer, "outer"))
        .attach();
    let inner_guard = Context::new()
        .with_transaction(detached(&tracer, "inner"))
        .attach();

    drop(outer_guard);
    // The inner guard is still alive, so its context stays current.
    assert_eq!(current_transaction_name().as_deref(), Some("inner"));

    drop(inner_guard);
    assert_eq!(current_transaction_name(), None);
}

#[test]
fn setters_replace_pointers_in_place() {
    let tracer = tracer();
    let transaction = detached(&tracer, "t");
    let span = transaction.begin_span(SpanBuilder::new("s", "app"), None);

    set_transaction(Some(transaction.clone()));
    set_span(Some(span.clone()));
    assert_eq!(get_transaction(), Some(transaction.clone()));
    assert_eq!(get_span().and_then(|span| span.id()), span.id());

    set_span(None);
    assert!(get_span().is_none());
    assert_eq!(get_transaction(), Some(transaction));

    set_span(Some(span));
    set_transaction(None);
    assert!(get_transaction().is_none());
    assert!(get_span().is_none());
}

#[test]
fn setters_only_touch_the_attached_context() {
    let tracer = tracer();
    let _base = Context::new().attach();
    {
        let _guard = Context::new().attach();
        set_transaction(Some(detached(&tracer, "scoped")));
        assert_eq!(current_transaction_name().as_deref(), Some("scoped"));
    }
    assert_eq!(current_transaction_name(), None);
}

#[test]
fn test_initial_capacity() {
    let stack = ContextStack::default();
    assert_eq!(stack.stack.capacity(), ContextStack::INITIAL_CAPACITY);
}

#[test]
fn test_pop_id_out_of_order() {
    let tracer = tracer();
    let mut stack = ContextStack::default();
    let name = |stack: &ContextStack| stack.current_cx.transaction().map(Transaction::name);

    let id1 = stack.push(Context::new().with_transaction(detached(&tracer, "1")));
    let id2 = stack.push(Context::new().with_transaction(detached(&tracer, "2")));
    let id3 = stack.push(Context::new().with_transaction(detached(&tracer, "3")));

    // Popping the middle context leaves the current one alone.
    assert_eq!(stack.pop_id(id2).len(), 1);
    assert_eq!(name(&stack).as_deref(), Some("3"));
    assert_eq!(stack.stack.len(), 3);

    stack.pop_id(id3);
    assert_eq!(name(&stack).as_deref(), Some("1"));
    assert_eq!(stack.stack.len(), 1);

    stack.pop_id(id1);
    assert_eq!(name(&stack), None);
    assert_eq!(stack.stack.len(), 0);
}

#[test]
fn test_pop_id_edge_cases() {
    let mut stack = ContextStack::default();

    stack.pop_id(ContextStack::BASE_POS);
    assert_eq!(stack.stack.len(), 0);

    stack.pop_id(ContextStack::MAX_POS);
    assert_eq!(stack.stack.len(), 0);

    assert!(stack.pop_id(1000).is_empty());
    assert_eq!(stack.stack.len(), 0);

    stack.pop_id(1);
    assert_eq!(stack.stack.len(), 0);
}

#[test]
fn test_push_overflow() {
    let tracer = tracer();
    let mut stack = ContextStack::default();
    let max_pos = ContextStack::MAX_POS as usize;

    for i in 0..max_pos - 1 {
        assert_eq!(stack.push(Context::new()), (i + 1) as u16);
    }
    let last = detached(&tracer, "last");
    stack.current_cx = Context::new().with_transaction(last.clone());

    let id = stack.push(Context::new().with_transaction(detached(&tracer, "overflow")));
    assert_eq!(id, ContextStack::MAX_POS);
    assert_eq!(stack.current_cx.transaction(), Some(&last));
}

#[tokio::test]
async fn transaction_begun_in_task_survives_await() {
    let tracer = tracer();
    let task = async {
        let transaction = tracer.begin_transaction("job", None);
        sleep(Duration::from_millis(5)).await;
        assert_eq!(get_transaction(), Some(transaction.clone()));
        tracer.end_transaction(None, None);
        assert!(get_transaction().is_none());
        transaction
    };
    let transaction = FutureContextExt::with_context(task, Context::new()).await;
    assert!(transaction.is_ended());
    assert!(get_transaction().is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn interleaved_tasks_keep_their_own_transaction() {
    let tracer = tracer();
    let run = |name: &'static str, delay: u64| {
        let tracer = tracer.clone();
        let task = async move {
            let transaction = tracer.begin_transaction("job", None);
            transaction.set_name(name);
            for _ in 0..3 {
                sleep(Duration::from_millis(delay)).await;
                assert_eq!(current_transaction_name().as_deref(), Some(name));
            }
            tracer.end_transaction(None, None);
        };
        FutureContextExt::with_context(task, Context::new())
    };

    tokio::join!(run("first", 3), run("second", 2));
    assert!(get_transaction().is_none());
}

#[tokio::test]
async fn out_of_order_future_completion() {
    async fn create_a_future() -> impl std::future::Future<Output = Option<String>> {
        FutureContextExt::with_current_context(async {
            sleep(Duration::from_millis(20)).await;
            current_transaction_name()
        })
    }

    let tracer = tracer();
    let parent_cx = Context::new().with_transaction(detached(&tracer, "parent"));
    let future = FutureContextExt::with_context(create_a_future(), parent_cx).await;

    assert_eq!(future.await.as_deref(), Some("parent"));
    assert_eq!(current_transaction_name(), None);
}

#[tokio::test]
async fn streams_poll_inside_their_context() {
    let tracer = tracer();
    let cx = Context::new().with_transaction(detached(&tracer, "stream"));
    let names: Vec<Option<String>> = StreamContextExt::with_context(
        stream::iter(0..3).map(|_| current_transaction_name()),
        cx,
    )
    .collect()
    .await;
    assert_eq!(names, vec![Some("stream".to_string()); 3]);
    assert_eq!(current_transaction_name(), None);
}
