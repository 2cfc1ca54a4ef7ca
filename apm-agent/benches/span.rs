use apm_agent::export::NoopEventQueue;
use apm_agent::trace::{SpanBuilder, TraceParent, Tracer};
use apm_agent::Config;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

fn tracer(config: Config) -> Tracer {
    Tracer::builder()
        .with_config(config)
        .with_queue(NoopEventQueue::new())
        .build()
}

fn criterion_benchmark(c: &mut Criterion) {
    span_benchmark_group(c);
    trace_parent_benchmark_group(c);
}

fn span_benchmark_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("span");

    group.bench_function("unsampled", |b| {
        let tracer = tracer(Config {
            transaction_sample_rate: 0.0,
            ..Default::default()
        });
        tracer.begin_transaction("bench", None);
        b.iter(|| {
            let _span = tracer.capture_span(SpanBuilder::new("span", "app"));
        });
        tracer.end_transaction(None, None);
    });

    for spans in [1, 10, 100] {
        group.bench_function(BenchmarkId::new("transaction_with_spans", spans), |b| {
            let tracer = tracer(Config {
                span_stack_trace_min_duration: None,
                ..Default::default()
            });
            b.iter(|| {
                tracer.begin_transaction("bench", None);
                for _ in 0..spans {
                    let _span = tracer.capture_span(SpanBuilder::new("span", "app"));
                }
                tracer.end_transaction(None, None);
            });
        });
    }

    group.bench_function(BenchmarkId::new("compressed_exit_spans", 100), |b| {
        let tracer = tracer(Config {
            span_stack_trace_min_duration: None,
            ..Default::default()
        });
        b.iter(|| {
            tracer.begin_transaction("bench", None);
            for _ in 0..100 {
                tracer
                    .begin_span(
                        SpanBuilder::new("SELECT FROM users", "db")
                            .with_subtype("postgresql")
                            .leaf(true)
                            .with_duration(Duration::from_millis(1)),
                    )
                    .end();
            }
            tracer.end_transaction(None, None);
        });
    });

    group.finish();
}

fn trace_parent_benchmark_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("trace_parent");
    let header = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    group.bench_function("parse", |b| {
        b.iter(|| TraceParent::from_string(header, Some("es=s:0.5,other=value")));
    });
    group.bench_function("format", |b| {
        let trace_parent = TraceParent::from_string(header, None);
        b.iter(|| trace_parent.as_ref().map(TraceParent::to_string));
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
