use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flownet_core::{CompletionIndex, Host};
use flownet_runtime::{CompletionQueue, Gate, ThreadSync, Wakeup};

use std::sync::Arc;
use std::time::Duration;

fn bench_gate(c: &mut Criterion) {
    let mut group = c.benchmark_group("gate");

    group.bench_function("signal_then_wait", |b| {
        let gate = Gate::new();
        b.iter(|| {
            gate.signal();
            black_box(gate.wait());
        });
    });

    group.bench_function("coalesced_signals", |b| {
        let gate = Gate::new();
        b.iter(|| {
            for _ in 0..8 {
                gate.signal();
            }
            black_box(gate.wait());
        });
    });

    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let queue = Arc::new(CompletionQueue::new(64));
    let sync = ThreadSync::new();
    sync.set_completion(CompletionIndex(1));

    let host: Arc<dyn Host> = queue.clone();
    sync.start("bench-echo".into(), 64 * 1024, None, move |port| {
        while port.wait() == Wakeup::Signaled {
            port.notify(host.as_ref());
        }
    })
    .expect("spawn bench worker");

    c.bench_function("thread_sync_round_trip", |b| {
        b.iter(|| {
            sync.signal();
            black_box(queue.wait_for(CompletionIndex(1), Duration::from_secs(1)));
        });
    });

    sync.stop();
}

fn bench_completion_queue(c: &mut Criterion) {
    c.bench_function("completion_queue_notify_take", |b| {
        let queue = CompletionQueue::new(64);
        b.iter(|| {
            queue.notify(CompletionIndex(3));
            black_box(queue.try_take(CompletionIndex(3)));
        });
    });
}

criterion_group!(benches, bench_gate, bench_round_trip, bench_completion_queue);
criterion_main!(benches);
