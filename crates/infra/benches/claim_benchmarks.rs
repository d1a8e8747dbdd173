use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use taskbroker_core::NewJob;
use taskbroker_infra::jobs::{InMemoryJobStore, JobQueue, QueueInspector};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

/// A queue with `backlog` pending jobs spread over a few priorities.
fn seeded_queue(rt: &Runtime, backlog: usize) -> JobQueue<Arc<InMemoryJobStore>> {
    let queue = JobQueue::new(InMemoryJobStore::arc());
    rt.block_on(async {
        for i in 0..backlog {
            let request = NewJob::new("bench", "noop", serde_json::json!({ "i": i }))
                .with_priority((i % 5) as i32);
            queue.create(request).await.unwrap();
        }
    });
    queue
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let queue = JobQueue::new(InMemoryJobStore::arc());

    let mut group = c.benchmark_group("enqueue");
    group.throughput(Throughput::Elements(1));
    group.bench_function("immediate", |b| {
        b.iter(|| {
            rt.block_on(queue.enqueue("bench", "noop", serde_json::json!({"k": "v"})))
                .unwrap()
        })
    });
    group.finish();
}

fn bench_claim_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_next");

    for backlog in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, &backlog| {
            b.iter_batched(
                || seeded_queue(&rt, backlog),
                |queue| {
                    let claimed = rt.block_on(queue.claim_next("bench", "w1")).unwrap();
                    black_box(claimed)
                },
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

fn bench_claim_complete_cycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_complete_cycle");

    for batch in [10usize, 100] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter_batched(
                || seeded_queue(&rt, batch),
                |queue| {
                    rt.block_on(async {
                        while let Some(job) = queue.claim_next("bench", "w1").await.unwrap() {
                            queue.complete(job.id, serde_json::Value::Null).await.unwrap();
                        }
                    })
                },
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

fn bench_queue_stats(c: &mut Criterion) {
    let rt = runtime();
    let queue = seeded_queue(&rt, 10_000);
    let inspector = QueueInspector::new(queue.store().clone());

    c.bench_function("queue_stats_10k", |b| {
        b.iter(|| black_box(rt.block_on(inspector.queue_stats("bench")).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_enqueue,
    bench_claim_latency,
    bench_claim_complete_cycle,
    bench_queue_stats
);
criterion_main!(benches);
