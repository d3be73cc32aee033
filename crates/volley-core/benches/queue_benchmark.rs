//! Performance benchmarks for the batch queue and processor.
//!
//! The processor benchmark uses a fetcher that answers immediately, so it
//! measures scheduling overhead only.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use tokio::runtime::Runtime;
use volley_core::{
    AgingPriority, BatchConfig, BatchPriority, BatchProcessor, BatchRequest, FetchRequest,
    FetchResponse, FnFetcher, PriorityQueue,
};

fn fill(queue: &PriorityQueue<usize>, count: usize) {
    for i in 0..count {
        queue.enqueue(i, BatchPriority::ALL[i % BatchPriority::ALL.len()]);
    }
}

fn bench_queue_strict(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_strict");
    for count in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let queue = PriorityQueue::new();
                fill(&queue, count);
                while let Some(item) = queue.dequeue() {
                    black_box(item);
                }
            });
        });
    }
    group.finish();
}

fn bench_queue_aging(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_aging");
    for count in [100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let queue = PriorityQueue::with_strategy(None, Arc::new(AgingPriority::new(0.1)));
                fill(&queue, count);
                while let Some(item) = queue.dequeue() {
                    black_box(item);
                }
            });
        });
    }
    group.finish();
}

fn bench_process_batch(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let fetcher = Arc::new(FnFetcher::new(|request: FetchRequest| async move {
        Ok(FetchResponse::new(request.url, 200, "ok"))
    }));
    let config = BatchConfig {
        max_concurrent_requests_per_batch: 50,
        ..BatchConfig::default()
    };
    let processor = Arc::new(BatchProcessor::new(Arc::new(config), fetcher));

    c.bench_function("process_batch_100_requests", |b| {
        b.to_async(&rt).iter(|| {
            let processor = Arc::clone(&processor);
            async move {
                let urls = (0..100).map(|i| format!("https://bench.test/{i}"));
                let batch = BatchRequest::from_urls(urls)
                    .expect("non-empty batch")
                    .with_max_concurrent(50);
                processor.register(&batch.id);
                black_box(processor.process_batch(&batch, None).await)
            }
        });
    });
}

criterion_group!(benches, bench_queue_strict, bench_queue_aging, bench_process_batch);
criterion_main!(benches);
