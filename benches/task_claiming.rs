//! Benchmarks the critical path of a single outbox table: enqueue then
//! batch-claim via [`OutboxRow`]/[`OutboxStore::claim_batch`].

use std::sync::Arc;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use workflow_runtime::outbox::memory::InMemoryOutboxStore;
use workflow_runtime::outbox::{OutboxRow, OutboxStore};

fn bench_claim_batch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("task_claiming/claim_batch");
    group.throughput(Throughput::Elements(1));

    for batch_size in [1usize, 10, 50] {
        group.bench_with_input(BenchmarkId::new("batch", batch_size), &batch_size, |b, &batch_size| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let store = Arc::new(InMemoryOutboxStore::default());
                let now = Utc::now();
                let row_count = (iters as usize) * batch_size;
                for i in 0..row_count {
                    store.enqueue(OutboxRow::new(format!("payload-{i}"), now)).await.unwrap();
                }

                let start = std::time::Instant::now();
                let mut claimed_total = 0usize;
                while claimed_total < row_count {
                    let claimed = store.claim_batch(batch_size, 5, now).await.unwrap();
                    if claimed.is_empty() {
                        break;
                    }
                    for row in &claimed {
                        store.mark_sent(row.id, row.version).await.unwrap();
                    }
                    claimed_total += claimed.len();
                }
                start.elapsed()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_claim_batch);
criterion_main!(benches);
