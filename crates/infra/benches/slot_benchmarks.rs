use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use crawlgate_core::TenantId;
use crawlgate_infra::config::SemaphoreConfig;
use crawlgate_infra::feeder::PendingQueue;
use crawlgate_infra::jobs::{JobKind, PendingJob};
use crawlgate_infra::keys::active_jobs_key;
use crawlgate_infra::limiter::TenantSemaphore;
use crawlgate_infra::store::{AtomicOps, InMemoryKvStore};
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn bench_atomic_acquire_release(c: &mut Criterion) {
    let rt = runtime();
    let store = InMemoryKvStore::new();
    let key = active_jobs_key(TenantId::new());
    let ttl = Duration::from_secs(600);

    let mut group = c.benchmark_group("atomic_slot_ops");
    group.throughput(Throughput::Elements(1));

    group.bench_function("acquire_then_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                let slot = store.acquire_slot(&key, 10, ttl).await.unwrap();
                black_box(slot);
                store.release_slot(&key, ttl).await.unwrap();
            })
        });
    });

    // Tenant already at its limit: the common rejection path.
    rt.block_on(async {
        store.acquire_slot(&key, 1, ttl).await.unwrap();
    });
    group.bench_function("rejected_acquire", |b| {
        b.iter(|| rt.block_on(async { black_box(store.acquire_slot(&key, 1, ttl).await.unwrap()) }));
    });

    group.finish();
}

fn bench_semaphore_tenants(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("semaphore_acquire_release");

    for tenant_count in [1usize, 16, 256].iter() {
        let store = Arc::new(InMemoryKvStore::new());
        let sem = TenantSemaphore::new(store, SemaphoreConfig::default());
        let tenants: Vec<_> = (0..*tenant_count).map(|_| TenantId::new()).collect();

        group.throughput(Throughput::Elements(*tenant_count as u64));
        group.bench_with_input(
            BenchmarkId::new("tenants", tenant_count),
            &tenants,
            |b, tenants| {
                b.iter(|| {
                    rt.block_on(async {
                        for tenant_id in tenants {
                            let acquisition = sem.acquire(*tenant_id).await;
                            sem.release(*tenant_id, acquisition).await;
                        }
                    })
                });
            },
        );
    }

    group.finish();
}

fn bench_pending_peek(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("pending_queue_peek");

    for depth in [10usize, 100, 1000].iter() {
        let store = Arc::new(InMemoryKvStore::new());
        let pending = PendingQueue::new(store);
        let tenant_id = TenantId::new();
        rt.block_on(async {
            for n in 0..*depth {
                let job = PendingJob::new(
                    tenant_id,
                    JobKind::crawl(format!("https://example.com/{n}")),
                    serde_json::json!({}),
                );
                pending.push(&job).await.unwrap();
            }
        });

        group.bench_with_input(BenchmarkId::new("peek_50", depth), depth, |b, _| {
            b.iter(|| rt.block_on(async { black_box(pending.peek(tenant_id, 50).await.unwrap()) }));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_atomic_acquire_release,
    bench_semaphore_tenants,
    bench_pending_peek
);
criterion_main!(benches);
