use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use async_trait::async_trait;
use cadence_core::{
    CreateTask, Pagination, RunContext, Runner, Task, TaskFilter, TaskRepository, TaskState,
};
use cadence_infra::{InMemoryTaskRepository, Queue, QueueConfig};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

const BACKLOGS: [usize; 3] = [100, 1_000, 10_000];

struct Noop;

#[async_trait]
impl Runner for Noop {
    fn runner_type(&self) -> &str {
        "noop"
    }

    fn expected_duration(&self) -> Duration {
        Duration::from_millis(1)
    }

    async fn run(&self, _ctx: RunContext, _task: &mut Task) -> anyhow::Result<()> {
        Ok(())
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn seeded(rt: &Runtime, backlog: usize) -> Arc<InMemoryTaskRepository> {
    rt.block_on(async {
        let repo = InMemoryTaskRepository::arc();
        for i in 0..backlog {
            repo.create_task(CreateTask::new("noop").with_priority((i % 7) as i32))
                .await
                .unwrap();
        }
        repo
    })
}

/// Cursor walk over a pending backlog, no claims.
fn bench_pending_scan(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("pending_scan");

    for backlog in BACKLOGS {
        group.throughput(Throughput::Elements(backlog as u64));
        let repo = seeded(&rt, backlog);
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let mut cursor = repo.iterate_pending().await.unwrap();
                    let mut seen = 0usize;
                    while let Some(task) = cursor.next().await.unwrap() {
                        black_box(&task);
                        seen += 1;
                    }
                    cursor.close().await.unwrap();
                    seen
                })
            });
        });
    }

    group.finish();
}

/// Cursor walk that claims every task through the compare-and-swap.
fn bench_claim_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_throughput");

    for backlog in BACKLOGS {
        group.throughput(Throughput::Elements(backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, &backlog| {
            b.iter_batched(
                || seeded(&rt, backlog),
                |repo| {
                    rt.block_on(async {
                        let mut cursor = repo.iterate_pending().await.unwrap();
                        while let Some(mut task) = cursor.next().await.unwrap() {
                            let now = Utc::now();
                            task.claim(now, now + chrono::Duration::minutes(1));
                            black_box(repo.update_from_state(&task, TaskState::Pending).await.unwrap());
                        }
                        cursor.close().await.unwrap();
                    })
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Time for a started queue to run a backlog to completion.
fn bench_queue_drain(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("queue_drain");
    group.sample_size(10);

    for workers in [1usize, 4, 16] {
        let backlog = 500;
        group.throughput(Throughput::Elements(backlog as u64));
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.iter_batched(
                || seeded(&rt, backlog),
                |repo| {
                    rt.block_on(async {
                        let config = QueueConfig::default()
                            .with_name("bench")
                            .with_workers(workers)
                            .with_poll_delay(Duration::from_millis(1));
                        let mut queue = Queue::new(repo.clone(), config).unwrap();
                        queue.register_runner(Arc::new(Noop)).unwrap();
                        queue.start().unwrap();

                        let done = TaskFilter {
                            state: Some(TaskState::Completed),
                            ..Default::default()
                        };
                        loop {
                            let page = repo
                                .list_tasks(done.clone(), Pagination::new(Some(1), None))
                                .await
                                .unwrap();
                            if page.total as usize == backlog {
                                break;
                            }
                            tokio::time::sleep(Duration::from_millis(1)).await;
                        }
                        queue.stop().await;
                    })
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_pending_scan,
    bench_claim_throughput,
    bench_queue_drain
);
criterion_main!(benches);
