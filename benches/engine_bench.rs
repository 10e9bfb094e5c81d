//! Benchmarks for tq-engine
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tq_engine::queue::{Popped, WorkQueue};
use tq_engine::{
    ControlFlags, Consumer, Flow, Producer, QueueOptions, ThreadQueue, WorkerHooks,
};

fn benchmark_queue_operations(c: &mut Criterion) {
    c.bench_function("queue_push_pop", |b| {
        let queue: WorkQueue<u64> = WorkQueue::new(1024, ControlFlags::NONE, 1, 1, "bench");

        b.iter(|| {
            queue.push(black_box(7), None).unwrap();
            match queue.pop(ControlFlags::NONE, None) {
                Popped::Item { unit, .. } => black_box(unit),
                _ => unreachable!(),
            };
        })
    });
}

struct Count {
    next: Arc<AtomicU64>,
    total: u64,
}

impl WorkerHooks<u64> for Count {}

impl Producer<u64> for Count {
    fn produce(&mut self, slot: &mut Option<u64>) -> Flow {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        if id >= self.total {
            return Flow::Done;
        }
        *slot = Some(id);
        Flow::Continue
    }
}

struct Sum(u64);

impl WorkerHooks<u64> for Sum {}

impl Consumer<u64> for Sum {
    fn consume(&mut self, slot: &mut Option<u64>) -> Flow {
        if let Some(unit) = slot.take() {
            self.0 = self.0.wrapping_add(unit);
        }
        Flow::Continue
    }
}

fn run_pass(producers: usize, consumers: usize, depth: usize, total: u64) -> u64 {
    let next = Arc::new(AtomicU64::new(0));
    let mut tq: ThreadQueue<u64, Count, Sum> = ThreadQueue::init(
        QueueOptions::new(producers + consumers, producers, depth),
        next,
        move |_, next: &Arc<AtomicU64>| {
            Ok(Count {
                next: Arc::clone(next),
                total,
            })
        },
        |_, _: &Arc<AtomicU64>| Ok(Sum(0)),
    )
    .unwrap();

    tq.wait_for_completion().unwrap();
    let mut sum = 0u64;
    while let Some(status) = tq.next_thread_status().unwrap() {
        if let Some(s) = status.into_consumer() {
            sum = sum.wrapping_add(s.0);
        }
    }
    tq.close().unwrap();
    sum
}

fn benchmark_full_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_pass_10k");
    group.sample_size(20);
    for &(producers, consumers) in &[(1, 1), (1, 4), (4, 4)] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}p{}c", producers, consumers)),
            &(producers, consumers),
            |b, &(p, c)| b.iter(|| black_box(run_pass(p, c, 64, 10_000))),
        );
    }
    group.finish();
}

criterion_group!(benches, benchmark_queue_operations, benchmark_full_pass);
criterion_main!(benches);
