use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ledger_eng::{Amount, Engine, TransferRequest};
use tokio::runtime::{Builder, Runtime};

/// Generates transfers that always succeed when submitted in order.
///
/// Accounts form a ring: transfer `n` moves 1.00 from account `n % accounts`
/// to the next one, so every account receives as much as it sends.
pub struct TransferGenerator {
    next_key: u64,
    total: u64,
    accounts: u64,
}

impl TransferGenerator {
    pub fn new(accounts: u64, total: u64) -> Self {
        Self {
            next_key: 0,
            total,
            accounts,
        }
    }
}

impl Iterator for TransferGenerator {
    type Item = TransferRequest;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_key >= self.total {
            return None;
        }
        let n = self.next_key;
        self.next_key += 1;

        let from = n % self.accounts;
        let to = (from + 1) % self.accounts;
        Some(TransferRequest::new(
            format!("bench-{n}"),
            account_name(from),
            account_name(to),
            Amount::from_units(1),
        ))
    }
}

fn account_name(i: u64) -> String {
    format!("acct-{i}")
}

/// Every account starts with enough to cover one pass around the ring.
fn engine_with(accounts: u64) -> Arc<Engine> {
    let engine = Engine::new();
    for i in 0..accounts {
        engine
            .create_account(account_name(i), "bench", Amount::from_units(1_000))
            .unwrap();
    }
    Arc::new(engine)
}

fn runtime() -> Runtime {
    Builder::new_multi_thread().enable_all().build().unwrap()
}

fn bench_sequential(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("sequential");

    for count in [1_000u64, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                rt.block_on(async {
                    let engine = engine_with(16);
                    for request in TransferGenerator::new(16, count) {
                        let _ = black_box(engine.submit_transfer(request).await);
                    }
                    engine
                })
            });
        });
    }

    group.finish();
}

fn bench_concurrent(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("concurrent");

    // few accounts means heavy lock contention
    for accounts in [2u64, 16, 256] {
        group.bench_with_input(
            BenchmarkId::from_parameter(accounts),
            &accounts,
            |b, &accounts| {
                b.iter(|| {
                    rt.block_on(async {
                        let engine = engine_with(accounts);
                        let tasks: Vec<_> = TransferGenerator::new(accounts, 10_000)
                            .map(|request| {
                                let engine = Arc::clone(&engine);
                                tokio::spawn(async move { engine.submit_transfer(request).await })
                            })
                            .collect();
                        for task in tasks {
                            let _ = black_box(task.await);
                        }
                        engine
                    })
                });
            },
        );
    }

    group.finish();
}

fn bench_replays(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("replays");

    group.bench_function("10k_same_key", |b| {
        b.iter(|| {
            rt.block_on(async {
                let engine = engine_with(2);
                let request = TransferRequest::new("k", account_name(0), account_name(1), Amount::from_units(1));
                for _ in 0..10_000 {
                    let _ = black_box(engine.submit_transfer(request.clone()).await);
                }
                engine
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_sequential, bench_concurrent, bench_replays);
criterion_main!(benches);
