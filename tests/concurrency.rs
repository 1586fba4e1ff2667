use std::sync::Arc;
use std::time::Duration;

use ledger_eng::{Amount, Engine, EngineConfig, Transfer, TransferRequest, TransferStatus};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn amt(s: &str) -> Amount {
    s.parse().unwrap()
}

fn engine_with(accounts: &[(&str, &str)]) -> Arc<Engine> {
    let config = EngineConfig {
        lock_timeout: Duration::from_secs(30),
        idempotency_wait: Duration::from_secs(30),
        ..EngineConfig::default()
    };
    let engine = Engine::with_config(config);
    for (id, balance) in accounts {
        engine.create_account(*id, *id, amt(balance)).unwrap();
    }
    Arc::new(engine)
}

async fn submit_all(engine: &Arc<Engine>, requests: Vec<TransferRequest>) -> Vec<Transfer> {
    let tasks: Vec<_> = requests
        .into_iter()
        .map(|request| {
            let engine = Arc::clone(engine);
            tokio::spawn(async move { engine.submit_transfer(request).await })
        })
        .collect();

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transfers_from_one_account() {
    let engine = engine_with(&[("A", "1000.00"), ("B", "0.00")]);
    let requests = (0..100)
        .map(|i| TransferRequest::new(format!("t{i}"), "A", "B", amt("1.00")))
        .collect();

    let results = submit_all(&engine, requests).await;

    assert!(results.iter().all(Transfer::is_completed));
    assert_eq!(engine.balance(&"A".into()).await.unwrap(), amt("900.00"));
    assert_eq!(engine.balance(&"B".into()).await.unwrap(), amt("100.00"));
    assert_eq!(engine.ledger_len().unwrap(), 100);

    let entries: Vec<_> = engine
        .history(&"A".into())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(entries.len(), 100);
    assert!(entries.iter().all(|entry| entry.posting.is_balanced()));

    // sequences are gap free and every receipt points at its own entry
    let mut sequences: Vec<u64> = results
        .iter()
        .map(|transfer| transfer.receipt().unwrap().sequence)
        .collect();
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=100).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_execute_once() {
    let engine = engine_with(&[("A", "1000.00"), ("B", "0.00")]);
    let requests = (0..50)
        .map(|_| TransferRequest::new("same-key", "A", "B", amt("250.00")))
        .collect();

    let results = submit_all(&engine, requests).await;

    let first = &results[0];
    assert!(first.is_completed());
    assert!(results.iter().all(|transfer| transfer == first));
    assert_eq!(engine.balance(&"A".into()).await.unwrap(), amt("750.00"));
    assert_eq!(engine.balance(&"B".into()).await.unwrap(), amt("250.00"));
    assert_eq!(engine.ledger_len().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overdraw_race_never_goes_negative() {
    let engine = engine_with(&[("A", "100.00"), ("B", "0.00"), ("C", "0.00")]);
    // 20 transfers of 10.00 compete for 100.00
    let requests = (0..20)
        .map(|i| {
            let to = if i % 2 == 0 { "B" } else { "C" };
            TransferRequest::new(format!("t{i}"), "A", to, amt("10.00"))
        })
        .collect();

    let results = submit_all(&engine, requests).await;

    let completed = results.iter().filter(|t| t.is_completed()).count();
    let rejected = results
        .iter()
        .filter(|t| t.status() == TransferStatus::Rejected)
        .count();
    assert_eq!(completed, 10);
    assert_eq!(rejected, 10);
    assert_eq!(engine.balance(&"A".into()).await.unwrap(), Amount::ZERO);
    assert_eq!(engine.total_balance().unwrap(), amt("100.00"));
    assert_eq!(engine.ledger_len().unwrap(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn random_transfers_conserve_money_without_deadlock() {
    const ACCOUNTS: usize = 6;
    let names: Vec<String> = (0..ACCOUNTS).map(|i| format!("acct-{i}")).collect();
    let seeded: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), "500.00")).collect();
    let engine = engine_with(&seeded);
    let initial_total = engine.total_balance().unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let mut requests = Vec::new();
    for i in 0..400 {
        let from = rng.gen_range(0..ACCOUNTS);
        let to = (from + rng.gen_range(1..ACCOUNTS)) % ACCOUNTS;
        let amount = Amount::from_minor(rng.gen_range(1..=20_000));
        requests.push(TransferRequest::new(
            format!("r{i}"),
            names[from].as_str(),
            names[to].as_str(),
            amount,
        ));
        // same pair in the opposite direction
        requests.push(TransferRequest::new(
            format!("r{i}-back"),
            names[to].as_str(),
            names[from].as_str(),
            amount,
        ));
    }

    let results = tokio::time::timeout(Duration::from_secs(60), submit_all(&engine, requests))
        .await
        .expect("transfers deadlocked");

    assert_eq!(engine.total_balance().unwrap(), initial_total);
    for account in engine.accounts().unwrap() {
        assert!(!account.balance.is_negative(), "{} went negative", account.id);
    }

    let completed = results.iter().filter(|t| t.is_completed()).count() as u64;
    assert_eq!(engine.ledger_len().unwrap(), completed);

    // replaying every key changes nothing
    let before = engine.accounts().unwrap();
    for transfer in &results {
        let replay = TransferRequest::new(
            transfer.key.clone(),
            transfer.from.clone(),
            transfer.to.clone(),
            transfer.amount,
        );
        assert_eq!(&engine.submit_transfer(replay).await.unwrap(), transfer);
    }
    assert_eq!(engine.accounts().unwrap(), before);
    assert_eq!(engine.ledger_len().unwrap(), completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_replay_returns_stored_outcome() {
    let engine = engine_with(&[("A", "1000.00"), ("B", "0.00")]);
    let request = TransferRequest::new("t1", "A", "B", amt("250.00")).with_description("rent");

    let first = engine.submit_transfer(request.clone()).await.unwrap();
    let second = engine.submit_transfer(request).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.description.as_deref(), Some("rent"));
    assert_eq!(engine.lookup_transfer(&"t1".into()).unwrap(), Some(first));
    assert_eq!(engine.ledger_len().unwrap(), 1);
}
