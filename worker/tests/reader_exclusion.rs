//! The reader-exclusion protocol across concurrent workers.

mod common;

use std::{collections::HashSet, sync::Arc, time::Duration};

use comms::msg::{VarId, VarValue};
use tokio::sync::Mutex;

const BATCH: i64 = 2;

#[tokio::test]
async fn exactly_one_worker_acquires_the_reader() -> worker::Result<()> {
    let (state, _waiter) = common::server(2, 0);
    let mut first = common::link(&state);
    let mut second = common::link(&state);

    // Both race at position 0; only one compare-and-set succeeds.
    assert!(first.acquire_reader().await?);
    assert!(!second.acquire_reader().await?);

    // The winner reads from 0 and advances the shared cursor by one batch.
    assert_eq!(first.read_int(VarId::Position).await?, 0);
    first
        .write_var(VarId::Position, VarValue::Int(BATCH))
        .await?;
    first.release_reader().await?;

    // The loser acquires after the release and continues at the advanced
    // cursor: no batch is read twice.
    assert!(second.acquire_reader().await?);
    assert_eq!(second.read_int(VarId::Position).await?, BATCH);
    second.release_reader().await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_readers_never_claim_the_same_batch() {
    const READS_PER_WORKER: usize = 5;
    const WORKERS: usize = 2;

    let (state, _waiter) = common::server(WORKERS, 0);
    let starts: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for _ in 0..WORKERS {
        let mut client = common::link(&state);
        let starts = Arc::clone(&starts);

        tasks.push(tokio::spawn(async move {
            for _ in 0..READS_PER_WORKER {
                while !client.acquire_reader().await.unwrap() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }

                let position = client.read_int(VarId::Position).await.unwrap();
                starts.lock().await.push(position);

                client
                    .write_var(VarId::Position, VarValue::Int(position + BATCH))
                    .await
                    .unwrap();
                client.release_reader().await.unwrap();
            }
        }));
    }

    for task in tasks {
        tokio::time::timeout(Duration::from_secs(30), task)
            .await
            .expect("a reader stalled")
            .unwrap();
    }

    let starts = starts.lock().await;
    let unique: HashSet<i64> = starts.iter().copied().collect();

    assert_eq!(starts.len(), WORKERS * READS_PER_WORKER);
    assert_eq!(unique.len(), starts.len(), "a batch was claimed twice");
    assert!(unique.contains(&0));
    assert!(unique.contains(&(BATCH * (WORKERS * READS_PER_WORKER - 1) as i64)));
}
