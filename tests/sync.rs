// tests/sync.rs
mod common;

use common::{process_closed, process_created, result_published, ScriptedLedger};
use ovote_node::eth::{ChainSynchronizer, EventKind, SyncConfig, SyncError};
use ovote_node::storage::{MemoryStore, ProcessStore, StoreError};
use ovote_node::types::ProcessStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CHAIN: u64 = 1337;

fn config(batch_size: u64) -> SyncConfig {
    SyncConfig {
        batch_size,
        poll_interval: Duration::from_millis(10),
        start_block: 1,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        ..SyncConfig::default()
    }
}

async fn connect(
    ledger: &Arc<ScriptedLedger>,
    store: &Arc<MemoryStore>,
    batch_size: u64,
) -> ChainSynchronizer {
    ChainSynchronizer::connect(
        ledger.clone(),
        store.clone(),
        config(batch_size),
        &CancellationToken::new(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn historical_sync_creates_processes_and_advances_cursor() {
    let ledger = Arc::new(ScriptedLedger::new(CHAIN));
    let store = Arc::new(MemoryStore::new());
    ledger.push(3, EventKind::ProcessCreated, process_created(1, &[7; 32], 3, 50, 10));
    ledger.push(8, EventKind::ProcessCreated, process_created(2, &[8; 32], 5, 9, 10));
    ledger.set_head(12);

    let sync = connect(&ledger, &store, 5).await;
    let reached = sync.sync_history(&CancellationToken::new()).await.unwrap();
    assert_eq!(reached, 12);
    assert_eq!(ledger.requested(), vec![(1, 5), (6, 10), (11, 12)]);

    let cursor = store.last_sync_block().unwrap().unwrap();
    assert_eq!(cursor.chain_id, CHAIN);
    assert_eq!(cursor.last_synced_block, 12);

    let p1 = store.read_process(1).unwrap().unwrap();
    assert_eq!(p1.created_block, 3);
    assert_eq!(p1.census_root, [7; 32]);
    assert_eq!(p1.status, ProcessStatus::On);
    assert_eq!(p1.min_participation, 10);
    // publication starts at block 9, so by block 12 voting is over
    assert_eq!(store.read_process(2).unwrap().unwrap().status, ProcessStatus::Frozen);
}

#[tokio::test]
async fn start_block_zero_scans_from_block_one() {
    let ledger = Arc::new(ScriptedLedger::new(CHAIN));
    let store = Arc::new(MemoryStore::new());
    ledger.push(1, EventKind::ProcessCreated, process_created(1, &[1; 32], 1, 100, 10));
    ledger.set_head(4);

    let sync = ChainSynchronizer::connect(
        ledger.clone(),
        store.clone(),
        SyncConfig {
            start_block: 0,
            ..config(10)
        },
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(sync.sync_history(&CancellationToken::new()).await.unwrap(), 4);
    assert_eq!(ledger.requested(), vec![(1, 4)]);
    assert!(store.read_process(1).unwrap().is_some());
}

#[tokio::test]
async fn restart_resumes_after_persisted_cursor() {
    let ledger = Arc::new(ScriptedLedger::new(CHAIN));
    let store = Arc::new(MemoryStore::new());
    ledger.push(4, EventKind::ProcessCreated, process_created(1, &[1; 32], 1, 100, 10));
    ledger.set_head(10);
    connect(&ledger, &store, 100)
        .await
        .sync_history(&CancellationToken::new())
        .await
        .unwrap();

    // a second ledger view that would replay block 4 if it were asked for it
    let resumed = Arc::new(ScriptedLedger::new(CHAIN));
    resumed.push(4, EventKind::ProcessClosed, process_closed(1, 1));
    resumed.push(11, EventKind::ProcessCreated, process_created(2, &[2; 32], 1, 100, 10));
    resumed.set_head(15);
    let sync = connect(&resumed, &store, 100).await;
    sync.sync_history(&CancellationToken::new()).await.unwrap();

    assert_eq!(resumed.requested(), vec![(11, 15)]);
    assert_eq!(store.read_process(1).unwrap().unwrap().status, ProcessStatus::On);
    assert!(store.read_process(2).unwrap().is_some());
    assert_eq!(store.last_sync_block().unwrap().unwrap().last_synced_block, 15);
}

#[tokio::test]
async fn failed_close_keeps_status_and_successful_close_applies() {
    let ledger = Arc::new(ScriptedLedger::new(CHAIN));
    let store = Arc::new(MemoryStore::new());
    ledger.push(2, EventKind::ProcessCreated, process_created(1, &[1; 32], 1, 100, 10));
    ledger.push(5, EventKind::ProcessClosed, process_closed(1, 0));
    ledger.push(5, EventKind::ProcessClosed, process_closed(1, 2));
    ledger.set_head(6);
    let sync = connect(&ledger, &store, 100).await;
    sync.sync_history(&CancellationToken::new()).await.unwrap();
    assert_eq!(store.read_process(1).unwrap().unwrap().status, ProcessStatus::On);

    ledger.push(7, EventKind::ProcessClosed, process_closed(1, 1));
    ledger.set_head(7);
    sync.sync_history(&CancellationToken::new()).await.unwrap();
    assert_eq!(store.read_process(1).unwrap().unwrap().status, ProcessStatus::Closed);
}

#[tokio::test]
async fn result_published_updates_known_open_processes_only() {
    let ledger = Arc::new(ScriptedLedger::new(CHAIN));
    let store = Arc::new(MemoryStore::new());
    ledger.push(1, EventKind::ProcessCreated, process_created(1, &[1; 32], 3, 5, 10));
    ledger.push(2, EventKind::ProcessCreated, process_created(2, &[2; 32], 3, 5, 10));
    ledger.push(3, EventKind::ProcessClosed, process_closed(2, 1));
    ledger.push(6, EventKind::ResultPublished, result_published(1, 2, 3));
    ledger.push(6, EventKind::ResultPublished, result_published(2, 9, 9));
    ledger.push(6, EventKind::ResultPublished, result_published(77, 1, 1));
    ledger.set_head(8);
    let sync = connect(&ledger, &store, 100).await;
    sync.sync_history(&CancellationToken::new()).await.unwrap();

    let p1 = store.read_process(1).unwrap().unwrap();
    assert_eq!(p1.status, ProcessStatus::ResultsPublished);
    assert_eq!(p1.result, Some(2));
    assert_eq!(p1.n_votes, 3);

    let p2 = store.read_process(2).unwrap().unwrap();
    assert_eq!(p2.status, ProcessStatus::Closed);
    assert_eq!(p2.result, None);
    assert!(store.read_process(77).unwrap().is_none());
}

#[tokio::test]
async fn malformed_log_aborts_without_advancing() {
    let ledger = Arc::new(ScriptedLedger::new(CHAIN));
    let store = Arc::new(MemoryStore::new());
    ledger.push(2, EventKind::ProcessCreated, process_created(1, &[1; 32], 1, 100, 10));
    ledger.push(7, EventKind::ProcessClosed, vec![0u8; 95]);
    ledger.set_head(12);
    let sync = connect(&ledger, &store, 5).await;

    let err = sync.sync_history(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::Decode { block: 7, .. }));
    assert_eq!(store.last_sync_block().unwrap().unwrap().last_synced_block, 5);
    assert!(store.read_process(1).unwrap().is_some());
}

#[tokio::test]
async fn transient_fetch_errors_are_retried() {
    let ledger = Arc::new(ScriptedLedger::new(CHAIN));
    let store = Arc::new(MemoryStore::new());
    ledger.push(2, EventKind::ProcessCreated, process_created(1, &[1; 32], 1, 100, 10));
    ledger.set_head(4);
    ledger.fail_next(2);
    let sync = connect(&ledger, &store, 100).await;
    sync.sync_history(&CancellationToken::new()).await.unwrap();

    assert_eq!(ledger.requested(), vec![(1, 4), (1, 4), (1, 4)]);
    assert!(store.read_process(1).unwrap().is_some());
}

#[tokio::test]
async fn cancelled_sync_leaves_cursor() {
    let ledger = Arc::new(ScriptedLedger::new(CHAIN));
    let store = Arc::new(MemoryStore::new());
    ledger.push(2, EventKind::ProcessCreated, process_created(1, &[1; 32], 1, 100, 10));
    ledger.set_head(4);
    let sync = connect(&ledger, &store, 100).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        sync.sync_history(&cancel).await,
        Err(SyncError::Cancelled)
    ));
    assert_eq!(store.last_sync_block().unwrap().unwrap().last_synced_block, 0);
    assert!(store.read_process(1).unwrap().is_none());
}

#[tokio::test]
async fn store_bound_to_other_chain_is_refused() {
    let ledger = Arc::new(ScriptedLedger::new(CHAIN));
    let store = Arc::new(MemoryStore::new());
    store.init_meta(CHAIN + 1, 0).unwrap();
    let r = ChainSynchronizer::connect(ledger, store, config(10), &CancellationToken::new()).await;
    assert!(matches!(
        r,
        Err(SyncError::Store(StoreError::ChainIdMismatch { .. }))
    ));
}

#[tokio::test]
async fn live_sync_follows_new_blocks() {
    let ledger = Arc::new(ScriptedLedger::new(CHAIN));
    let store = Arc::new(MemoryStore::new());
    ledger.set_head(3);
    let sync = Arc::new(connect(&ledger, &store, 100).await);
    let mut heights = sync.subscribe();
    let cancel = CancellationToken::new();
    let task = sync.clone().start(cancel.clone());

    ledger.push(5, EventKind::ProcessCreated, process_created(9, &[9; 32], 1, 100, 10));
    ledger.set_head(6);
    tokio::time::timeout(Duration::from_secs(5), async {
        while *heights.borrow_and_update() < 6 {
            heights.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    assert_eq!(store.read_process(9).unwrap().unwrap().status, ProcessStatus::On);
    cancel.cancel();
    task.await.unwrap().unwrap();

    // every block fetched once, in order, no gaps
    let ranges = ledger.requested();
    let mut expected_from = 1;
    for (from, to) in ranges {
        assert_eq!(from, expected_from);
        expected_from = to + 1;
    }
    assert_eq!(expected_from, 7);
}
