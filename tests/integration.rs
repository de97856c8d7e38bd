// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests: a source and a sink wired through the in-process transport.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//! - `snapshot_*` - full transfer and atomic install
//! - `log_entry_*` - incremental sync, acks and retransmits
//! - `resync_*` - cancellation, data control and trim recovery
//! - `config_*` - replication set validation

mod common;

use common::*;
use log_replication_engine::log::checkpoint;
use log_replication_engine::{
    ErrorClass, MemoryLog, MessageKind, ReplicationError, ReplicationState, SharedLog, StreamId,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// =============================================================================
// Snapshot Sync
// =============================================================================

#[tokio::test]
async fn snapshot_then_log_entry_sync() {
    let pair = Pair::new(config(&["orders", "customers"]));
    put_many(pair.source_log.as_ref(), "orders", "o", 25).await;
    put_many(pair.source_log.as_ref(), "customers", "c", 5).await;

    pair.source.start_replication().await.unwrap();
    wait_caught_up(&pair.observers).await;
    pair.assert_in_sync(&["orders", "customers"]).await;
    assert_eq!(*pair.observers.snapshot_syncs.borrow(), 1);

    // New writes flow through log-entry sync.
    put_many(pair.source_log.as_ref(), "orders", "later", 4).await;
    wait_until(&pair.observers.log_entry_acks, "four log entry acks", |n| *n >= 4).await;
    pair.assert_in_sync(&["orders", "customers"]).await;
    assert_eq!(*pair.observers.errors.borrow(), 0);

    pair.source.shutdown().await;
}

#[tokio::test]
async fn snapshot_of_empty_log_completes() {
    let pair = Pair::new(config(&["orders"]));
    pair.source.start_snapshot_sync().unwrap();
    wait_caught_up(&pair.observers).await;

    assert!(state(pair.sink_log.as_ref(), "orders").await.is_empty());
    assert_eq!(*pair.observers.snapshot_syncs.borrow(), 1);
    pair.source.shutdown().await;
}

#[tokio::test]
async fn snapshot_with_nonexistent_stream() {
    let pair = Pair::new(config(&["orders", "never-written"]));
    put_many(pair.source_log.as_ref(), "orders", "o", 3).await;

    pair.source.start_snapshot_sync().unwrap();
    wait_caught_up(&pair.observers).await;
    pair.assert_in_sync(&["orders", "never-written"]).await;
    assert!(state(pair.sink_log.as_ref(), "never-written").await.is_empty());
    pair.source.shutdown().await;
}

#[tokio::test]
async fn snapshot_replaces_stale_destination_state() {
    let pair = Pair::new(config(&["orders"]));
    put(pair.sink_log.as_ref(), "orders", "stale", "x").await;
    put(pair.source_log.as_ref(), "orders", "fresh", "y").await;

    pair.source.start_snapshot_sync().unwrap();
    wait_caught_up(&pair.observers).await;

    let sink = state(pair.sink_log.as_ref(), "orders").await;
    assert_eq!(sink.len(), 1);
    assert_eq!(sink.get("fresh").map(String::as_str), Some("y"));
    pair.source.shutdown().await;
}

#[tokio::test]
async fn snapshot_not_visible_until_end_applied() {
    let pair = Pair::with(
        config(&["orders"]),
        Arc::new(MemoryLog::new()),
        Arc::new(MemoryLog::new()),
        FaultySender::wrap(DropMode::Always(MessageKind::SnapshotEnd)),
        Arc::new(log_replication_engine::AutoDataControl::new()),
    );
    put(pair.sink_log.as_ref(), "orders", "old", "1").await;
    put_many(pair.source_log.as_ref(), "orders", "new", 5).await;

    pair.source.start_snapshot_sync().unwrap();
    wait_until(&pair.observers.errors, "snapshot end to fail", |n| *n >= 1).await;

    // Data reached the shadow stream, the live stream is untouched.
    let live = state(pair.sink_log.as_ref(), "orders").await;
    assert_eq!(live.len(), 1);
    assert!(live.contains_key("old"));
    let shadow = log_replication_engine::log::stream_state(
        pair.sink_log.as_ref(),
        StreamId::shadow_of("orders"),
    )
    .await
    .unwrap();
    assert_eq!(shadow.len(), 5);
    pair.source.shutdown().await;
}

#[tokio::test]
async fn snapshot_becomes_visible_all_at_once() {
    let mut cfg = config(&["orders"]);
    cfg.settings.snapshot.max_msg_size = 100;
    cfg.settings.snapshot.max_num_msg_per_batch = 1;
    let pair = Pair::new(cfg);
    put(pair.sink_log.as_ref(), "orders", "old", "1").await;
    put_many(pair.source_log.as_ref(), "orders", "o", 30).await;
    let old = state(pair.sink_log.as_ref(), "orders").await;
    let new = state(pair.source_log.as_ref(), "orders").await;

    let done = Arc::new(AtomicBool::new(false));
    let watcher = tokio::spawn({
        let sink_log = pair.sink_log.clone();
        let done = done.clone();
        async move {
            let mut seen = Vec::new();
            while !done.load(Ordering::SeqCst) {
                seen.push(state(sink_log.as_ref(), "orders").await);
                tokio::task::yield_now().await;
            }
            seen
        }
    });

    pair.source.start_snapshot_sync().unwrap();
    wait_caught_up(&pair.observers).await;
    done.store(true, Ordering::SeqCst);
    let seen = watcher.await.unwrap();

    assert!(seen.contains(&old));
    for observed in &seen {
        assert!(*observed == old || *observed == new, "partial snapshot visible: {} keys", observed.len());
    }
    assert_eq!(state(pair.sink_log.as_ref(), "orders").await, new);
    pair.source.shutdown().await;
}

#[tokio::test]
async fn snapshot_reader_survives_trim_after_load() {
    use log_replication_engine::reader::{SnapshotReader, StreamsSnapshotReader};

    let log: Arc<dyn SharedLog> = Arc::new(MemoryLog::new());
    put_many(log.as_ref(), "orders", "o", 30).await;
    put_many(log.as_ref(), "users", "u", 30).await;
    let base = log.log_tail().await.unwrap();
    let expected_orders = state(log.as_ref(), "orders").await;
    let expected_users = state(log.as_ref(), "users").await;

    let mut cfg = config(&["orders", "users"]);
    cfg.settings.snapshot.max_msg_size = 100;
    cfg.settings.snapshot.max_num_msg_per_batch = 2;
    let mut reader = StreamsSnapshotReader::new(log.clone(), &cfg);
    reader.reset(base);

    let id = uuid::Uuid::new_v4();
    let first = reader.read(id).await.unwrap();
    assert!(!first.end_of_sync);
    log.prefix_trim(base).await.unwrap();

    // Both streams were loaded before the trim; the rest of the transfer is unaffected.
    let mut messages = first.messages;
    loop {
        let batch = reader.read(id).await.unwrap();
        messages.extend(batch.messages);
        if batch.end_of_sync {
            break;
        }
    }
    assert_eq!(messages.len() as i64, reader.messages_produced());

    let mut orders = log_replication_engine::log::StreamState::new();
    let mut users = log_replication_engine::log::StreamState::new();
    for message in &messages {
        let entry = message.entry().unwrap();
        for (stream, updates) in &entry.entries {
            let target = if *stream == StreamId::from_name("orders") { &mut orders } else { &mut users };
            for update in updates {
                update.apply_to(target);
            }
        }
    }
    assert_eq!(orders, expected_orders);
    assert_eq!(users, expected_users);

    // A fresh reader has no checkpoint to start from.
    let mut late = StreamsSnapshotReader::new(log.clone(), &cfg);
    late.reset(base);
    let err = late.read(id).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::TrimInduced);
}

// =============================================================================
// Cross-table transactions
// =============================================================================

#[tokio::test]
async fn log_entry_transaction_across_replicated_streams() {
    let pair = Pair::new(config(&["orders", "customers"]));
    put_across(pair.source_log.as_ref(), &["orders", "customers"], "k1", "v1").await;
    put_across(pair.source_log.as_ref(), &["orders", "customers"], "k2", "v2").await;

    pair.source.start_log_entry_sync().await.unwrap();
    wait_caught_up(&pair.observers).await;

    pair.assert_in_sync(&["orders", "customers"]).await;
    assert_eq!(*pair.observers.log_entry_acks.borrow(), 2);
    pair.source.shutdown().await;
}

#[tokio::test]
async fn log_entry_transaction_crossing_non_replicated_stream_stops() {
    let pair = Pair::new(config(&["orders"]));
    put(pair.source_log.as_ref(), "orders", "k1", "v1").await;
    put_across(pair.source_log.as_ref(), &["orders", "audit"], "k2", "v2").await;

    pair.source.start_log_entry_sync().await.unwrap();
    wait_state(&pair.observers, ReplicationState::Stopped).await;
    assert_eq!(*pair.observers.last_error_class.borrow(), Some(ErrorClass::ProtocolViolation));
    assert_eq!(*pair.observers.data_control_calls.borrow(), 0);
}

#[tokio::test]
async fn snapshot_crossing_non_replicated_stream_stops() {
    let pair = Pair::new(config(&["orders"]));
    put_across(pair.source_log.as_ref(), &["orders", "audit"], "k", "v").await;

    pair.source.start_snapshot_sync().unwrap();
    wait_state(&pair.observers, ReplicationState::Stopped).await;
    assert_eq!(*pair.observers.last_error_class.borrow(), Some(ErrorClass::ProtocolViolation));
    assert!(state(pair.sink_log.as_ref(), "orders").await.is_empty());
}

#[tokio::test]
async fn log_entry_skips_non_replicated_entries() {
    let pair = Pair::new(config(&["orders"]));
    put(pair.source_log.as_ref(), "orders", "a", "1").await;
    put(pair.source_log.as_ref(), "audit", "noise", "x").await;
    put(pair.source_log.as_ref(), "orders", "b", "2").await;

    pair.source.start_log_entry_sync().await.unwrap();
    wait_caught_up(&pair.observers).await;

    pair.assert_in_sync(&["orders"]).await;
    assert!(state(pair.sink_log.as_ref(), "audit").await.is_empty());
    assert_eq!(*pair.observers.log_entry_acks.borrow(), 2);
    pair.source.shutdown().await;
}

#[tokio::test]
async fn log_entry_progress_writes_are_coalesced() {
    let mut cfg = config(&["orders"]);
    cfg.settings.log_entry.poll_interval = "200ms".to_string();
    cfg.settings.log_entry.progress_flush_interval = "10s".to_string();
    let pair = Pair::new(cfg);

    pair.source.start_log_entry_sync().await.unwrap();
    wait_caught_up(&pair.observers).await;
    let before = pair.source_log.log_tail().await.unwrap();
    let last = put_many(pair.source_log.as_ref(), "orders", "o", 40).await;
    wait_until(&pair.observers.log_entry_acks, "forty log entry acks", |n| *n >= 40).await;

    // Progress reaches the last ack once the tailer goes idle.
    let deadline = tokio::time::Instant::now() + WAIT;
    while pair.source.reader_metadata().await.unwrap().last_log_entry_sync != last {
        assert!(tokio::time::Instant::now() < deadline, "progress never reached {last}");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let progress_writes = pair.source_log.log_tail().await.unwrap() - before - 40;
    assert!(progress_writes < 10, "{progress_writes} progress writes for 40 acks");
    pair.assert_in_sync(&["orders"]).await;
    pair.source.shutdown().await;
}

// =============================================================================
// Loss and retransmission
// =============================================================================

#[tokio::test]
async fn snapshot_message_lost_once_is_retransmitted() {
    let pair = Pair::with(
        config(&["orders"]),
        Arc::new(MemoryLog::new()),
        Arc::new(MemoryLog::new()),
        FaultySender::wrap(DropMode::FirstN { kind: MessageKind::Snapshot, count: 1 }),
        Arc::new(log_replication_engine::AutoDataControl::new()),
    );
    put_many(pair.source_log.as_ref(), "orders", "o", 8).await;

    pair.source.start_snapshot_sync().unwrap();
    wait_caught_up(&pair.observers).await;

    pair.assert_in_sync(&["orders"]).await;
    assert_eq!(*pair.observers.errors.borrow(), 0);
    assert_eq!(*pair.observers.snapshot_syncs.borrow(), 1);
    pair.source.shutdown().await;
}

#[tokio::test]
async fn log_entry_lost_once_is_retransmitted() {
    let pair = Pair::with(
        config(&["orders"]),
        Arc::new(MemoryLog::new()),
        Arc::new(MemoryLog::new()),
        FaultySender::wrap(DropMode::FirstN { kind: MessageKind::LogEntry, count: 1 }),
        Arc::new(log_replication_engine::AutoDataControl::new()),
    );
    put_many(pair.source_log.as_ref(), "orders", "o", 5).await;

    pair.source.start_log_entry_sync().await.unwrap();
    wait_caught_up(&pair.observers).await;

    pair.assert_in_sync(&["orders"]).await;
    assert_eq!(*pair.observers.log_entry_acks.borrow(), 5);
    assert_eq!(*pair.observers.errors.borrow(), 0);
    pair.source.shutdown().await;
}

#[tokio::test]
async fn log_entry_always_lost_requires_snapshot() {
    let pair = Pair::with(
        config(&["orders"]),
        Arc::new(MemoryLog::new()),
        Arc::new(MemoryLog::new()),
        FaultySender::wrap(DropMode::Always(MessageKind::LogEntry)),
        Arc::new(DropNDataControl::new(usize::MAX)),
    );
    put(pair.source_log.as_ref(), "orders", "a", "1").await;

    pair.source.start_log_entry_sync().await.unwrap();
    wait_state(&pair.observers, ReplicationState::InRequireSnapshotSync).await;
    assert_eq!(*pair.observers.last_error_class.borrow(), Some(ErrorClass::Transient));
    assert_eq!(*pair.observers.log_entry_acks.borrow(), 0);
    pair.source.shutdown().await;
}

// =============================================================================
// Resync
// =============================================================================

#[tokio::test]
async fn resync_after_cancel() {
    use ReplicationState::*;

    let pair = Pair::new(config(&["orders", "users"]));
    put_many(pair.source_log.as_ref(), "orders", "o", 3).await;
    put_many(pair.source_log.as_ref(), "users", "u", 3).await;

    pair.source.start_log_entry_sync().await.unwrap();
    wait_caught_up(&pair.observers).await;
    assert_eq!(*pair.observers.snapshot_syncs.borrow(), 0);

    let mut transitions = pair.observers.transitions();
    pair.source.cancel_sync();
    let steps = next_transitions(&mut transitions, 3).await;
    assert_eq!(
        steps,
        vec![
            (InLogEntrySync, InRequireSnapshotSync),
            (InRequireSnapshotSync, InSnapshotSync),
            (InSnapshotSync, InLogEntrySync),
        ]
    );
    wait_caught_up(&pair.observers).await;

    pair.assert_in_sync(&["orders", "users"]).await;
    assert_eq!(*pair.observers.snapshot_syncs.borrow(), 1);
    assert!(*pair.observers.data_control_calls.borrow() >= 1);
    pair.source.shutdown().await;
}

#[tokio::test]
async fn resync_reschedules_dropped_data_control_requests() {
    let data_control = Arc::new(DropNDataControl::new(2));
    let pair = Pair::with(
        config(&["orders"]),
        Arc::new(MemoryLog::new()),
        Arc::new(MemoryLog::new()),
        |sender| sender,
        data_control.clone(),
    );
    put_many(pair.source_log.as_ref(), "orders", "o", 2).await;

    pair.source.start_replication().await.unwrap();
    wait_caught_up(&pair.observers).await;
    pair.source.cancel_sync();

    wait_until(&pair.observers.snapshot_syncs, "resync after two drops", |n| *n == 2).await;
    wait_caught_up(&pair.observers).await;
    assert_eq!(data_control.calls(), 3);
    assert_eq!(*pair.observers.data_control_calls.borrow(), 3);
    assert_eq!(*pair.observers.reschedules.borrow(), 2);
    assert_eq!(data_control.outstanding(), 0);
    pair.source.shutdown().await;
}

#[tokio::test]
async fn resync_keeps_requesting_without_piling_up_requests() {
    let data_control = Arc::new(DropNDataControl::new(usize::MAX));
    let pair = Pair::with(
        config(&["orders"]),
        Arc::new(MemoryLog::new()),
        Arc::new(MemoryLog::new()),
        |sender| sender,
        data_control.clone(),
    );
    put_many(pair.source_log.as_ref(), "orders", "o", 2).await;
    pair.source.start_replication().await.unwrap();
    wait_caught_up(&pair.observers).await;
    pair.source.cancel_sync();

    wait_until(&pair.observers.reschedules, "ten reschedules", |n| *n >= 10).await;
    assert_eq!(pair.source.state(), ReplicationState::InRequireSnapshotSync);
    assert!(data_control.calls() >= 11);
    // Each reschedule replaces the lost request instead of adding to it.
    assert!(data_control.outstanding() <= 2, "outstanding {}", data_control.outstanding());
    pair.source.shutdown().await;
}

#[tokio::test]
async fn resync_when_log_trimmed_before_start() {
    let pair = Pair::with(
        config(&["orders"]),
        Arc::new(MemoryLog::new()),
        Arc::new(MemoryLog::new()),
        |sender| sender,
        Arc::new(DropNDataControl::new(usize::MAX)),
    );
    put_many(pair.source_log.as_ref(), "orders", "o", 4).await;
    pair.source_log.prefix_trim(2).await.unwrap();

    pair.source.start_snapshot_sync().unwrap();
    wait_state(&pair.observers, ReplicationState::InRequireSnapshotSync).await;
    assert_eq!(*pair.observers.last_error_class.borrow(), Some(ErrorClass::TrimInduced));
    wait_until(&pair.observers.data_control_calls, "a resync request", |n| *n >= 1).await;
    pair.source.shutdown().await;
}

#[tokio::test]
async fn resync_when_log_entry_position_trimmed() {
    let pair = Pair::new(config(&["orders"]));
    put_many(pair.source_log.as_ref(), "orders", "o", 4).await;
    let streams = [StreamId::from_name("orders")];
    let at = checkpoint(pair.source_log.as_ref(), &streams).await.unwrap();
    pair.source_log.prefix_trim(at).await.unwrap();

    pair.source.start_log_entry_sync().await.unwrap();
    wait_until(&pair.observers.snapshot_syncs, "snapshot after trim", |n| *n == 1).await;
    wait_caught_up(&pair.observers).await;

    assert_eq!(*pair.observers.last_error_class.borrow(), Some(ErrorClass::TrimInduced));
    pair.assert_in_sync(&["orders"]).await;
    assert_eq!(state(pair.sink_log.as_ref(), "orders").await.len(), 4);
    pair.source.shutdown().await;
}

#[tokio::test]
async fn resync_on_topology_change() {
    let pair = Pair::new(config(&["orders"]));
    put_many(pair.source_log.as_ref(), "orders", "o", 2).await;
    pair.source.start_replication().await.unwrap();
    wait_caught_up(&pair.observers).await;

    pair.sink.on_topology_change(1);
    pair.source.on_topology_change(1);
    wait_until(&pair.observers.snapshot_syncs, "snapshot in new epoch", |n| *n == 2).await;
    wait_caught_up(&pair.observers).await;

    put(pair.source_log.as_ref(), "orders", "after", "x").await;
    wait_for_keys(pair.sink_log.as_ref(), "orders", 3).await;
    pair.source.shutdown().await;
}

#[tokio::test]
async fn stop_returns_to_initialized_and_resumes() {
    let pair = Pair::new(config(&["orders"]));
    put_many(pair.source_log.as_ref(), "orders", "o", 3).await;
    pair.source.start_replication().await.unwrap();
    wait_caught_up(&pair.observers).await;

    pair.source.stop();
    wait_state(&pair.observers, ReplicationState::Initialized).await;
    put_many(pair.source_log.as_ref(), "orders", "p", 2).await;

    // A completed snapshot is on record, so replication resumes without one.
    pair.source.start_replication().await.unwrap();
    wait_for_keys(pair.sink_log.as_ref(), "orders", 5).await;
    assert_eq!(*pair.observers.snapshot_syncs.borrow(), 1);
    pair.source.shutdown().await;
}

// =============================================================================
// Config
// =============================================================================

#[tokio::test]
async fn config_empty_replication_set_rejected() {
    let mut cfg = config(&["orders"]);
    cfg.streams_to_replicate = BTreeSet::new();
    let pair = Pair::new(cfg);

    assert!(matches!(pair.source.start_snapshot_sync(), Err(ReplicationError::EmptyReplicationSet)));
    assert!(matches!(
        pair.source.start_log_entry_sync().await,
        Err(ReplicationError::EmptyReplicationSet)
    ));
    assert!(matches!(
        pair.source.start_replication().await,
        Err(ReplicationError::EmptyReplicationSet)
    ));
    assert_eq!(pair.source.state(), ReplicationState::Initialized);
    assert!(pair.source_log.log_tail().await.unwrap() < 0);
    pair.source.shutdown().await;
}
