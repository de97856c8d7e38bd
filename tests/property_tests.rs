//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use log_replication_engine::log::{materialize, stream_state, LogEntry, EntryKind, StreamState};
use log_replication_engine::message::OpaqueEntry;
use log_replication_engine::reader::{SnapshotReader, StreamsSnapshotReader};
use log_replication_engine::resilience::RetryConfig;
use log_replication_engine::writer::{LogEntryWriter, StreamsSnapshotWriter};
use log_replication_engine::{
    MemoryLog, ReplicationConfig, ReplicationMessage, SharedLog, StreamId, StreamUpdate, Transaction,
    NON_ADDRESS,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

fn orders() -> StreamId {
    StreamId::from_name("orders")
}

/// A chain of log-entry messages; entry `i` puts `k{key}` = `v{i}`.
fn chain(keys: &[u8]) -> Vec<ReplicationMessage> {
    let id = Uuid::new_v4();
    let mut previous = NON_ADDRESS;
    keys.iter()
        .enumerate()
        .map(|(i, key)| {
            let timestamp = (i as i64 + 1) * 3;
            let mut entry = OpaqueEntry::new(timestamp);
            entry
                .entries
                .insert(orders(), vec![StreamUpdate::put(format!("k{key}"), format!("v{i}"))]);
            let message = ReplicationMessage::log_entry(
                id,
                0,
                NON_ADDRESS,
                i as i64,
                timestamp,
                previous,
                entry.encode().unwrap(),
            );
            previous = timestamp;
            message
        })
        .collect()
}

/// Model: the final value of every key after applying the chain in order.
fn expected_state(keys: &[u8]) -> StreamState {
    keys.iter()
        .enumerate()
        .map(|(i, key)| (format!("k{key}"), format!("v{i}")))
        .collect()
}

fn writer(log: Arc<MemoryLog>, max_pending: usize) -> LogEntryWriter {
    let mut config = ReplicationConfig::for_testing("active", &["orders"]);
    config.settings.writer.max_pending_log_entries = max_pending;
    LogEntryWriter::new(log, &config)
}

// =============================================================================
// Log Entry Writer Properties
// =============================================================================

proptest! {
    /// Any delivery order converges to the in-order result
    #[test]
    fn log_entry_any_order_converges(
        keys in prop::collection::vec(0u8..8, 1..20),
        seed in any::<u64>(),
    ) {
        let messages = chain(&keys);
        let mut order: Vec<usize> = (0..messages.len()).collect();
        // Deterministic shuffle from the seed.
        let mut state = seed | 1;
        for i in (1..order.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            order.swap(i, (state % (i as u64 + 1)) as usize);
        }

        let (live, last) = block_on(async {
            let log = Arc::new(MemoryLog::new());
            let mut writer = writer(log.clone(), messages.len());
            let mut last = NON_ADDRESS;
            for index in &order {
                last = writer.apply(&messages[*index]).await.unwrap().1;
            }
            (stream_state(log.as_ref(), orders()).await.unwrap(), last)
        });

        prop_assert_eq!(live, expected_state(&keys));
        prop_assert_eq!(last, messages.last().unwrap().timestamp);
    }

    /// Redelivering already-applied messages changes nothing
    #[test]
    fn log_entry_redelivery_is_idempotent(
        keys in prop::collection::vec(0u8..8, 1..15),
        repeats in prop::collection::vec(any::<prop::sample::Index>(), 0..15),
    ) {
        let messages = chain(&keys);
        let (live, tail_before, tail_after) = block_on(async {
            let log = Arc::new(MemoryLog::new());
            let mut writer = writer(log.clone(), 4);
            for message in &messages {
                writer.apply(message).await.unwrap();
            }
            let tail_before = log.log_tail().await.unwrap();
            for index in &repeats {
                let message = &messages[index.index(messages.len())];
                writer.apply(message).await.unwrap();
            }
            let tail_after = log.log_tail().await.unwrap();
            (stream_state(log.as_ref(), orders()).await.unwrap(), tail_before, tail_after)
        });

        prop_assert_eq!(live, expected_state(&keys));
        prop_assert_eq!(tail_before, tail_after);
    }
}

// =============================================================================
// Snapshot Writer Properties
// =============================================================================

proptest! {
    /// Only the next sequence number is accepted; anything else leaves state unchanged
    #[test]
    fn snapshot_writer_accepts_only_next_sequence(
        seqs in prop::collection::vec(0i64..12, 1..30),
    ) {
        let (results, recv_seq, shadow) = block_on(async {
            let log = Arc::new(MemoryLog::new());
            let config = ReplicationConfig::for_testing("active", &["orders"]);
            let mut writer = StreamsSnapshotWriter::new(log.clone(), &config);
            writer.reset(0, 100).await.unwrap();

            let id = Uuid::new_v4();
            let mut results = Vec::new();
            for seq in &seqs {
                let mut entry = OpaqueEntry::new(100);
                entry
                    .entries
                    .insert(orders(), vec![StreamUpdate::put(format!("seq-{seq}"), "v")]);
                let message = ReplicationMessage::snapshot(id, 0, 100, *seq, entry.encode().unwrap());
                results.push(writer.apply(&message).await.is_ok());
            }
            let shadow = stream_state(log.as_ref(), StreamId::shadow_of("orders")).await.unwrap();
            (results, writer.recv_seq(), shadow)
        });

        let mut expected = 0i64;
        let mut model = StreamState::new();
        for (seq, accepted) in seqs.iter().zip(&results) {
            prop_assert_eq!(*accepted, *seq == expected);
            if *accepted {
                model.insert(format!("seq-{seq}"), "v".to_string());
                expected += 1;
            }
        }
        prop_assert_eq!(recv_seq, expected);
        prop_assert_eq!(shadow, model);
    }
}

// =============================================================================
// Snapshot Reader Properties
// =============================================================================

proptest! {
    /// Chunked snapshot messages are densely numbered and rebuild the stream
    #[test]
    fn snapshot_chunks_cover_state(
        key_count in 0usize..60,
        max_msg_size in 100usize..2000,
        batch in 1usize..5,
    ) {
        let (state, messages, ends) = block_on(async {
            let log = Arc::new(MemoryLog::new());
            for i in 0..key_count {
                let mut tx = Transaction::new();
                tx.log_update(orders(), StreamUpdate::put(format!("key-{i}"), format!("value-{i}")));
                log.append(tx).await.unwrap();
            }
            let base = log.log_tail().await.unwrap();

            let mut config = ReplicationConfig::for_testing("standby", &["orders"]);
            config.settings.snapshot.max_msg_size = max_msg_size;
            config.settings.snapshot.max_num_msg_per_batch = batch;
            let mut reader = StreamsSnapshotReader::new(log.clone(), &config);
            reader.reset(base);

            let id = Uuid::new_v4();
            let mut messages = Vec::new();
            let mut ends = 0;
            loop {
                let read = reader.read(id).await.unwrap();
                prop_assert!(read.messages.len() <= batch);
                messages.extend(read.messages);
                if read.end_of_sync {
                    ends += 1;
                    break;
                }
            }
            let state = stream_state(log.as_ref(), orders()).await.unwrap();
            Ok((state, messages, ends))
        })?;

        prop_assert_eq!(ends, 1);
        let mut rebuilt = StreamState::new();
        for (seq, message) in messages.iter().enumerate() {
            prop_assert_eq!(message.sequence_number, seq as i64);
            let entry = message.entry().unwrap();
            prop_assert!(entry.update_count() >= 1);
            for update in entry.entries.get(&orders()).into_iter().flatten() {
                update.apply_to(&mut rebuilt);
            }
        }
        prop_assert_eq!(rebuilt, state);
    }
}

// =============================================================================
// Materialization Properties
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Put(u8, u8),
    Delete(u8),
    Clear,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0u8..10, any::<u8>()).prop_map(|(k, v)| Op::Put(k, v)),
        3 => (0u8..10).prop_map(Op::Delete),
        1 => Just(Op::Clear),
    ]
}

proptest! {
    /// Folding log entries matches a plain map model
    #[test]
    fn materialize_matches_model(ops in prop::collection::vec(op(), 0..60)) {
        let mut model: BTreeMap<String, String> = BTreeMap::new();
        let mut entries = Vec::new();
        for (address, op) in ops.iter().enumerate() {
            let update = match op {
                Op::Put(k, v) => {
                    model.insert(format!("k{k}"), v.to_string());
                    StreamUpdate::put(format!("k{k}"), v.to_string())
                }
                Op::Delete(k) => {
                    model.remove(&format!("k{k}"));
                    StreamUpdate::delete(format!("k{k}"))
                }
                Op::Clear => {
                    model.clear();
                    StreamUpdate::Clear
                }
            };
            let mut updates = BTreeMap::new();
            updates.insert(orders(), vec![update]);
            entries.push(LogEntry {
                address: address as i64,
                kind: EntryKind::Data,
                updates,
            });
        }
        prop_assert_eq!(materialize(&orders(), &entries), model);
    }
}

// =============================================================================
// Backoff Properties
// =============================================================================

proptest! {
    /// Delays never decrease and never exceed the cap
    #[test]
    fn reschedule_delay_bounded_and_monotonic(
        initial_ms in 1u64..1000,
        max_ms in 1000u64..60_000,
        factor in 1.0f64..4.0,
        attempts in 1usize..200,
    ) {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_factor: factor,
        };
        let mut previous = Duration::ZERO;
        for attempt in 1..=attempts {
            let delay = config.delay_for_attempt(attempt);
            prop_assert!(delay <= config.max_delay);
            prop_assert!(delay >= previous);
            previous = delay;
        }
    }
}
