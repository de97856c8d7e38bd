// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Incremental log-entry reader.

use super::{LogEntryReader, StreamSet};
use crate::config::ReplicationConfig;
use crate::log::{BoxFuture, LogAddress, LogEntry, SharedLog, NON_ADDRESS};
use crate::message::{OpaqueEntry, ReplicationMessage};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Reads the log forward from the last acknowledged address.
///
/// Entries are fetched `read_batch_size` addresses at a time. Checkpoints
/// and metadata-only entries are skipped silently; entries that touch only
/// non-replicated streams are skipped and flagged as noise.
pub struct StreamsLogEntryReader {
    log: Arc<dyn SharedLog>,
    streams: StreamSet,
    read_batch_size: i64,
    site_config_id: i64,
    base_snapshot: LogAddress,
    /// Highest address fetched from the log.
    scanned: LogAddress,
    /// Address of the last entry turned into a message.
    last_sent: LogAddress,
    sequence: i64,
    buffered: VecDeque<LogEntry>,
    noise: bool,
}

impl StreamsLogEntryReader {
    pub fn new(log: Arc<dyn SharedLog>, config: &ReplicationConfig) -> Self {
        Self {
            log,
            streams: StreamSet::new(&config.streams_to_replicate),
            read_batch_size: config.settings.log_entry.read_batch_size.max(1) as i64,
            site_config_id: 0,
            base_snapshot: NON_ADDRESS,
            scanned: NON_ADDRESS,
            last_sent: NON_ADDRESS,
            sequence: 0,
            buffered: VecDeque::new(),
            noise: false,
        }
    }

    pub fn last_sent(&self) -> LogAddress {
        self.last_sent
    }

    /// Fetch the next range of addresses. Returns false when the log has nothing new.
    async fn fill(&mut self) -> crate::error::Result<bool> {
        let tail = self.log.log_tail().await?;
        if tail <= self.scanned {
            return Ok(false);
        }
        let from = self.scanned + 1;
        let to = tail.min(self.scanned + self.read_batch_size);
        let entries = self.log.read_range(from, to).await?;
        trace!(from, to, fetched = entries.len(), "Fetched log range");
        self.scanned = to;
        self.buffered.extend(entries);
        Ok(true)
    }
}

impl LogEntryReader for StreamsLogEntryReader {
    fn reset(&mut self, last_sent_snapshot_timestamp: LogAddress, last_acked_timestamp: LogAddress) {
        self.base_snapshot = last_sent_snapshot_timestamp;
        let start = last_acked_timestamp.max(last_sent_snapshot_timestamp);
        self.scanned = start;
        self.last_sent = start;
        self.sequence = 0;
        self.buffered.clear();
        self.noise = false;
        debug!(base = self.base_snapshot, start, "Log entry reader reset");
    }

    fn read(&mut self, sync_request_id: Uuid) -> BoxFuture<'_, Option<ReplicationMessage>> {
        Box::pin(async move {
            loop {
                let Some(entry) = self.buffered.pop_front() else {
                    if self.fill().await? {
                        continue;
                    }
                    return Ok(None);
                };

                if entry.is_checkpoint() || entry.updates.is_empty() {
                    continue;
                }
                if !self.streams.check_crossing(&entry)? {
                    trace!(address = entry.address, "Skipping entry with no replicated streams");
                    self.noise = true;
                    continue;
                }

                let address = entry.address;
                let payload = OpaqueEntry {
                    version: address,
                    entries: entry.updates,
                }
                .encode()?;
                let message = ReplicationMessage::log_entry(
                    sync_request_id,
                    self.site_config_id,
                    self.base_snapshot,
                    self.sequence,
                    address,
                    self.last_sent,
                    payload,
                );
                self.sequence += 1;
                self.last_sent = address;
                return Ok(Some(message));
            }
        })
    }

    fn has_noise_data(&self) -> bool {
        self.noise
    }

    fn set_topology_config_id(&mut self, site_config_id: i64) {
        self.site_config_id = site_config_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplicationError;
    use crate::log::{MemoryLog, StreamId, StreamUpdate, Transaction};
    use crate::message::MessageKind;

    async fn put(log: &MemoryLog, streams: &[&str], key: &str) -> LogAddress {
        let mut tx = Transaction::new();
        for stream in streams {
            tx.log_update(StreamId::from_name(stream), StreamUpdate::put(key, "v"));
        }
        log.append(tx).await.unwrap()
    }

    fn reader(log: Arc<MemoryLog>) -> StreamsLogEntryReader {
        StreamsLogEntryReader::new(log, &ReplicationConfig::for_testing("standby-1", &["a", "b"]))
    }

    #[tokio::test]
    async fn test_reads_after_last_acked_with_chained_timestamps() {
        let log = Arc::new(MemoryLog::new());
        let base = put(&log, &["a"], "k0").await;
        let a1 = put(&log, &["a", "b"], "k1").await;
        let a2 = put(&log, &["b"], "k2").await;

        let mut reader = reader(log.clone());
        reader.reset(base, NON_ADDRESS);
        let id = Uuid::new_v4();

        let first = reader.read(id).await.unwrap().unwrap();
        assert_eq!(first.kind, MessageKind::LogEntry);
        assert_eq!(first.sequence_number, 0);
        assert_eq!((first.previous_timestamp, first.timestamp), (base, a1));
        assert_eq!(first.snapshot_timestamp, base);

        let second = reader.read(id).await.unwrap().unwrap();
        assert_eq!(second.sequence_number, 1);
        assert_eq!((second.previous_timestamp, second.timestamp), (a1, a2));

        assert!(reader.read(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_noise_entries_are_skipped() {
        let log = Arc::new(MemoryLog::new());
        put(&log, &["audit"], "x").await;
        let wanted = put(&log, &["a"], "k").await;

        let mut reader = reader(log.clone());
        reader.reset(NON_ADDRESS, NON_ADDRESS);
        let message = reader.read(Uuid::new_v4()).await.unwrap().unwrap();
        assert_eq!(message.timestamp, wanted);
        assert_eq!(message.previous_timestamp, NON_ADDRESS);
        assert!(reader.has_noise_data());
    }

    #[tokio::test]
    async fn test_metadata_only_entries_are_not_noise() {
        let log = Arc::new(MemoryLog::new());
        let mut tx = Transaction::new();
        tx.put_metadata("READER-standby-1", "LAST_LOG_ENTRY_SYNC", 0);
        log.append(tx).await.unwrap();

        let mut reader = reader(log.clone());
        reader.reset(NON_ADDRESS, NON_ADDRESS);
        assert!(reader.read(Uuid::new_v4()).await.unwrap().is_none());
        assert!(!reader.has_noise_data());
    }

    #[tokio::test]
    async fn test_crossing_entry_fails() {
        let log = Arc::new(MemoryLog::new());
        put(&log, &["a", "audit"], "k").await;

        let mut reader = reader(log.clone());
        reader.reset(NON_ADDRESS, NON_ADDRESS);
        let err = reader.read(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidTableCrossing { .. }));
    }

    #[tokio::test]
    async fn test_trimmed_position_is_distinct_from_empty() {
        let log = Arc::new(MemoryLog::new());
        for i in 0..5 {
            put(&log, &["a"], &format!("k{i}")).await;
        }
        log.prefix_trim(3).await.unwrap();

        let mut reader = reader(log.clone());
        reader.reset(NON_ADDRESS, 0);
        let err = reader.read(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ReplicationError::TrimmedLog { .. }));

        reader.reset(NON_ADDRESS, 4);
        assert!(reader.read(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_small_read_batches_cover_the_log() {
        let log = Arc::new(MemoryLog::new());
        for i in 0..7 {
            put(&log, &["a"], &format!("k{i}")).await;
        }
        let mut config = ReplicationConfig::for_testing("standby-1", &["a"]);
        config.settings.log_entry.read_batch_size = 2;
        let mut reader = StreamsLogEntryReader::new(log.clone(), &config);
        reader.reset(NON_ADDRESS, NON_ADDRESS);

        let id = Uuid::new_v4();
        let mut count = 0;
        while reader.read(id).await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 7);
        assert_eq!(reader.last_sent(), 6);
    }
}
