// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source-side readers.
//!
//! Readers turn the shared log into replication messages. They do no I/O
//! besides log reads and never send anything; the sync workers drive them
//! and hand the messages to the transport.
//!
//! - [`StreamsSnapshotReader`]: full state of every replicated stream as of
//!   a pinned address, split into size-bounded SNAPSHOT messages.
//! - [`StreamsLogEntryReader`]: one LOG_ENTRY message per log entry that
//!   touches the replicated streams, strictly after the last acked address.

mod log_entry;
mod snapshot;

pub use log_entry::StreamsLogEntryReader;
pub use snapshot::StreamsSnapshotReader;

use crate::error::{ReplicationError, Result};
use crate::log::{BoxFuture, LogAddress, LogEntry, StreamId};
use crate::message::ReplicationMessage;
use std::collections::BTreeMap;
use uuid::Uuid;

/// One cycle of snapshot messages.
#[derive(Debug, Clone, Default)]
pub struct SnapshotReadBatch {
    pub messages: Vec<ReplicationMessage>,
    /// No data message is left after this batch.
    pub end_of_sync: bool,
}

/// Produces the messages of a snapshot sync.
pub trait SnapshotReader: Send {
    /// Pin the point-in-time view and restart at sequence number 0.
    fn reset(&mut self, base_snapshot_timestamp: LogAddress);

    /// Next batch of at most `max_num_msg_per_batch` messages.
    fn read(&mut self, sync_request_id: Uuid) -> BoxFuture<'_, SnapshotReadBatch>;

    /// Topology epoch stamped on produced messages.
    fn set_topology_config_id(&mut self, site_config_id: i64);
}

/// Produces the messages of a log-entry sync.
pub trait LogEntryReader: Send {
    /// Resume after `last_acked_timestamp`, for a destination holding the
    /// snapshot taken at `last_sent_snapshot_timestamp`.
    fn reset(&mut self, last_sent_snapshot_timestamp: LogAddress, last_acked_timestamp: LogAddress);

    /// Next message, or `None` when the log has nothing new.
    ///
    /// Fails with [`ReplicationError::TrimmedLog`] when the next address to
    /// read was trimmed, which is distinct from an empty poll.
    fn read(&mut self, sync_request_id: Uuid) -> BoxFuture<'_, Option<ReplicationMessage>>;

    /// Whether entries touching only non-replicated streams were skipped.
    fn has_noise_data(&self) -> bool;

    fn set_topology_config_id(&mut self, site_config_id: i64);
}

/// Replicated stream names and their ids.
#[derive(Debug, Clone)]
pub(crate) struct StreamSet {
    by_id: BTreeMap<StreamId, String>,
}

impl StreamSet {
    pub(crate) fn new<'a>(names: impl IntoIterator<Item = &'a String>) -> Self {
        Self {
            by_id: names
                .into_iter()
                .map(|name| (StreamId::from_name(name), name.clone()))
                .collect(),
        }
    }

    /// `(name, id)` pairs ordered by name.
    pub(crate) fn ordered(&self) -> Vec<(String, StreamId)> {
        let mut streams: Vec<_> = self.by_id.iter().map(|(id, name)| (name.clone(), *id)).collect();
        streams.sort();
        streams
    }

    pub(crate) fn contains(&self, id: &StreamId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Reject an entry that mixes replicated and non-replicated streams.
    ///
    /// Returns whether the entry touches any replicated stream.
    pub(crate) fn check_crossing(&self, entry: &LogEntry) -> Result<bool> {
        let (replicated, foreign): (Vec<&StreamId>, Vec<&StreamId>) =
            entry.streams().partition(|id| self.contains(id));
        if !replicated.is_empty() && !foreign.is_empty() {
            return Err(ReplicationError::InvalidTableCrossing {
                address: entry.address,
                replicated: replicated
                    .iter()
                    .filter_map(|id| self.by_id.get(id).cloned())
                    .collect(),
                foreign: foreign.iter().map(|id| id.to_string()).collect(),
            });
        }
        Ok(!replicated.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{EntryKind, StreamUpdate};

    fn entry(streams: &[&str]) -> LogEntry {
        LogEntry {
            address: 3,
            kind: EntryKind::Data,
            updates: streams
                .iter()
                .map(|s| (StreamId::from_name(s), vec![StreamUpdate::put("k", "v")]))
                .collect(),
        }
    }

    #[test]
    fn test_crossing_detection() {
        let names = vec!["orders".to_string(), "customers".to_string()];
        let set = StreamSet::new(&names);

        assert!(set.check_crossing(&entry(&["orders", "customers"])).unwrap());
        assert!(!set.check_crossing(&entry(&["audit"])).unwrap());
        assert!(!set.check_crossing(&entry(&[])).unwrap());

        let err = set.check_crossing(&entry(&["orders", "audit"])).unwrap_err();
        match err {
            ReplicationError::InvalidTableCrossing { address, replicated, foreign } => {
                assert_eq!(address, 3);
                assert_eq!(replicated, vec!["orders".to_string()]);
                assert_eq!(foreign.len(), 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_ordered_by_name() {
        let names = vec!["b".to_string(), "a".to_string(), "c".to_string()];
        let set = StreamSet::new(&names);
        let ordered: Vec<_> = set.ordered().into_iter().map(|(name, _)| name).collect();
        assert_eq!(ordered, vec!["a", "b", "c"]);
    }
}
