// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Point-in-time snapshot reader.

use super::{SnapshotReadBatch, SnapshotReader, StreamSet};
use crate::config::ReplicationConfig;
use crate::error::Result;
use crate::log::{materialize, read_stream_history, BoxFuture, LogAddress, SharedLog, StreamId, StreamUpdate, NON_ADDRESS};
use crate::message::{OpaqueEntry, ReplicationMessage};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Updates of the stream currently being sent.
struct StreamCursor {
    name: String,
    id: StreamId,
    pending: VecDeque<StreamUpdate>,
}

/// Reads the full state of the replicated streams as of a pinned address.
///
/// The first `read` after `reset` materializes every replicated stream at
/// the pinned base and keeps the result in memory, so a prefix trim during
/// the transfer cannot fail the session. Streams are emitted in name order.
/// Each message carries updates of exactly one stream, bounded by
/// `max_data_size_per_msg`.
pub struct StreamsSnapshotReader {
    log: Arc<dyn SharedLog>,
    streams: StreamSet,
    ordered: Vec<(String, StreamId)>,
    max_num_msg_per_batch: usize,
    max_data_size_per_msg: usize,
    site_config_id: i64,
    base: LogAddress,
    /// `None` until the streams are loaded for the current base.
    loaded: Option<VecDeque<StreamCursor>>,
    sequence: i64,
}

impl StreamsSnapshotReader {
    pub fn new(log: Arc<dyn SharedLog>, config: &ReplicationConfig) -> Self {
        let streams = StreamSet::new(&config.streams_to_replicate);
        let ordered = streams.ordered();
        Self {
            log,
            streams,
            ordered,
            max_num_msg_per_batch: config.settings.snapshot.max_num_msg_per_batch.max(1),
            max_data_size_per_msg: config.settings.snapshot.max_data_size_per_msg().max(1),
            site_config_id: 0,
            base: NON_ADDRESS,
            loaded: None,
            sequence: 0,
        }
    }

    /// Messages produced since the last reset.
    pub fn messages_produced(&self) -> i64 {
        self.sequence
    }

    /// Materialize every replicated stream at the base.
    async fn load_streams(&self) -> Result<VecDeque<StreamCursor>> {
        let mut cursors = VecDeque::new();
        for (name, id) in &self.ordered {
            let history = read_stream_history(self.log.as_ref(), *id, self.base).await?;
            for entry in history.iter().filter(|e| !e.is_checkpoint()) {
                self.streams.check_crossing(entry)?;
            }
            let state = materialize(id, &history);
            if state.is_empty() {
                debug!(stream = %name, base = self.base, "Stream has no data at snapshot base");
                continue;
            }

            debug!(stream = %name, keys = state.len(), base = self.base, "Loaded stream for snapshot");
            cursors.push_back(StreamCursor {
                name: name.clone(),
                id: *id,
                pending: state
                    .into_iter()
                    .map(|(key, value)| StreamUpdate::Put { key, value })
                    .collect(),
            });
        }
        Ok(cursors)
    }

    /// Cut the next message from the front stream.
    fn next_message(&mut self, sync_request_id: Uuid) -> Result<Option<ReplicationMessage>> {
        let Some(cursors) = self.loaded.as_mut() else {
            return Ok(None);
        };
        let Some(cursor) = cursors.front_mut() else {
            return Ok(None);
        };

        let mut updates = Vec::new();
        let mut size = 0;
        while let Some(update) = cursor.pending.front() {
            let update_size = update.size_hint();
            // A single oversized update still goes out alone.
            if !updates.is_empty() && size + update_size > self.max_data_size_per_msg {
                break;
            }
            size += update_size;
            if let Some(update) = cursor.pending.pop_front() {
                updates.push(update);
            }
        }

        let mut entry = OpaqueEntry::new(self.base);
        entry.entries.insert(cursor.id, updates);
        trace!(stream = %cursor.name, seq = self.sequence, bytes = size, "Built snapshot message");
        if cursor.pending.is_empty() {
            cursors.pop_front();
        }

        let message = ReplicationMessage::snapshot(
            sync_request_id,
            self.site_config_id,
            self.base,
            self.sequence,
            entry.encode()?,
        );
        self.sequence += 1;
        Ok(Some(message))
    }
}

impl SnapshotReader for StreamsSnapshotReader {
    fn reset(&mut self, base_snapshot_timestamp: LogAddress) {
        self.base = base_snapshot_timestamp;
        self.loaded = None;
        self.sequence = 0;
    }

    fn read(&mut self, sync_request_id: Uuid) -> BoxFuture<'_, SnapshotReadBatch> {
        Box::pin(async move {
            if self.loaded.is_none() {
                self.loaded = Some(self.load_streams().await?);
            }
            let mut messages = Vec::new();
            while messages.len() < self.max_num_msg_per_batch {
                match self.next_message(sync_request_id)? {
                    Some(message) => messages.push(message),
                    None => break,
                }
            }
            Ok(SnapshotReadBatch {
                messages,
                end_of_sync: self.loaded.as_ref().is_some_and(VecDeque::is_empty),
            })
        })
    }

    fn set_topology_config_id(&mut self, site_config_id: i64) {
        self.site_config_id = site_config_id;
    }
}
