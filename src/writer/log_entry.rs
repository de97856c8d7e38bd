// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Incremental log-entry writer.

use super::{stage_updates, ApplyOutcome, ShadowMap};
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::log::{LogAddress, SharedLog, Transaction, NON_ADDRESS};
use crate::message::{MessageKind, ReplicationMessage};
use crate::metadata::{PersistedWriterMetadata, WriterMetadataField};
use crate::metrics;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Applies LOG_ENTRY messages to the live streams.
///
/// Each message names the address of the entry before it
/// (`previous_timestamp`). A message is applied only when that address is
/// the last one processed; anything further ahead waits in a bounded
/// reorder buffer keyed by `previous_timestamp`.
pub struct LogEntryWriter {
    log: Arc<dyn SharedLog>,
    metadata: PersistedWriterMetadata,
    remote: String,
    streams: ShadowMap,
    max_pending: usize,
    pending: BTreeMap<LogAddress, ReplicationMessage>,
}

impl LogEntryWriter {
    pub fn new(log: Arc<dyn SharedLog>, config: &ReplicationConfig) -> Self {
        Self {
            metadata: PersistedWriterMetadata::new(log.clone(), &config.remote_cluster_id),
            log,
            remote: config.remote_cluster_id.clone(),
            streams: ShadowMap::new(&config.streams_to_replicate),
            max_pending: config.settings.writer.max_pending_log_entries,
            pending: BTreeMap::new(),
        }
    }

    /// Out-of-order messages waiting for their predecessor.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop buffered messages of an abandoned session.
    pub fn reset(&mut self) {
        self.pending.clear();
        metrics::set_pending_log_entries(&self.remote, 0);
    }

    /// Apply or buffer one message. Returns the outcome and the last
    /// processed address afterwards.
    pub async fn apply(&mut self, message: &ReplicationMessage) -> Result<(ApplyOutcome, LogAddress)> {
        if message.kind != MessageKind::LogEntry {
            return Err(ReplicationError::OutOfOrderMessage {
                kind: message.kind,
                expected: NON_ADDRESS,
                received: message.sequence_number,
                site_config_id: message.site_config_id,
            });
        }

        let timestamp = self.metadata.timestamp().await?;
        let persisted = self.metadata.snapshot_at(timestamp).await?;
        if persisted.site_config_id != NON_ADDRESS && persisted.site_config_id != message.site_config_id {
            metrics::record_writer_rejection(&self.remote, "site_config_mismatch");
            return Err(ReplicationError::SiteConfigMismatch {
                expected: persisted.site_config_id,
                received: message.site_config_id,
            });
        }
        if message.snapshot_timestamp != persisted.last_snapshot_apply_done {
            metrics::record_writer_rejection(&self.remote, "base_snapshot_mismatch");
            return Err(ReplicationError::StaleMessage(format!(
                "log entry based on snapshot {} but {} is installed",
                message.snapshot_timestamp, persisted.last_snapshot_apply_done
            )));
        }

        let mut last_processed = persisted.last_log_entry_processed;
        if message.timestamp <= last_processed {
            debug!(remote = %self.remote, timestamp = message.timestamp, last_processed, "Duplicate log entry");
            metrics::record_writer_skip(&self.remote, "duplicate");
            return Ok((ApplyOutcome::Skipped, last_processed));
        }

        if message.previous_timestamp != last_processed {
            if message.previous_timestamp < last_processed {
                metrics::record_writer_rejection(&self.remote, "out_of_order");
                return Err(ReplicationError::OutOfOrderMessage {
                    kind: MessageKind::LogEntry,
                    expected: last_processed,
                    received: message.previous_timestamp,
                    site_config_id: message.site_config_id,
                });
            }
            if self.pending.len() >= self.max_pending && !self.pending.contains_key(&message.previous_timestamp) {
                warn!(remote = %self.remote, pending = self.pending.len(), "Reorder buffer full, dropping log entry");
                metrics::record_writer_rejection(&self.remote, "reorder_buffer_full");
                return Err(ReplicationError::OutOfOrderMessage {
                    kind: MessageKind::LogEntry,
                    expected: last_processed,
                    received: message.previous_timestamp,
                    site_config_id: message.site_config_id,
                });
            }
            trace!(remote = %self.remote, previous = message.previous_timestamp, last_processed, "Buffering log entry");
            self.pending.insert(message.previous_timestamp, message.clone());
            metrics::set_pending_log_entries(&self.remote, self.pending.len());
            return Ok((ApplyOutcome::Buffered, last_processed));
        }

        let mut read_ts = timestamp;
        let (ts, address) = self.apply_one(message, read_ts).await?;
        last_processed = ts;
        read_ts = address;

        while let Some(next) = self.pending.remove(&last_processed) {
            let (ts, address) = self.apply_one(&next, read_ts).await?;
            last_processed = ts;
            read_ts = address;
        }
        // Entries at or below the new position can never apply.
        self.pending = self.pending.split_off(&last_processed);
        metrics::set_pending_log_entries(&self.remote, self.pending.len());
        Ok((ApplyOutcome::Applied, last_processed))
    }

    async fn apply_one(&self, message: &ReplicationMessage, read_ts: LogAddress) -> Result<(LogAddress, LogAddress)> {
        let entry = message.entry()?;
        let mut tx = Transaction::new();
        let staged = stage_updates(&mut tx, entry.entries, &self.remote, |live| {
            self.streams.is_replicated(live).then_some(*live)
        });
        self.metadata
            .append_update(&mut tx, WriterMetadataField::LastLogEntryProcessed, message.timestamp);
        self.metadata
            .append_update(&mut tx, WriterMetadataField::SiteConfigId, message.site_config_id);
        let address = self.log.commit(tx, Some(read_ts)).await?;

        trace!(remote = %self.remote, timestamp = message.timestamp, updates = staged, address, "Applied log entry");
        metrics::record_messages_applied(&self.remote, MessageKind::LogEntry.label(), 1);
        Ok((message.timestamp, address))
    }
}
