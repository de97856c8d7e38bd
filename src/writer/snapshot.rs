// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shadow-stream snapshot installer.
//!
//! # Protocol
//!
//! ```text
//! reset(site, ts)          tx: SITE_CONFIG_ID, LAST_SNAPSHOT_START = ts,
//!                              SEQ_NUM = -1, TRANSFER_DONE = -1, clear S'
//! apply(SNAPSHOT seq n)    tx: updates → S', LAST_SNAPSHOT_SEQ_NUM = n
//! transfer_done(END)       tx: LAST_SNAPSHOT_TRANSFER_DONE = ts
//! apply_shadow_streams()   tx: clear S, copy S' → S, clear S',
//!                              LAST_SNAPSHOT_APPLY_DONE = ts,
//!                              LAST_LOG_ENTRY_PROCESSED = ts
//! ```
//!
//! Shadow data is fully durable before the single apply transaction touches
//! a live stream, so a reader of `S` sees the old state or the new one.

use super::{stage_updates, ApplyOutcome, ShadowMap};
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::log::{LogAddress, SharedLog, StreamId, StreamUpdate, Transaction, NON_ADDRESS};
use crate::message::{MessageKind, ReplicationMessage};
use crate::metadata::{PersistedWriterMetadata, WriterMetadataField, WriterMetadataSnapshot, WriterPhase};
use crate::metrics;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Installs snapshots for one remote cluster.
///
/// Not thread-safe; the sink serializes all calls.
pub struct StreamsSnapshotWriter {
    log: Arc<dyn SharedLog>,
    metadata: PersistedWriterMetadata,
    remote: String,
    shadows: ShadowMap,
    phase: WriterPhase,
    site_config_id: i64,
    src_global_snapshot: LogAddress,
    recv_seq: i64,
    shadow_stream_start_address: LogAddress,
}

impl StreamsSnapshotWriter {
    pub fn new(log: Arc<dyn SharedLog>, config: &ReplicationConfig) -> Self {
        Self {
            metadata: PersistedWriterMetadata::new(log.clone(), &config.remote_cluster_id),
            log,
            remote: config.remote_cluster_id.clone(),
            shadows: ShadowMap::new(&config.streams_to_replicate),
            phase: WriterPhase::Apply,
            site_config_id: NON_ADDRESS,
            src_global_snapshot: NON_ADDRESS,
            recv_seq: 0,
            shadow_stream_start_address: NON_ADDRESS,
        }
    }

    pub fn phase(&self) -> WriterPhase {
        self.phase
    }

    pub fn recv_seq(&self) -> i64 {
        self.recv_seq
    }

    /// Topology epoch of the last snapshot session, or `NON_ADDRESS`.
    pub fn site_config_id(&self) -> i64 {
        self.site_config_id
    }

    pub fn src_global_snapshot(&self) -> LogAddress {
        self.src_global_snapshot
    }

    pub fn shadow_stream_start_address(&self) -> LogAddress {
        self.shadow_stream_start_address
    }

    pub fn metadata(&self) -> &PersistedWriterMetadata {
        &self.metadata
    }

    /// Open a snapshot session.
    ///
    /// A `(site_config_id, snapshot_timestamp)` newer than the persisted one
    /// starts over: metadata is reset and the shadow streams are cleared in
    /// one transaction. An equal pair is a retry and resumes after the last
    /// persisted sequence number without clearing. An older pair is stale.
    pub async fn reset(&mut self, site_config_id: i64, snapshot_timestamp: LogAddress) -> Result<()> {
        let persisted = self.metadata.snapshot().await?;
        let incoming = (site_config_id, snapshot_timestamp);
        let current = (persisted.site_config_id, persisted.last_snapshot_start);

        if incoming > current {
            let mut tx = Transaction::new();
            self.metadata.append_update(&mut tx, WriterMetadataField::SiteConfigId, site_config_id);
            self.metadata
                .append_update(&mut tx, WriterMetadataField::LastSnapshotStart, snapshot_timestamp);
            self.metadata.append_update(&mut tx, WriterMetadataField::LastSnapshotSeqNum, NON_ADDRESS);
            self.metadata
                .append_update(&mut tx, WriterMetadataField::LastSnapshotTransferDone, NON_ADDRESS);
            for shadow in self.shadows.shadows() {
                tx.log_update(shadow, StreamUpdate::Clear);
            }
            let address = self.log.commit(tx, Some(persisted.timestamp)).await?;

            self.recv_seq = 0;
            self.shadow_stream_start_address = address;
            info!(
                remote = %self.remote,
                site_config_id,
                snapshot_timestamp,
                shadow_start = address,
                "Snapshot writer reset, shadow streams cleared"
            );
        } else if incoming == current {
            self.recv_seq = persisted.last_snapshot_seq_num + 1;
            self.shadow_stream_start_address = self.last_shadow_clear().await?;
            info!(
                remote = %self.remote,
                site_config_id,
                snapshot_timestamp,
                recv_seq = self.recv_seq,
                "Snapshot writer resuming interrupted transfer"
            );
        } else {
            warn!(
                remote = %self.remote,
                site_config_id,
                snapshot_timestamp,
                persisted_site = persisted.site_config_id,
                persisted_start = persisted.last_snapshot_start,
                "Ignoring reset for a stale snapshot"
            );
            metrics::record_writer_rejection(&self.remote, "stale_reset");
            return Err(ReplicationError::StaleMessage(format!(
                "snapshot ({site_config_id}, {snapshot_timestamp}) is older than ({}, {})",
                persisted.site_config_id, persisted.last_snapshot_start
            )));
        }

        self.site_config_id = site_config_id;
        self.src_global_snapshot = snapshot_timestamp;
        self.phase = if persisted.last_snapshot_apply_done == snapshot_timestamp && incoming == current {
            WriterPhase::Apply
        } else {
            WriterPhase::Transfer
        };
        Ok(())
    }

    /// Stage one SNAPSHOT message into the shadow streams.
    pub async fn apply(&mut self, message: &ReplicationMessage) -> Result<ApplyOutcome> {
        self.validate(message, MessageKind::Snapshot)?;

        let timestamp = self.metadata.timestamp().await?;
        let persisted = self.metadata.snapshot_at(timestamp).await?;
        if !self.guard_matches(&persisted, message) {
            warn!(
                remote = %self.remote,
                seq = message.sequence_number,
                persisted_site = persisted.site_config_id,
                persisted_start = persisted.last_snapshot_start,
                persisted_seq = persisted.last_snapshot_seq_num,
                "Skipping snapshot message, persisted metadata does not match"
            );
            metrics::record_writer_skip(&self.remote, "metadata_mismatch");
            self.recv_seq += 1;
            return Ok(ApplyOutcome::Skipped);
        }

        let entry = message.entry()?;
        let mut tx = Transaction::new();
        let staged = stage_updates(&mut tx, entry.entries, &self.remote, |live| self.shadows.shadow_of(live));
        self.metadata
            .append_update(&mut tx, WriterMetadataField::LastSnapshotSeqNum, message.sequence_number);
        self.log.commit(tx, Some(timestamp)).await?;

        debug!(remote = %self.remote, seq = message.sequence_number, updates = staged, "Applied snapshot message to shadow streams");
        metrics::record_messages_applied(&self.remote, MessageKind::Snapshot.label(), 1);
        self.recv_seq += 1;
        Ok(ApplyOutcome::Applied)
    }

    /// Close the transfer and install the shadow streams.
    ///
    /// `message.sequence_number` is the number of data messages in the session.
    pub async fn snapshot_transfer_done(&mut self, message: &ReplicationMessage) -> Result<ApplyOutcome> {
        if message.kind != MessageKind::SnapshotEnd {
            return Err(self.out_of_order(message));
        }
        if message.snapshot_timestamp != self.src_global_snapshot {
            return Err(self.stale(message));
        }

        let persisted = self.metadata.snapshot().await?;
        if persisted.last_snapshot_apply_done == message.snapshot_timestamp {
            debug!(remote = %self.remote, snapshot = message.snapshot_timestamp, "Snapshot already applied");
            self.phase = WriterPhase::Apply;
            return Ok(ApplyOutcome::Skipped);
        }
        if message.sequence_number != self.recv_seq {
            return Err(self.out_of_order(message));
        }
        if persisted.site_config_id != self.site_config_id
            || persisted.last_snapshot_start != message.snapshot_timestamp
        {
            return Err(self.stale(message));
        }

        if persisted.last_snapshot_transfer_done != message.snapshot_timestamp {
            let mut tx = Transaction::new();
            self.metadata.append_update(
                &mut tx,
                WriterMetadataField::LastSnapshotTransferDone,
                message.snapshot_timestamp,
            );
            self.log.commit(tx, Some(persisted.timestamp)).await?;
        }
        self.phase = WriterPhase::Apply;
        info!(
            remote = %self.remote,
            snapshot = message.snapshot_timestamp,
            messages = message.sequence_number,
            "Snapshot transfer complete, applying shadow streams"
        );

        self.apply_shadow_streams().await?;
        Ok(ApplyOutcome::Applied)
    }

    /// Copy shadow data into the live streams in one transaction.
    ///
    /// Runs even when the snapshot carried no data, so live streams that are
    /// empty at the source end up empty here too.
    pub async fn apply_shadow_streams(&mut self) -> Result<()> {
        let started = Instant::now();
        let timestamp = self.metadata.timestamp().await?;
        let snapshot = self.src_global_snapshot;

        let mut tx = Transaction::new();
        let mut copied = 0;
        for (name, live, shadow) in self.shadows.streams() {
            let entries = self
                .log
                .read_stream(*shadow, self.shadow_stream_start_address + 1, timestamp)
                .await?;
            tx.log_update(*live, StreamUpdate::Clear);
            for entry in &entries {
                let Some(updates) = entry.updates.get(shadow) else {
                    continue;
                };
                for update in updates.iter().filter(|u| **u != StreamUpdate::Clear) {
                    tx.log_update(*live, update.clone());
                    copied += 1;
                }
            }
            tx.log_update(*shadow, StreamUpdate::Clear);
            debug!(remote = %self.remote, stream = %name, entries = entries.len(), "Staged shadow stream copy");
        }

        self.metadata.append_update(
            &mut tx,
            WriterMetadataField::LastSnapshotSeqNum,
            self.recv_seq - 1,
        );
        self.metadata
            .append_update(&mut tx, WriterMetadataField::LastSnapshotApplyDone, snapshot);
        self.metadata
            .append_update(&mut tx, WriterMetadataField::LastLogEntryProcessed, snapshot);
        let address = self.log.commit(tx, Some(timestamp)).await?;

        self.shadow_stream_start_address = address;
        metrics::record_snapshot_apply(&self.remote, copied, started.elapsed());
        info!(
            remote = %self.remote,
            snapshot,
            updates = copied,
            address,
            "Snapshot applied to live streams"
        );
        Ok(())
    }

    /// Rebuild writer state after a restart.
    ///
    /// Finishes a transfer whose apply never committed.
    pub async fn recover(&mut self) -> Result<WriterPhase> {
        let persisted = self.metadata.snapshot().await?;
        self.site_config_id = persisted.site_config_id;
        self.src_global_snapshot = persisted.last_snapshot_start;
        self.recv_seq = persisted.last_snapshot_seq_num + 1;
        self.shadow_stream_start_address = self.last_shadow_clear().await?;
        self.phase = persisted.phase();

        if persisted.apply_pending() {
            info!(remote = %self.remote, snapshot = persisted.last_snapshot_start, "Resuming interrupted snapshot apply");
            self.apply_shadow_streams().await?;
        }
        info!(
            remote = %self.remote,
            phase = %self.phase,
            recv_seq = self.recv_seq,
            shadow_start = self.shadow_stream_start_address,
            "Snapshot writer recovered"
        );
        Ok(self.phase)
    }

    fn guard_matches(&self, persisted: &WriterMetadataSnapshot, message: &ReplicationMessage) -> bool {
        persisted.site_config_id == self.site_config_id
            && persisted.last_snapshot_start == message.snapshot_timestamp
            && persisted.last_snapshot_seq_num + 1 == message.sequence_number
    }

    fn validate(&self, message: &ReplicationMessage, kind: MessageKind) -> Result<()> {
        if message.kind != kind {
            return Err(self.out_of_order(message));
        }
        if message.snapshot_timestamp != self.src_global_snapshot {
            return Err(self.stale(message));
        }
        // Once the transfer is closed nothing new is accepted, only duplicates.
        if message.sequence_number != self.recv_seq || self.phase != WriterPhase::Transfer {
            return Err(self.out_of_order(message));
        }
        Ok(())
    }

    fn out_of_order(&self, message: &ReplicationMessage) -> ReplicationError {
        metrics::record_writer_rejection(&self.remote, "out_of_order");
        ReplicationError::OutOfOrderMessage {
            kind: message.kind,
            expected: self.recv_seq,
            received: message.sequence_number,
            site_config_id: message.site_config_id,
        }
    }

    fn stale(&self, message: &ReplicationMessage) -> ReplicationError {
        metrics::record_writer_rejection(&self.remote, "stale_snapshot");
        ReplicationError::StaleMessage(format!(
            "{} for snapshot {} while installing {}",
            message.kind, message.snapshot_timestamp, self.src_global_snapshot
        ))
    }

    /// Address of the newest entry that cleared a shadow stream.
    async fn last_shadow_clear(&self) -> Result<LogAddress> {
        let trim_mark = self.log.trim_mark().await?;
        let tail = self.log.log_tail().await?;
        let mut latest = NON_ADDRESS;
        for shadow in self.shadows.shadows() {
            let entries = self.log.read_stream(shadow, trim_mark, tail).await?;
            if let Some(entry) = entries.iter().rev().find(|e| clears(e.updates.get(&shadow))) {
                latest = latest.max(entry.address);
            }
        }
        Ok(latest)
    }
}

fn clears(updates: Option<&Vec<StreamUpdate>>) -> bool {
    updates.is_some_and(|u| u.contains(&StreamUpdate::Clear))
}
