// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persisted replication progress.
//!
//! Each side keeps a small table of named long-valued fields per remote
//! cluster in the shared log's metadata store:
//!
//! ```text
//! READER-<remote>   (source)        WRITER-<remote>   (destination)
//! ├── LAST_SNAPSHOT_SYNC            ├── SITE_CONFIG_ID
//! └── LAST_LOG_ENTRY_SYNC           ├── LAST_SNAPSHOT_START
//!                                   ├── LAST_SNAPSHOT_TRANSFER_DONE
//!                                   ├── LAST_SNAPSHOT_SEQ_NUM
//!                                   ├── LAST_SNAPSHOT_APPLY_DONE
//!                                   └── LAST_LOG_ENTRY_PROCESSED
//! ```
//!
//! Writes go through [`Transaction::put_metadata`] so they commit in the
//! same log entry as the stream mutations they describe. Reads are taken at
//! one fixed address so a validation check never mixes two versions of the
//! table. Unset fields read as [`NON_ADDRESS`].

use crate::error::Result;
use crate::log::{LogAddress, SharedLog, Transaction, NON_ADDRESS};
use std::fmt;
use std::sync::Arc;

/// Writer-side fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriterMetadataField {
    SiteConfigId,
    LastSnapshotStart,
    LastSnapshotTransferDone,
    LastSnapshotSeqNum,
    LastSnapshotApplyDone,
    LastLogEntryProcessed,
}

impl WriterMetadataField {
    pub const ALL: [WriterMetadataField; 6] = [
        Self::SiteConfigId,
        Self::LastSnapshotStart,
        Self::LastSnapshotTransferDone,
        Self::LastSnapshotSeqNum,
        Self::LastSnapshotApplyDone,
        Self::LastLogEntryProcessed,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Self::SiteConfigId => "SITE_CONFIG_ID",
            Self::LastSnapshotStart => "LAST_SNAPSHOT_START",
            Self::LastSnapshotTransferDone => "LAST_SNAPSHOT_TRANSFER_DONE",
            Self::LastSnapshotSeqNum => "LAST_SNAPSHOT_SEQ_NUM",
            Self::LastSnapshotApplyDone => "LAST_SNAPSHOT_APPLY_DONE",
            Self::LastLogEntryProcessed => "LAST_LOG_ENTRY_PROCESSED",
        }
    }
}

impl fmt::Display for WriterMetadataField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Reader-side fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaderMetadataField {
    LastSnapshotSync,
    LastLogEntrySync,
}

impl ReaderMetadataField {
    pub fn key(&self) -> &'static str {
        match self {
            Self::LastSnapshotSync => "LAST_SNAPSHOT_SYNC",
            Self::LastLogEntrySync => "LAST_LOG_ENTRY_SYNC",
        }
    }
}

impl fmt::Display for ReaderMetadataField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Phase of the shadow-stream snapshot writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterPhase {
    /// Snapshot messages are being staged into shadow streams.
    Transfer,
    /// Shadow streams are (or will be) copied into live streams; also the idle phase.
    Apply,
}

impl fmt::Display for WriterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transfer => write!(f, "TRANSFER"),
            Self::Apply => write!(f, "APPLY"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Writer metadata
// ═══════════════════════════════════════════════════════════════════════════════

/// All writer fields read at one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterMetadataSnapshot {
    /// Address the fields were read at.
    pub timestamp: LogAddress,
    pub site_config_id: i64,
    pub last_snapshot_start: LogAddress,
    pub last_snapshot_transfer_done: LogAddress,
    pub last_snapshot_seq_num: i64,
    pub last_snapshot_apply_done: LogAddress,
    pub last_log_entry_processed: LogAddress,
}

impl WriterMetadataSnapshot {
    pub fn get(&self, field: WriterMetadataField) -> i64 {
        match field {
            WriterMetadataField::SiteConfigId => self.site_config_id,
            WriterMetadataField::LastSnapshotStart => self.last_snapshot_start,
            WriterMetadataField::LastSnapshotTransferDone => self.last_snapshot_transfer_done,
            WriterMetadataField::LastSnapshotSeqNum => self.last_snapshot_seq_num,
            WriterMetadataField::LastSnapshotApplyDone => self.last_snapshot_apply_done,
            WriterMetadataField::LastLogEntryProcessed => self.last_log_entry_processed,
        }
    }

    /// Phase a restarted writer resumes in.
    ///
    /// Transfer while a snapshot has started but neither its transfer nor
    /// its apply has completed. A finished transfer whose apply is missing
    /// resumes in Apply ([`apply_pending`](Self::apply_pending)).
    pub fn phase(&self) -> WriterPhase {
        let start = self.last_snapshot_start;
        if start != NON_ADDRESS
            && self.last_snapshot_apply_done != start
            && self.last_snapshot_transfer_done != start
        {
            WriterPhase::Transfer
        } else {
            WriterPhase::Apply
        }
    }

    /// Transfer completed but the shadow-to-live copy never committed.
    pub fn apply_pending(&self) -> bool {
        let start = self.last_snapshot_start;
        start != NON_ADDRESS
            && self.last_snapshot_transfer_done == start
            && self.last_snapshot_apply_done != start
    }
}

/// Destination progress for one remote cluster.
#[derive(Clone)]
pub struct PersistedWriterMetadata {
    log: Arc<dyn SharedLog>,
    table: String,
}

impl PersistedWriterMetadata {
    pub fn new(log: Arc<dyn SharedLog>, remote_cluster_id: &str) -> Self {
        Self {
            log,
            table: format!("WRITER-{remote_cluster_id}"),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Address to read a consistent view at (the current log tail).
    pub async fn timestamp(&self) -> Result<LogAddress> {
        self.log.log_tail().await
    }

    pub async fn query(&self, timestamp: LogAddress, field: WriterMetadataField) -> Result<i64> {
        Ok(self
            .log
            .metadata_get(&self.table, field.key(), timestamp)
            .await?
            .unwrap_or(NON_ADDRESS))
    }

    /// Stage a field write in `tx`; the caller commits it with the data.
    pub fn append_update(&self, tx: &mut Transaction, field: WriterMetadataField, value: i64) {
        tx.put_metadata(&self.table, field.key(), value);
    }

    /// Every field at the current tail.
    pub async fn snapshot(&self) -> Result<WriterMetadataSnapshot> {
        let timestamp = self.timestamp().await?;
        self.snapshot_at(timestamp).await
    }

    pub async fn snapshot_at(&self, timestamp: LogAddress) -> Result<WriterMetadataSnapshot> {
        Ok(WriterMetadataSnapshot {
            timestamp,
            site_config_id: self.query(timestamp, WriterMetadataField::SiteConfigId).await?,
            last_snapshot_start: self.query(timestamp, WriterMetadataField::LastSnapshotStart).await?,
            last_snapshot_transfer_done: self
                .query(timestamp, WriterMetadataField::LastSnapshotTransferDone)
                .await?,
            last_snapshot_seq_num: self.query(timestamp, WriterMetadataField::LastSnapshotSeqNum).await?,
            last_snapshot_apply_done: self
                .query(timestamp, WriterMetadataField::LastSnapshotApplyDone)
                .await?,
            last_log_entry_processed: self
                .query(timestamp, WriterMetadataField::LastLogEntryProcessed)
                .await?,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reader metadata
// ═══════════════════════════════════════════════════════════════════════════════

/// Both reader fields read at one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderMetadataSnapshot {
    pub last_snapshot_sync: LogAddress,
    pub last_log_entry_sync: LogAddress,
}

impl ReaderMetadataSnapshot {
    /// A completed snapshot exists to resume log-entry sync from.
    pub fn can_resume(&self) -> bool {
        self.last_snapshot_sync != NON_ADDRESS
    }

    /// Position log-entry sync resumes after.
    pub fn resume_from(&self) -> LogAddress {
        self.last_log_entry_sync.max(self.last_snapshot_sync)
    }
}

/// Source progress for one remote cluster.
#[derive(Clone)]
pub struct PersistedReaderMetadata {
    log: Arc<dyn SharedLog>,
    table: String,
}

impl PersistedReaderMetadata {
    pub fn new(log: Arc<dyn SharedLog>, remote_cluster_id: &str) -> Self {
        Self {
            log,
            table: format!("READER-{remote_cluster_id}"),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn query(&self, timestamp: LogAddress, field: ReaderMetadataField) -> Result<i64> {
        Ok(self
            .log
            .metadata_get(&self.table, field.key(), timestamp)
            .await?
            .unwrap_or(NON_ADDRESS))
    }

    pub fn append_update(&self, tx: &mut Transaction, field: ReaderMetadataField, value: i64) {
        tx.put_metadata(&self.table, field.key(), value);
    }

    pub async fn snapshot(&self) -> Result<ReaderMetadataSnapshot> {
        let timestamp = self.log.log_tail().await?;
        Ok(ReaderMetadataSnapshot {
            last_snapshot_sync: self.query(timestamp, ReaderMetadataField::LastSnapshotSync).await?,
            last_log_entry_sync: self.query(timestamp, ReaderMetadataField::LastLogEntrySync).await?,
        })
    }

    /// Record a completed snapshot sync; log-entry sync restarts from its base.
    pub async fn record_snapshot_sync(&self, base: LogAddress) -> Result<()> {
        let mut tx = Transaction::new();
        self.append_update(&mut tx, ReaderMetadataField::LastSnapshotSync, base);
        self.append_update(&mut tx, ReaderMetadataField::LastLogEntrySync, base);
        self.log.append(tx).await?;
        Ok(())
    }

    /// Record the newest acknowledged log-entry address.
    pub async fn record_log_entry_sync(&self, acked: LogAddress) -> Result<()> {
        let mut tx = Transaction::new();
        self.append_update(&mut tx, ReaderMetadataField::LastLogEntrySync, acked);
        self.log.append(tx).await?;
        Ok(())
    }
}
