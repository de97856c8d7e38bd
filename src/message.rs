// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication messages, payloads and acknowledgements.
//!
//! # Session Layout
//!
//! ```text
//! snapshot sync:   SNAPSHOT(seq 0) SNAPSHOT(seq 1) ... SNAPSHOT(seq n-1) SNAPSHOT_END(seq n)
//! log-entry sync:  LOG_ENTRY(seq 0, prev = base, ts = a1) LOG_ENTRY(seq 1, prev = a1, ts = a2) ...
//! ```
//!
//! Every message carries its session's `sync_request_id` and the topology
//! epoch (`site_config_id`) it was produced under.
//!
//! # Payload Format
//!
//! A payload is an [`OpaqueEntry`] encoded as JSON. Payloads larger than
//! [`COMPRESSION_THRESHOLD`] are zstd-compressed; decoding detects the zstd
//! magic bytes, so compressed and plain payloads can be mixed freely.

use crate::error::{ReplicationError, Result};
use crate::log::{LogAddress, StreamId, StreamUpdate, NON_ADDRESS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use uuid::Uuid;

/// Zstd magic bytes: 0x28 0xB5 0x2F 0xFD
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Payloads above this size are compressed.
pub const COMPRESSION_THRESHOLD: usize = 4096;

const ZSTD_LEVEL: i32 = 3;

/// Type of a replication message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Snapshot,
    LogEntry,
    SnapshotEnd,
}

impl MessageKind {
    /// Lowercase label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::LogEntry => "log_entry",
            Self::SnapshotEnd => "snapshot_end",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Snapshot => write!(f, "SNAPSHOT"),
            Self::LogEntry => write!(f, "LOG_ENTRY"),
            Self::SnapshotEnd => write!(f, "SNAPSHOT_END"),
        }
    }
}

/// One unit of replication traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationMessage {
    pub kind: MessageKind,
    /// Address the session's snapshot is consistent as of.
    pub snapshot_timestamp: LogAddress,
    /// Dense, starting at 0 within one session.
    pub sequence_number: i64,
    /// Topology epoch the message was produced under.
    pub site_config_id: i64,
    /// Log address of the carried entry (snapshot base for snapshot messages).
    pub timestamp: LogAddress,
    /// Address of the previously sent log entry.
    pub previous_timestamp: LogAddress,
    pub sync_request_id: Uuid,
    pub payload: Vec<u8>,
}

impl ReplicationMessage {
    /// A snapshot data message.
    pub fn snapshot(
        sync_request_id: Uuid,
        site_config_id: i64,
        snapshot_timestamp: LogAddress,
        sequence_number: i64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind: MessageKind::Snapshot,
            snapshot_timestamp,
            sequence_number,
            site_config_id,
            timestamp: snapshot_timestamp,
            previous_timestamp: NON_ADDRESS,
            sync_request_id,
            payload,
        }
    }

    /// The marker closing a snapshot transfer; `sequence_number` is the data message count.
    pub fn snapshot_end(
        sync_request_id: Uuid,
        site_config_id: i64,
        snapshot_timestamp: LogAddress,
        sequence_number: i64,
    ) -> Self {
        Self {
            kind: MessageKind::SnapshotEnd,
            snapshot_timestamp,
            sequence_number,
            site_config_id,
            timestamp: snapshot_timestamp,
            previous_timestamp: NON_ADDRESS,
            sync_request_id,
            payload: Vec::new(),
        }
    }

    /// An incremental message carrying the entry at `timestamp`.
    #[allow(clippy::too_many_arguments)]
    pub fn log_entry(
        sync_request_id: Uuid,
        site_config_id: i64,
        snapshot_timestamp: LogAddress,
        sequence_number: i64,
        timestamp: LogAddress,
        previous_timestamp: LogAddress,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind: MessageKind::LogEntry,
            snapshot_timestamp,
            sequence_number,
            site_config_id,
            timestamp,
            previous_timestamp,
            sync_request_id,
            payload,
        }
    }

    /// Decode the payload.
    pub fn entry(&self) -> Result<OpaqueEntry> {
        OpaqueEntry::decode(&self.payload)
    }

    /// Wire encoding (JSON).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Per-stream update batches carried by one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpaqueEntry {
    /// Log address the updates were read at.
    pub version: LogAddress,
    pub entries: BTreeMap<StreamId, Vec<StreamUpdate>>,
}

impl OpaqueEntry {
    pub fn new(version: LogAddress) -> Self {
        Self {
            version,
            entries: BTreeMap::new(),
        }
    }

    pub fn size_hint(&self) -> usize {
        self.entries
            .values()
            .flat_map(|updates| updates.iter())
            .map(StreamUpdate::size_hint)
            .sum()
    }

    pub fn update_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Encode, compressing when larger than [`COMPRESSION_THRESHOLD`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        if json.len() > COMPRESSION_THRESHOLD {
            zstd::encode_all(json.as_slice(), ZSTD_LEVEL)
                .map_err(|e| ReplicationError::Internal(format!("zstd encode: {}", e)))
        } else {
            Ok(json)
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let raw = maybe_decompress(data)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Decompress zstd data if it carries the zstd magic, otherwise pass it through.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| ReplicationError::Decompression(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| ReplicationError::Decompression(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// Destination's answer to one message.
///
/// Acks are cumulative: `sequence_number` (snapshot) and `timestamp`
/// (log entry) report the newest position applied so far, not just the
/// message being answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationAck {
    pub sync_request_id: Uuid,
    pub kind: MessageKind,
    pub snapshot_timestamp: LogAddress,
    /// Highest snapshot sequence number applied, or -1.
    pub sequence_number: i64,
    /// Highest log address applied (log entry), or the applied snapshot (snapshot end).
    pub timestamp: LogAddress,
}

impl ReplicationAck {
    /// Whether this ack covers `message`.
    pub fn covers(&self, message: &ReplicationMessage) -> bool {
        if self.sync_request_id != message.sync_request_id || self.kind != message.kind {
            return false;
        }
        match message.kind {
            MessageKind::Snapshot | MessageKind::SnapshotEnd => {
                self.sequence_number >= message.sequence_number
            }
            MessageKind::LogEntry => self.timestamp >= message.timestamp,
        }
    }
}
