// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared log abstraction.
//!
//! Replication consumes the shared log as an ordered, addressable, trim-aware
//! sequence of transactional entries. Each entry carries updates for one or
//! more streams; a commit may also write named long-valued metadata fields
//! that become visible at the entry's address, which is how replication
//! progress commits atomically with the data it describes.
//!
//! Two backends are provided:
//!
//! - [`MemoryLog`]: in-process, used by tests and embedders.
//! - [`SqliteLog`]: durable, survives process restarts.
//!
//! # Addresses
//!
//! ```text
//!   trim mark                             tail
//!      │                                    │
//!      ▼                                    ▼
//!  ····[ 7 ][ 8 ][ 9 ][ 10 ][ 11 ][ 12 ][ 13 ]
//!  trimmed │◄──────── readable ───────────►│
//! ```
//!
//! Addresses are dense, start at 0 and never go backwards. [`NON_ADDRESS`]
//! means "no address yet" (empty log, nothing processed).

mod memory;
mod sqlite;

pub use memory::MemoryLog;
pub use sqlite::SqliteLog;

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// A position in the shared log.
pub type LogAddress = i64;

/// Sentinel for "no address yet".
pub const NON_ADDRESS: LogAddress = -1;

/// Suffix appended to a stream name to form its shadow stream name.
pub const SHADOW_SUFFIX: &str = "_shadow";

/// Type alias for boxed async futures returned by log backends.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Materialized key/value state of one stream.
pub type StreamState = BTreeMap<String, String>;

// ═══════════════════════════════════════════════════════════════════════════════
// Stream identity
// ═══════════════════════════════════════════════════════════════════════════════

/// Stable identifier of a stream, derived from its name.
///
/// Both clusters derive the same id for the same name, so the destination
/// never needs a name lookup to route an entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Derive the id from a stream name (first 16 bytes of its SHA-256).
    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(Uuid::from_bytes(bytes))
    }

    /// Id of the shadow stream that stages snapshot data for `name`.
    pub fn shadow_of(name: &str) -> Self {
        Self::from_name(&shadow_name(name))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse the hyphenated form produced by `Display`.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ReplicationError::Internal(format!("invalid stream id {s}: {e}")))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

/// Name of the shadow stream for `name`.
pub fn shadow_name(name: &str) -> String {
    format!("{name}{SHADOW_SUFFIX}")
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entries
// ═══════════════════════════════════════════════════════════════════════════════

/// One mutation of a stream's key/value state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StreamUpdate {
    Put { key: String, value: String },
    Delete { key: String },
    Clear,
}

impl StreamUpdate {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    /// Approximate encoded size, used to cut snapshot messages.
    pub fn size_hint(&self) -> usize {
        match self {
            Self::Put { key, value } => key.len() + value.len() + 16,
            Self::Delete { key } => key.len() + 16,
            Self::Clear => 8,
        }
    }

    /// Fold this update into a materialized state.
    pub fn apply_to(&self, state: &mut StreamState) {
        match self {
            Self::Put { key, value } => {
                state.insert(key.clone(), value.clone());
            }
            Self::Delete { key } => {
                state.remove(key);
            }
            Self::Clear => state.clear(),
        }
    }
}

/// Whether an entry was written by an application or by a checkpointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Data,
    /// Full state of every stream it touches, as of address `as_of`.
    Checkpoint { as_of: LogAddress },
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Checkpoint { .. } => "checkpoint",
        }
    }

    /// Address the state is consistent as of, for checkpoints.
    pub fn as_of(&self) -> Option<LogAddress> {
        match self {
            Self::Data => None,
            Self::Checkpoint { as_of } => Some(*as_of),
        }
    }

    pub fn from_parts(kind: &str, as_of: Option<LogAddress>) -> Result<Self> {
        match (kind, as_of) {
            ("data", _) => Ok(Self::Data),
            ("checkpoint", Some(as_of)) => Ok(Self::Checkpoint { as_of }),
            (other, _) => Err(ReplicationError::Internal(format!("unknown entry kind {other}"))),
        }
    }
}

/// A committed transactional entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub address: LogAddress,
    pub kind: EntryKind,
    pub updates: BTreeMap<StreamId, Vec<StreamUpdate>>,
}

impl LogEntry {
    pub fn touches(&self, stream: &StreamId) -> bool {
        self.updates.contains_key(stream)
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamId> {
        self.updates.keys()
    }

    pub fn is_checkpoint(&self) -> bool {
        matches!(self.kind, EntryKind::Checkpoint { .. })
    }
}

/// A metadata field write carried by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataWrite {
    pub table: String,
    pub key: String,
    pub value: i64,
}

/// Builder for an atomic commit of stream updates and metadata writes.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub kind: EntryKind,
    pub updates: BTreeMap<StreamId, Vec<StreamUpdate>>,
    pub metadata: Vec<MetadataWrite>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            kind: EntryKind::Data,
            updates: BTreeMap::new(),
            metadata: Vec::new(),
        }
    }

    pub fn checkpoint(as_of: LogAddress) -> Self {
        Self {
            kind: EntryKind::Checkpoint { as_of },
            ..Self::new()
        }
    }

    pub fn log_update(&mut self, stream: StreamId, update: StreamUpdate) -> &mut Self {
        self.updates.entry(stream).or_default().push(update);
        self
    }

    pub fn log_updates(
        &mut self,
        stream: StreamId,
        updates: impl IntoIterator<Item = StreamUpdate>,
    ) -> &mut Self {
        self.updates.entry(stream).or_default().extend(updates);
        self
    }

    pub fn put_metadata(&mut self, table: &str, key: &str, value: i64) -> &mut Self {
        // Last write wins inside one transaction.
        self.metadata.retain(|w| !(w.table == table && w.key == key));
        self.metadata.push(MetadataWrite {
            table: table.to_string(),
            key: key.to_string(),
            value,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.metadata.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SharedLog trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The log operations replication needs.
///
/// Implementations must be safe to share between the FSM's workers and the
/// destination's writer; every method takes `&self`.
pub trait SharedLog: Send + Sync + 'static {
    /// Atomically append a transaction and return its address.
    ///
    /// With `read_timestamp` set, the commit aborts with
    /// [`ReplicationError::TransactionAborted`] if any metadata table it
    /// writes was modified after that address.
    fn commit(&self, tx: Transaction, read_timestamp: Option<LogAddress>) -> BoxFuture<'_, LogAddress>;

    /// Append without a concurrency check.
    fn append(&self, tx: Transaction) -> BoxFuture<'_, LogAddress> {
        self.commit(tx, None)
    }

    /// Entries with `from <= address <= to`, in address order.
    ///
    /// Fails with [`ReplicationError::TrimmedLog`] if `from` is below the trim mark.
    fn read_range(&self, from: LogAddress, to: LogAddress) -> BoxFuture<'_, Vec<LogEntry>>;

    /// Like [`read_range`](Self::read_range), limited to entries touching `stream`.
    fn read_stream(
        &self,
        stream: StreamId,
        from: LogAddress,
        to: LogAddress,
    ) -> BoxFuture<'_, Vec<LogEntry>> {
        Box::pin(async move {
            let entries = self.read_range(from, to).await?;
            Ok(entries.into_iter().filter(|e| e.touches(&stream)).collect())
        })
    }

    /// Address of the last committed entry, or [`NON_ADDRESS`].
    fn log_tail(&self) -> BoxFuture<'_, LogAddress>;

    /// Lowest address still retained.
    fn trim_mark(&self) -> BoxFuture<'_, LogAddress>;

    /// Discard every entry below `address`.
    fn prefix_trim(&self, address: LogAddress) -> BoxFuture<'_, ()>;

    /// Value of a metadata field as of address `at`.
    fn metadata_get(&self, table: &str, key: &str, at: LogAddress) -> BoxFuture<'_, Option<i64>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers shared by readers, writers and tests
// ═══════════════════════════════════════════════════════════════════════════════

/// Fold entries into the state of `stream`.
pub fn materialize<'a>(stream: &StreamId, entries: impl IntoIterator<Item = &'a LogEntry>) -> StreamState {
    let mut state = StreamState::new();
    for entry in entries {
        if let Some(updates) = entry.updates.get(stream) {
            for update in updates {
                update.apply_to(&mut state);
            }
        }
    }
    state
}

/// Entries needed to rebuild `stream` as of address `at`, in apply order.
///
/// Starts from the newest checkpoint of the stream when there is one, then
/// replays every entry written after the checkpoint's `as_of` address. Once
/// the log has been prefix-trimmed a checkpoint is required; without it the
/// history is incomplete and the read fails with [`ReplicationError::TrimmedLog`].
pub async fn read_stream_history<L: SharedLog + ?Sized>(
    log: &L,
    stream: StreamId,
    at: LogAddress,
) -> Result<Vec<LogEntry>> {
    if at == NON_ADDRESS {
        return Ok(Vec::new());
    }
    let trim_mark = log.trim_mark().await?;
    let mut entries = log.read_stream(stream, trim_mark, at).await?;
    match entries.iter().rposition(LogEntry::is_checkpoint) {
        Some(index) => {
            let checkpoint = entries.remove(index);
            let as_of = checkpoint.kind.as_of().unwrap_or(NON_ADDRESS);
            let mut history = Vec::with_capacity(entries.len() + 1);
            history.push(checkpoint);
            history.extend(
                entries
                    .into_iter()
                    .filter(|e| !e.is_checkpoint() && e.address > as_of),
            );
            Ok(history)
        }
        None if trim_mark > 0 => Err(ReplicationError::TrimmedLog {
            requested: 0,
            trim_mark,
        }),
        None => Ok(entries),
    }
}

/// Current materialized state of a stream.
pub async fn stream_state<L: SharedLog + ?Sized>(log: &L, stream: StreamId) -> Result<StreamState> {
    let tail = log.log_tail().await?;
    let entries = read_stream_history(log, stream, tail).await?;
    Ok(materialize(&stream, &entries))
}

/// Append a checkpoint holding the full state of `streams` as of the current tail.
///
/// After a checkpoint the log may be prefix-trimmed up to its address
/// without losing the ability to snapshot those streams.
pub async fn checkpoint<L: SharedLog + ?Sized>(log: &L, streams: &[StreamId]) -> Result<LogAddress> {
    let as_of = log.log_tail().await?;
    let mut tx = Transaction::checkpoint(as_of);
    for stream in streams {
        let entries = read_stream_history(log, *stream, as_of).await?;
        let state = materialize(stream, &entries);
        tx.log_update(*stream, StreamUpdate::Clear);
        tx.log_updates(
            *stream,
            state.into_iter().map(|(key, value)| StreamUpdate::Put { key, value }),
        );
    }
    log.append(tx).await
}
