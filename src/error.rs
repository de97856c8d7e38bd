// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the log replication engine.
//!
//! Readers and writers never decide state transitions themselves: they return
//! a typed [`ReplicationError`] and the replication FSM picks the next state
//! from its [`ErrorClass`].
//!
//! # Error Classes
//!
//! | Class | Variants | FSM reaction |
//! |-------|----------|--------------|
//! | `Transient` | `OutOfOrderMessage`, `Timeout`, `Transport`, `DataControl` | retry / resend, no transition |
//! | `TrimInduced` | `TrimmedLog` | `IN_REQUIRE_SNAPSHOT_SYNC` |
//! | `SessionInvalidated` | `SiteConfigMismatch`, `StaleMessage`, `TransactionAborted`, `Storage`, `Serialization`, `Decompression` | `IN_REQUIRE_SNAPSHOT_SYNC` |
//! | `ProtocolViolation` | `InvalidTableCrossing` | `STOPPED` |
//! | `Input` | `EmptyReplicationSet`, `Config` | rejected before any state is created |
//! | `Fatal` | `InvalidState`, `Shutdown`, `Internal` | `STOPPED` |

use crate::message::MessageKind;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// How the FSM should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Message drop, timeout, duplicate or gap resolvable by resending.
    Transient,
    /// The required read position was trimmed from the log.
    TrimInduced,
    /// The current sync attempt can no longer make progress; a new snapshot is needed.
    SessionInvalidated,
    /// A transaction spans replicated and non-replicated streams. Never retried.
    ProtocolViolation,
    /// Caller supplied invalid input.
    Input,
    /// Local bug or shutdown.
    Fatal,
}

impl ErrorClass {
    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::TrimInduced => "trim_induced",
            Self::SessionInvalidated => "session_invalidated",
            Self::ProtocolViolation => "protocol_violation",
            Self::Input => "input",
            Self::Fatal => "fatal",
        }
    }
}

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// A writer received a message that is not the next one it expects.
    ///
    /// Carries the message kind and the topology epoch so the receiver can
    /// tell a duplicate (`received < expected`) from a gap.
    #[error("Out of order {kind} message (site {site_config_id}): expected {expected}, received {received}")]
    OutOfOrderMessage {
        kind: MessageKind,
        expected: i64,
        received: i64,
        site_config_id: i64,
    },

    /// A log entry touches both replicated and non-replicated streams.
    #[error("Transaction at address {address} crosses replicated streams {replicated:?} and non-replicated streams {foreign:?}")]
    InvalidTableCrossing {
        address: i64,
        replicated: Vec<String>,
        foreign: Vec<String>,
    },

    /// A read asked for an address below the trim mark.
    #[error("Log trimmed: requested address {requested} is below trim mark {trim_mark}")]
    TrimmedLog { requested: i64, trim_mark: i64 },

    /// A sync was started with no streams configured.
    #[error("Replication stream set is empty")]
    EmptyReplicationSet,

    /// The message was produced under a different topology epoch.
    #[error("Site config mismatch: expected {expected}, received {received}")]
    SiteConfigMismatch { expected: i64, received: i64 },

    /// The message belongs to a session or snapshot that is no longer current.
    #[error("Stale message: {0}")]
    StaleMessage(String),

    /// Optimistic concurrency check failed on a metadata table.
    #[error("Transaction aborted on {table}: read at {read_timestamp}, conflicting write at {conflict_address}")]
    TransactionAborted {
        table: String,
        read_timestamp: i64,
        conflict_address: i64,
    },

    /// The transport could not deliver a message or returned a remote error.
    #[error("Transport error ({remote}): {message}")]
    Transport { remote: String, message: String },

    /// No acknowledgement arrived in time.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// The data-control callback failed.
    #[error("Data control error: {0}")]
    DataControl(String),

    /// SQLite error in the durable log store.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Payload or store record could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// zstd decode failed on a compressed payload.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// State machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transport error for the given remote.
    pub fn transport(remote: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            remote: remote.into(),
            message: message.into(),
        }
    }

    /// Classify this error for the FSM.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::OutOfOrderMessage { .. } => ErrorClass::Transient,
            Self::Timeout(_) => ErrorClass::Transient,
            Self::Transport { .. } => ErrorClass::Transient,
            Self::DataControl(_) => ErrorClass::Transient,
            Self::TrimmedLog { .. } => ErrorClass::TrimInduced,
            Self::SiteConfigMismatch { .. } => ErrorClass::SessionInvalidated,
            Self::StaleMessage(_) => ErrorClass::SessionInvalidated,
            Self::TransactionAborted { .. } => ErrorClass::SessionInvalidated,
            Self::Storage(_) => ErrorClass::SessionInvalidated,
            Self::Serialization(_) => ErrorClass::SessionInvalidated,
            Self::Decompression(_) => ErrorClass::SessionInvalidated,
            Self::InvalidTableCrossing { .. } => ErrorClass::ProtocolViolation,
            Self::EmptyReplicationSet => ErrorClass::Input,
            Self::Config(_) => ErrorClass::Input,
            Self::InvalidState { .. } => ErrorClass::Fatal,
            Self::Shutdown => ErrorClass::Fatal,
            Self::Internal(_) => ErrorClass::Fatal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether the replication session must stop for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::ProtocolViolation | ErrorClass::Fatal)
    }

    /// A redelivery of something the writer already applied.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::OutOfOrderMessage { expected, received, .. } if received < expected)
    }
}
