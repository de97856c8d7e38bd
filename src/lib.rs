//! # Log Replication Engine
//!
//! Replicates a chosen set of streams of a shared log from an active cluster
//! to standby clusters.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────── active cluster ────────────────────────┐
//! │                                                                │
//! │  SharedLog ──► StreamsSnapshotReader ──┐                       │
//! │      │                                 ├──► ReplicationFsm ─┐  │
//! │      └─────► StreamsLogEntryReader ────┘   (SourceManager)  │  │
//! │                                                  ▲          │  │
//! │                         DataControl ─────────────┘          │  │
//! └─────────────────────────────────────────────────────────────┼──┘
//!                                          DataSender / acks    │
//! ┌──────────────────────── standby cluster ────────────────────┼──┐
//! │                                                             ▼  │
//! │  SharedLog ◄── StreamsSnapshotWriter ◄──┐                      │
//! │      ▲         (shadow streams)         ├── SinkManager        │
//! │      └──────── LogEntryWriter ◄─────────┘   (DataReceiver)     │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Sync Modes
//!
//! 1. **Snapshot sync**: full state of every replicated stream as of one log
//!    address, staged in shadow streams and installed in one transaction
//! 2. **Log-entry sync**: every later transaction touching a replicated
//!    stream, applied in address order
//!
//! Progress on both sides is persisted in the shared log itself, so either
//! side can crash and resume without duplicating or losing updates.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use log_replication_engine::{
//!     AutoDataControl, LocalDataSender, MemoryLog, ReplicationConfig, SinkManager, SourceManager,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> log_replication_engine::Result<()> {
//!     let config = ReplicationConfig::new("standby-1", ["orders", "customers"]);
//!
//!     let sink = Arc::new(SinkManager::new(Arc::new(MemoryLog::new()), &config));
//!     sink.recover().await?;
//!
//!     let source = SourceManager::new(
//!         config,
//!         Arc::new(MemoryLog::new()),
//!         Arc::new(LocalDataSender::new(sink)),
//!         Arc::new(AutoDataControl::new()),
//!     );
//!     source.start_replication().await?;
//!
//!     // Runs until shutdown
//!     source.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod data_control;
pub mod error;
pub mod fsm;
pub mod log;
pub mod message;
pub mod metadata;
pub mod metrics;
pub mod reader;
pub mod resilience;
pub mod sink;
pub mod source;
pub mod topology;
pub mod transport;
pub mod writer;

// Re-exports for convenience
pub use config::{ReplicationConfig, ReplicationSettings};
pub use data_control::{AutoDataControl, DataControl};
pub use error::{ErrorClass, ReplicationError, Result};
pub use fsm::{FsmObservers, ReplicationState};
pub use log::{LogAddress, LogEntry, MemoryLog, SharedLog, SqliteLog, StreamId, StreamUpdate, Transaction, NON_ADDRESS};
pub use message::{MessageKind, OpaqueEntry, ReplicationAck, ReplicationMessage};
pub use sink::SinkManager;
pub use source::SourceManager;
pub use topology::{ClusterDescriptor, ClusterRole, TopologyDescriptor};
pub use transport::{DataReceiver, DataSender, LocalDataSender};
