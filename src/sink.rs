// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Destination side: routes incoming messages to the writers and builds acks.

use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::log::{BoxFuture, SharedLog, NON_ADDRESS};
use crate::message::{MessageKind, ReplicationAck, ReplicationMessage};
use crate::metadata::WriterPhase;
use crate::metrics;
use crate::transport::DataReceiver;
use crate::writer::{LogEntryWriter, StreamsSnapshotWriter};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct SinkState {
    snapshot_writer: StreamsSnapshotWriter,
    log_entry_writer: LogEntryWriter,
    snapshot_session: Option<Uuid>,
    log_entry_session: Option<Uuid>,
}

/// Receives replication traffic from one source cluster.
///
/// `config.remote_cluster_id` names the source; the writer metadata table
/// is keyed by it. Messages are handled one at a time.
pub struct SinkManager {
    remote: String,
    topology_config_id: AtomicI64,
    state: Mutex<SinkState>,
}

impl SinkManager {
    pub fn new(log: Arc<dyn SharedLog>, config: &ReplicationConfig) -> Self {
        Self {
            remote: config.remote_cluster_id.clone(),
            topology_config_id: AtomicI64::new(0),
            state: Mutex::new(SinkState {
                snapshot_writer: StreamsSnapshotWriter::new(log.clone(), config),
                log_entry_writer: LogEntryWriter::new(log, config),
                snapshot_session: None,
                log_entry_session: None,
            }),
        }
    }

    /// Finish whatever a crash interrupted. Call before accepting traffic.
    ///
    /// Also restores the persisted topology epoch, unless a newer one was
    /// adopted already.
    pub async fn recover(&self) -> Result<WriterPhase> {
        let mut state = self.state.lock().await;
        let phase = state.snapshot_writer.recover().await?;
        let persisted = state.snapshot_writer.site_config_id();
        if persisted != NON_ADDRESS {
            let previous = self.topology_config_id.fetch_max(persisted, Ordering::SeqCst);
            if previous < persisted {
                debug!(remote = %self.remote, topology_config_id = persisted, "Restored topology epoch");
            }
        }
        info!(remote = %self.remote, phase = %phase, topology_config_id = self.topology_config_id(), "Sink recovered");
        Ok(phase)
    }

    pub fn topology_config_id(&self) -> i64 {
        self.topology_config_id.load(Ordering::SeqCst)
    }

    /// Adopt a new topology epoch. Messages stamped with another epoch are rejected.
    pub fn on_topology_change(&self, topology_config_id: i64) {
        let previous = self.topology_config_id.swap(topology_config_id, Ordering::SeqCst);
        if previous != topology_config_id {
            info!(remote = %self.remote, previous, topology_config_id, "Sink topology changed");
        }
    }

    async fn handle(&self, message: ReplicationMessage) -> Result<ReplicationAck> {
        let expected = self.topology_config_id();
        if message.site_config_id != expected {
            warn!(
                remote = %self.remote,
                expected,
                received = message.site_config_id,
                kind = %message.kind,
                "Rejecting message from another topology epoch"
            );
            metrics::record_writer_rejection(&self.remote, "site_config_mismatch");
            return Err(ReplicationError::SiteConfigMismatch {
                expected,
                received: message.site_config_id,
            });
        }

        let mut state = self.state.lock().await;
        match message.kind {
            MessageKind::Snapshot | MessageKind::SnapshotEnd => {
                if state.snapshot_session != Some(message.sync_request_id) {
                    state
                        .snapshot_writer
                        .reset(message.site_config_id, message.snapshot_timestamp)
                        .await?;
                    state.log_entry_writer.reset();
                    state.snapshot_session = Some(message.sync_request_id);
                    state.log_entry_session = None;
                    debug!(remote = %self.remote, session = %message.sync_request_id, "New snapshot session");
                }

                if message.kind == MessageKind::SnapshotEnd {
                    state.snapshot_writer.snapshot_transfer_done(&message).await?;
                    return Ok(ack(&message, message.sequence_number, message.snapshot_timestamp));
                }

                match state.snapshot_writer.apply(&message).await {
                    Ok(_) => {}
                    Err(e) if e.is_duplicate() => {
                        debug!(remote = %self.remote, seq = message.sequence_number, "Duplicate snapshot message");
                        metrics::record_writer_skip(&self.remote, "duplicate");
                    }
                    Err(e) => return Err(e),
                }
                let applied = state.snapshot_writer.recv_seq() - 1;
                Ok(ack(&message, applied, message.snapshot_timestamp))
            }
            MessageKind::LogEntry => {
                if state.log_entry_session != Some(message.sync_request_id) {
                    state.log_entry_writer.reset();
                    state.log_entry_session = Some(message.sync_request_id);
                    debug!(remote = %self.remote, session = %message.sync_request_id, "New log entry session");
                }
                let (_, last_processed) = state.log_entry_writer.apply(&message).await?;
                Ok(ack(&message, message.sequence_number, last_processed))
            }
        }
    }
}

fn ack(message: &ReplicationMessage, sequence_number: i64, timestamp: i64) -> ReplicationAck {
    ReplicationAck {
        sync_request_id: message.sync_request_id,
        kind: message.kind,
        snapshot_timestamp: message.snapshot_timestamp,
        sequence_number,
        timestamp,
    }
}

impl DataReceiver for SinkManager {
    fn receive(&self, message: ReplicationMessage) -> BoxFuture<'_, ReplicationAck> {
        Box::pin(self.handle(message))
    }
}
