// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source side: owns the replication FSM for one remote cluster.
//!
//! # Lifecycle
//!
//! 1. [`SourceManager::new`] builds the readers and spawns the FSM in `INITIALIZED`
//! 2. [`start_replication`](SourceManager::start_replication) resumes log-entry
//!    sync if a completed snapshot is on record, otherwise runs a snapshot sync
//! 3. Failures park the FSM in `IN_REQUIRE_SNAPSHOT_SYNC` until data control
//!    accepts a resync
//! 4. [`shutdown`](SourceManager::shutdown) stops the FSM and joins it

use crate::config::ReplicationConfig;
use crate::data_control::DataControl;
use crate::error::{ReplicationError, Result};
use crate::fsm::{FsmObservers, FsmPublishers, ReplicationEvent, ReplicationFsm, ReplicationState, SnapshotReaderSlot, SyncContext};
use crate::log::SharedLog;
use crate::metadata::{PersistedReaderMetadata, ReaderMetadataSnapshot};
use crate::reader::{StreamsLogEntryReader, StreamsSnapshotReader};
use crate::transport::{DataSender, RateLimitedSender};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long [`SourceManager::shutdown`] waits for the FSM to exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Replicates the configured streams to one remote cluster.
pub struct SourceManager {
    config: ReplicationConfig,
    ctx: Arc<SyncContext>,
    observers: FsmObservers,
    fsm: Mutex<Option<JoinHandle<()>>>,
}

impl SourceManager {
    /// Build the readers and spawn the FSM. Must be called inside a tokio runtime.
    ///
    /// The config is validated when a sync is started, not here.
    pub fn new(
        config: ReplicationConfig,
        log: Arc<dyn SharedLog>,
        sender: Arc<dyn DataSender>,
        data_control: Arc<dyn DataControl>,
    ) -> Self {
        let rate_limit = config.settings.transport.rate_limit_config();
        if let Some(ref limit) = rate_limit {
            info!(
                remote = %config.remote_cluster_id,
                rate_per_sec = limit.refill_rate,
                burst = limit.burst_size,
                "Rate limiting enabled for replication traffic"
            );
        }
        let sender = RateLimitedSender::wrap(sender, rate_limit);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (publishers, observers) = FsmPublishers::new();
        let ctx = Arc::new(SyncContext::new(
            config.remote_cluster_id.clone(),
            config.settings.clone(),
            log.clone(),
            sender,
            SnapshotReaderSlot::new(Box::new(StreamsSnapshotReader::new(log.clone(), &config))),
            Box::new(StreamsLogEntryReader::new(log.clone(), &config)),
            PersistedReaderMetadata::new(log, &config.remote_cluster_id),
            publishers,
            events_tx,
        ));
        let fsm = ReplicationFsm::spawn(Arc::clone(&ctx), data_control, events_rx);

        Self {
            config,
            ctx,
            observers,
            fsm: Mutex::new(Some(fsm)),
        }
    }

    pub fn remote_cluster_id(&self) -> &str {
        &self.config.remote_cluster_id
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn state(&self) -> ReplicationState {
        *self.observers.state.borrow()
    }

    /// Watch channels for state and progress.
    pub fn observers(&self) -> FsmObservers {
        self.observers.clone()
    }

    /// Persisted source progress for this remote.
    pub async fn reader_metadata(&self) -> Result<ReaderMetadataSnapshot> {
        self.ctx.reader_metadata.snapshot().await
    }

    fn ensure_startable(&self) -> Result<()> {
        self.config.validate()?;
        let state = self.state();
        if state == ReplicationState::Stopped {
            return Err(ReplicationError::InvalidState {
                expected: "not STOPPED".to_string(),
                actual: state.to_string(),
            });
        }
        Ok(())
    }

    /// Start a full snapshot sync. Returns its session id.
    pub fn start_snapshot_sync(&self) -> Result<Uuid> {
        self.ensure_startable()?;
        let session = Uuid::new_v4();
        info!(remote = %self.config.remote_cluster_id, %session, "Snapshot sync requested");
        self.ctx.post(ReplicationEvent::SnapshotSyncRequest { session });
        Ok(session)
    }

    /// Start log-entry sync from the persisted position.
    pub async fn start_log_entry_sync(&self) -> Result<Uuid> {
        self.ensure_startable()?;
        let progress = self.reader_metadata().await?;
        Ok(self.request_log_entry_sync(&progress))
    }

    /// Resume log-entry sync when a snapshot has completed before, else snapshot.
    pub async fn start_replication(&self) -> Result<Uuid> {
        self.ensure_startable()?;
        let progress = self.reader_metadata().await?;
        if progress.can_resume() {
            Ok(self.request_log_entry_sync(&progress))
        } else {
            debug!(remote = %self.config.remote_cluster_id, "No completed snapshot on record");
            self.start_snapshot_sync()
        }
    }

    fn request_log_entry_sync(&self, progress: &ReaderMetadataSnapshot) -> Uuid {
        let session = Uuid::new_v4();
        info!(
            remote = %self.config.remote_cluster_id,
            %session,
            base = progress.last_snapshot_sync,
            resume_from = progress.resume_from(),
            "Log entry sync requested"
        );
        self.ctx.post(ReplicationEvent::LogEntrySyncRequest {
            session,
            base: progress.last_snapshot_sync,
            last_acked: progress.resume_from(),
        });
        session
    }

    /// Abandon the running sync; the FSM then asks data control for a snapshot.
    pub fn cancel_sync(&self) {
        self.ctx.post(ReplicationEvent::SyncCancel);
    }

    /// Adopt a new topology epoch. A running sync is abandoned.
    pub fn on_topology_change(&self, site_config_id: i64) {
        self.ctx.post(ReplicationEvent::TopologyChange { site_config_id });
    }

    /// Stop syncing and return to `INITIALIZED`.
    pub fn stop(&self) {
        self.ctx.post(ReplicationEvent::ReplicationStop);
    }

    /// Stop the FSM for good and wait for it to exit.
    pub async fn shutdown(&self) {
        info!(remote = %self.config.remote_cluster_id, "Shutting down replication");
        self.ctx.post(ReplicationEvent::ReplicationShutdown);

        let Some(handle) = self.fsm.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(())) => debug!("FSM exited"),
            Ok(Err(e)) => warn!(error = %e, "FSM task panicked"),
            Err(_) => warn!("FSM did not exit in time"),
        }
    }
}
