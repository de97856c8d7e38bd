// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication state machine for one remote cluster.
//!
//! A single actor task owns the state and consumes [`ReplicationEvent`]s from
//! an unbounded queue. Sync work runs in spawned workers that report back
//! through the same queue, tagging every event with their session id; the
//! actor drops events from sessions it has already abandoned.
//!
//! | Worker | Lifetime | Module |
//! |--------|----------|--------|
//! | Snapshot cycle | one batch, then `SNAPSHOT_SYNC_CONTINUE` | [`snapshot_sync`] |
//! | Log-entry tailer | until cancelled or failed | [`log_entry_sync`] |
//! | Data control request | until answered or the wait ends | here |
//! | Reschedule timer | one backoff delay | here |

mod log_entry_sync;
mod snapshot_sync;
mod types;

pub use types::{
    FsmObservers, FsmPublishers, ReplicationEvent, ReplicationState, SessionRegistry, SyncKind,
    SyncSession,
};

pub(crate) use snapshot_sync::SnapshotReaderSlot;

use crate::config::ReplicationSettings;
use crate::data_control::DataControl;
use crate::error::{ErrorClass, ReplicationError};
use crate::log::{LogAddress, SharedLog, NON_ADDRESS};
use crate::metadata::PersistedReaderMetadata;
use crate::metrics;
use crate::reader::LogEntryReader;
use crate::resilience::RetryConfig;
use crate::transport::DataSender;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

/// Everything the FSM shares with its workers.
pub(crate) struct SyncContext {
    pub remote: String,
    pub settings: ReplicationSettings,
    pub log: Arc<dyn SharedLog>,
    pub sender: Arc<dyn DataSender>,
    pub snapshot_reader: Mutex<SnapshotReaderSlot>,
    pub log_entry_reader: Mutex<Box<dyn LogEntryReader>>,
    pub reader_metadata: PersistedReaderMetadata,
    pub sessions: SessionRegistry,
    pub publishers: FsmPublishers,
    site_config_id: AtomicI64,
    events: mpsc::UnboundedSender<ReplicationEvent>,
}

impl SyncContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: String,
        settings: ReplicationSettings,
        log: Arc<dyn SharedLog>,
        sender: Arc<dyn DataSender>,
        snapshot_reader: SnapshotReaderSlot,
        log_entry_reader: Box<dyn LogEntryReader>,
        reader_metadata: PersistedReaderMetadata,
        publishers: FsmPublishers,
        events: mpsc::UnboundedSender<ReplicationEvent>,
    ) -> Self {
        Self {
            remote,
            settings,
            log,
            sender,
            snapshot_reader: Mutex::new(snapshot_reader),
            log_entry_reader: Mutex::new(log_entry_reader),
            reader_metadata,
            sessions: SessionRegistry::new(),
            publishers,
            site_config_id: AtomicI64::new(0),
            events,
        }
    }

    /// Queue an event for the FSM.
    pub fn post(&self, event: ReplicationEvent) {
        let name = event.name();
        if self.events.send(event).is_err() {
            debug!(remote = %self.remote, event = name, "FSM gone, dropping event");
        }
    }

    pub fn site_config_id(&self) -> i64 {
        self.site_config_id.load(Ordering::SeqCst)
    }

    fn set_site_config_id(&self, id: i64) {
        self.site_config_id.store(id, Ordering::SeqCst);
    }
}

/// The running sync.
struct ActiveSync {
    session: Uuid,
    kind: SyncKind,
    cancel: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
}

/// Parked in `IN_REQUIRE_SNAPSHOT_SYNC`.
struct SnapshotWait {
    generation: u64,
    attempts: usize,
    /// The outstanding data-control request; replaced on every reschedule.
    request: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl SnapshotWait {
    fn abort(self) {
        for task in [self.request, self.timer].into_iter().flatten() {
            task.abort();
        }
    }
}

enum Flow {
    Continue,
    Exit,
}

/// Actor owning the replication state.
pub(crate) struct ReplicationFsm {
    ctx: Arc<SyncContext>,
    data_control: Arc<dyn DataControl>,
    retry: RetryConfig,
    state: ReplicationState,
    active: Option<ActiveSync>,
    /// Cancelled workers still finishing their current step.
    retired: Vec<JoinHandle<()>>,
    wait: Option<SnapshotWait>,
    generation: u64,
}

impl ReplicationFsm {
    /// Spawn the actor. It runs until it sees `REPLICATION_SHUTDOWN`.
    pub fn spawn(
        ctx: Arc<SyncContext>,
        data_control: Arc<dyn DataControl>,
        events: mpsc::UnboundedReceiver<ReplicationEvent>,
    ) -> JoinHandle<()> {
        let retry = ctx.settings.data_control.retry_config();
        let span = info_span!("replication_fsm", remote = %ctx.remote);
        let fsm = Self {
            ctx,
            data_control,
            retry,
            state: ReplicationState::Initialized,
            active: None,
            retired: Vec::new(),
            wait: None,
            generation: 0,
        };
        tokio::spawn(fsm.run(events).instrument(span))
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ReplicationEvent>) {
        info!("Replication FSM started");
        metrics::set_fsm_state(&self.ctx.remote, self.state.as_str());

        while let Some(event) = events.recv().await {
            trace!(event = event.name(), state = %self.state, "Handling event");
            if let Flow::Exit = self.handle(event).await {
                break;
            }
        }

        self.cancel_active();
        self.leave_wait();
        for worker in self.retired.drain(..) {
            if let Err(e) = worker.await {
                warn!(error = %e, "Sync worker panicked");
            }
        }
        info!(state = %self.state, "Replication FSM exited");
    }

    async fn handle(&mut self, event: ReplicationEvent) -> Flow {
        if self.state == ReplicationState::Stopped {
            if let ReplicationEvent::ReplicationShutdown = event {
                return Flow::Exit;
            }
            debug!(event = event.name(), "FSM stopped, ignoring event");
            return Flow::Continue;
        }

        match event {
            ReplicationEvent::SnapshotSyncRequest { session } => {
                self.cancel_active();
                self.leave_wait();
                self.start_snapshot_sync(session).await;
            }
            ReplicationEvent::SnapshotSyncContinue { session } => {
                if self.is_active(&session, SyncKind::Snapshot) {
                    self.spawn_snapshot_cycle();
                } else {
                    trace!(%session, "Dropping continue of abandoned snapshot session");
                }
            }
            ReplicationEvent::SnapshotSyncComplete { session, base } => {
                if self.is_active(&session, SyncKind::Snapshot) {
                    info!(%session, base, "Snapshot sync complete");
                    self.cancel_active();
                    self.start_log_entry_sync(Uuid::new_v4(), base, base);
                } else {
                    trace!(%session, "Dropping completion of abandoned snapshot session");
                }
            }
            ReplicationEvent::LogEntrySyncRequest {
                session,
                base,
                last_acked,
            } => {
                self.cancel_active();
                self.leave_wait();
                self.start_log_entry_sync(session, base, last_acked);
            }
            ReplicationEvent::SyncCancel => {
                if self.state.is_syncing() {
                    info!("Sync cancelled");
                    self.require_snapshot_sync();
                }
            }
            ReplicationEvent::SyncError { session, error } => {
                if self.active.as_ref().map(|a| a.session) == Some(session) {
                    self.on_error(error);
                } else {
                    debug!(%session, error = %error, "Dropping error of abandoned session");
                }
            }
            ReplicationEvent::DataControlResponse { generation, accepted } => {
                self.on_data_control_response(generation, accepted).await;
            }
            ReplicationEvent::RescheduleTimer { generation } => {
                self.on_reschedule(generation);
            }
            ReplicationEvent::TopologyChange { site_config_id } => {
                let previous = self.ctx.site_config_id();
                self.ctx.set_site_config_id(site_config_id);
                info!(previous, site_config_id, "Topology changed");
                if self.state.is_syncing() && previous != site_config_id {
                    self.require_snapshot_sync();
                }
            }
            ReplicationEvent::ReplicationStop => {
                self.cancel_active();
                self.leave_wait();
                self.transition(ReplicationState::Initialized);
            }
            ReplicationEvent::ReplicationShutdown => {
                self.cancel_active();
                self.leave_wait();
                self.transition(ReplicationState::Stopped);
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    fn is_active(&self, session: &Uuid, kind: SyncKind) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.session == *session && a.kind == kind)
    }

    fn transition(&mut self, to: ReplicationState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!(from = %from, to = %to, "FSM transition");
        self.state = to;
        metrics::record_fsm_transition(&self.ctx.remote, from.as_str(), to.as_str());
        metrics::set_fsm_state(&self.ctx.remote, to.as_str());
        self.ctx.publishers.state.send_replace(to);
        // No subscribers is fine.
        let _ = self.ctx.publishers.transitions.send((from, to));
    }

    // ───────────────────────────────────────────────────────────────────────
    // Sessions
    // ───────────────────────────────────────────────────────────────────────

    async fn start_snapshot_sync(&mut self, session: Uuid) {
        let base = match self.ctx.log.log_tail().await {
            Ok(tail) => tail,
            Err(e) => {
                self.on_error(e);
                return;
            }
        };
        info!(%session, base, "Starting snapshot sync");
        self.ctx
            .sessions
            .insert(SyncSession::new(session, SyncKind::Snapshot, base, NON_ADDRESS));
        self.ctx.publishers.set_caught_up(false);
        self.activate(session, SyncKind::Snapshot);
        self.transition(ReplicationState::InSnapshotSync);
        self.spawn_snapshot_cycle();
    }

    fn start_log_entry_sync(&mut self, session: Uuid, base: LogAddress, last_acked: LogAddress) {
        info!(%session, base, last_acked, "Starting log entry sync");
        self.ctx
            .sessions
            .insert(SyncSession::new(session, SyncKind::LogEntry, base, last_acked));
        self.activate(session, SyncKind::LogEntry);
        self.transition(ReplicationState::InLogEntrySync);

        if let Some(active) = self.active.as_mut() {
            let ctx = Arc::clone(&self.ctx);
            let cancel = active.cancel.subscribe();
            active.worker = Some(tokio::spawn(log_entry_sync::run(ctx, session, cancel)));
        }
    }

    fn activate(&mut self, session: Uuid, kind: SyncKind) {
        let (cancel, _) = watch::channel(false);
        self.active = Some(ActiveSync {
            session,
            kind,
            cancel,
            worker: None,
        });
    }

    fn spawn_snapshot_cycle(&mut self) {
        if let Some(active) = self.active.as_mut() {
            let ctx = Arc::clone(&self.ctx);
            let cancel = active.cancel.subscribe();
            let session = active.session;
            active.worker = Some(tokio::spawn(snapshot_sync::run_cycle(ctx, session, cancel)));
        }
    }

    /// Abandon the running sync. Its pending events are dropped on arrival.
    ///
    /// The worker is not interrupted: it sees the flag at its next check and
    /// returns, so a commit or send already under way completes.
    fn cancel_active(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(session = %active.session, kind = ?active.kind, "Cancelling sync session");
            active.cancel.send_replace(true);
            self.retired.retain(|worker| !worker.is_finished());
            if let Some(worker) = active.worker {
                self.retired.push(worker);
            }
            self.ctx.sessions.remove(&active.session);
        }
    }

    fn on_error(&mut self, error: ReplicationError) {
        let class = error.class();
        metrics::record_error(&self.ctx.remote, class.as_str());
        FsmPublishers::bump(&self.ctx.publishers.errors, 1);
        self.ctx.publishers.last_error_class.send_replace(Some(class));

        match class {
            ErrorClass::ProtocolViolation | ErrorClass::Fatal | ErrorClass::Input => {
                error!(error = %error, class = ?class, "Replication stopped");
                self.cancel_active();
                self.leave_wait();
                self.transition(ReplicationState::Stopped);
            }
            ErrorClass::Transient | ErrorClass::TrimInduced | ErrorClass::SessionInvalidated => {
                warn!(error = %error, class = ?class, "Sync failed, snapshot sync required");
                self.require_snapshot_sync();
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Waiting for data control
    // ───────────────────────────────────────────────────────────────────────

    fn require_snapshot_sync(&mut self) {
        self.cancel_active();
        if self.state == ReplicationState::InRequireSnapshotSync && self.wait.is_some() {
            return;
        }
        self.leave_wait();
        self.transition(ReplicationState::InRequireSnapshotSync);

        self.generation += 1;
        self.wait = Some(SnapshotWait {
            generation: self.generation,
            attempts: 1,
            request: None,
            timer: None,
        });
        self.request_snapshot_sync();
        self.arm_reschedule_timer();
    }

    fn request_snapshot_sync(&mut self) {
        let Some(wait) = self.wait.as_mut() else { return };
        // An unanswered request is presumed lost.
        if let Some(previous) = wait.request.take() {
            previous.abort();
        }

        FsmPublishers::bump(&self.ctx.publishers.data_control_calls, 1);
        let ctx = Arc::clone(&self.ctx);
        let data_control = Arc::clone(&self.data_control);
        let generation = wait.generation;
        let attempt = wait.attempts;
        debug!(generation, attempt, "Requesting snapshot sync from data control");

        wait.request = Some(tokio::spawn(async move {
            match data_control.request_snapshot_sync(&ctx.remote).await {
                Ok(accepted) => ctx.post(ReplicationEvent::DataControlResponse { generation, accepted }),
                Err(e) => {
                    warn!(remote = %ctx.remote, error = %e, "Data control request failed");
                    metrics::record_data_control_request(&ctx.remote, "error");
                }
            }
        }));
    }

    fn arm_reschedule_timer(&mut self) {
        let Some(wait) = self.wait.as_mut() else { return };
        let delay = self.retry.delay_for_attempt(wait.attempts);
        let generation = wait.generation;
        let ctx = Arc::clone(&self.ctx);
        wait.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            ctx.post(ReplicationEvent::RescheduleTimer { generation });
        }));
    }

    fn on_reschedule(&mut self, generation: u64) {
        let current = self.wait.as_ref().map(|w| w.generation);
        if self.state != ReplicationState::InRequireSnapshotSync || current != Some(generation) {
            trace!(generation, "Dropping stale reschedule timer");
            return;
        }
        if let Some(wait) = self.wait.as_mut() {
            wait.attempts += 1;
            info!(attempt = wait.attempts, "No answer from data control, re-requesting snapshot sync");
        }
        FsmPublishers::bump(&self.ctx.publishers.reschedules, 1);
        metrics::record_snapshot_sync_reschedule(&self.ctx.remote);
        self.request_snapshot_sync();
        self.arm_reschedule_timer();
    }

    async fn on_data_control_response(&mut self, generation: u64, accepted: bool) {
        let current = self.wait.as_ref().map(|w| w.generation);
        if self.state != ReplicationState::InRequireSnapshotSync || current != Some(generation) {
            trace!(generation, accepted, "Dropping stale data control response");
            return;
        }
        if !accepted {
            metrics::record_data_control_request(&self.ctx.remote, "refused");
            debug!("Data control refused snapshot sync, waiting for reschedule");
            return;
        }
        metrics::record_data_control_request(&self.ctx.remote, "accepted");
        self.leave_wait();
        self.start_snapshot_sync(Uuid::new_v4()).await;
    }

    fn leave_wait(&mut self) {
        if let Some(wait) = self.wait.take() {
            wait.abort();
        }
    }
}
