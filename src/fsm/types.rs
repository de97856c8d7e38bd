//! Replication FSM state, events and observers.
//!
//! # State Transitions
//!
//! ```text
//!                 start_snapshot_sync / start_replication
//!  INITIALIZED ─────────────────────────────┐
//!       │ start_log_entry_sync              ▼
//!       │ (or resume)            ┌──► IN_SNAPSHOT_SYNC ───┐
//!       ▼                        │          │ final ack   │
//!  IN_LOG_ENTRY_SYNC ◄───────────┼──────────┘             │
//!       │                        │ data control accepted  │ cancel / transport
//!       │ cancel / transport     │                        │ error / trim
//!       │ error / trim           │                        ▼
//!       └────────────────► IN_REQUIRE_SNAPSHOT_SYNC ◄─────┘
//!                          (re-requests on a backoff timer)
//!
//!  any state ── protocol violation / shutdown ──► STOPPED
//! ```
//!
//! # State Descriptions
//!
//! - **INITIALIZED**: no sync running. Also the state after `stop()`.
//! - **IN_SNAPSHOT_SYNC**: full transfer of the replicated streams as of a pinned address.
//! - **IN_LOG_ENTRY_SYNC**: incremental transfer after the last acknowledged address.
//! - **IN_REQUIRE_SNAPSHOT_SYNC**: waiting for data control to accept a resync request.
//! - **STOPPED**: terminal. Entered on protocol violations and shutdown.

use crate::error::{ErrorClass, ReplicationError};
use crate::log::LogAddress;
use crate::message::ReplicationAck;
use dashmap::DashMap;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// State of the replication FSM.
///
/// See module docs for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationState {
    Initialized,
    InSnapshotSync,
    InLogEntrySync,
    InRequireSnapshotSync,
    Stopped,
}

impl ReplicationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::InSnapshotSync => "IN_SNAPSHOT_SYNC",
            Self::InLogEntrySync => "IN_LOG_ENTRY_SYNC",
            Self::InRequireSnapshotSync => "IN_REQUIRE_SNAPSHOT_SYNC",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn is_syncing(&self) -> bool {
        matches!(self, Self::InSnapshotSync | Self::InLogEntrySync)
    }
}

impl std::fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to the FSM event loop.
#[derive(Debug)]
pub enum ReplicationEvent {
    /// Start (or restart) a snapshot sync under the given session id.
    SnapshotSyncRequest { session: Uuid },
    /// A snapshot cycle finished; schedule the next one.
    SnapshotSyncContinue { session: Uuid },
    /// The final snapshot ack arrived: data transferred and applied.
    SnapshotSyncComplete { session: Uuid, base: LogAddress },
    /// Start a log-entry sync resuming after `last_acked`.
    LogEntrySyncRequest {
        session: Uuid,
        base: LogAddress,
        last_acked: LogAddress,
    },
    /// Abandon the running sync and require a snapshot.
    SyncCancel,
    /// A worker of `session` failed.
    SyncError { session: Uuid, error: ReplicationError },
    /// Data control answered a resync request issued in wait `generation`.
    DataControlResponse { generation: u64, accepted: bool },
    /// Reschedule timer fired for the given wait generation.
    RescheduleTimer { generation: u64 },
    /// The topology epoch changed.
    TopologyChange { site_config_id: i64 },
    /// Stop syncing, back to INITIALIZED.
    ReplicationStop,
    /// Stop for good and exit the event loop.
    ReplicationShutdown,
}

impl ReplicationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SnapshotSyncRequest { .. } => "SNAPSHOT_SYNC_REQUEST",
            Self::SnapshotSyncContinue { .. } => "SNAPSHOT_SYNC_CONTINUE",
            Self::SnapshotSyncComplete { .. } => "SNAPSHOT_SYNC_COMPLETE",
            Self::LogEntrySyncRequest { .. } => "LOG_ENTRY_SYNC_REQUEST",
            Self::SyncCancel => "SYNC_CANCEL",
            Self::SyncError { .. } => "SYNC_ERROR",
            Self::DataControlResponse { .. } => "DATA_CONTROL_RESPONSE",
            Self::RescheduleTimer { .. } => "RESCHEDULE_TIMER",
            Self::TopologyChange { .. } => "TOPOLOGY_CHANGE",
            Self::ReplicationStop => "REPLICATION_STOP",
            Self::ReplicationShutdown => "REPLICATION_SHUTDOWN",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sessions
// ═══════════════════════════════════════════════════════════════════════════════

/// Which sync a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Snapshot,
    LogEntry,
}

/// One sync run.
#[derive(Debug, Clone)]
pub struct SyncSession {
    pub sync_request_id: Uuid,
    pub kind: SyncKind,
    /// Address the snapshot is consistent as of.
    pub base_snapshot_timestamp: LogAddress,
    pub last_acked_timestamp: LogAddress,
    pub messages_sent: i64,
    pub started_at: Instant,
}

impl SyncSession {
    pub fn new(sync_request_id: Uuid, kind: SyncKind, base: LogAddress, last_acked: LogAddress) -> Self {
        Self {
            sync_request_id,
            kind,
            base_snapshot_timestamp: base,
            last_acked_timestamp: last_acked,
            messages_sent: 0,
            started_at: Instant::now(),
        }
    }
}

/// Live sessions of one FSM.
///
/// The FSM creates and removes sessions; its workers update progress.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, SyncSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: SyncSession) {
        self.sessions.insert(session.sync_request_id, session);
    }

    pub fn remove(&self, id: &Uuid) -> Option<SyncSession> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn get(&self, id: &Uuid) -> Option<SyncSession> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.sessions.contains_key(id)
    }

    /// Apply `f` to a live session. Returns false if it is gone.
    pub fn update(&self, id: &Uuid, f: impl FnOnce(&mut SyncSession)) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                f(&mut session);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Observers
// ═══════════════════════════════════════════════════════════════════════════════

/// Capacity of the transition history channel.
const TRANSITION_HISTORY: usize = 64;

/// Watchable FSM progress, for tests and health checks.
///
/// Each field is a `watch` receiver; `wait_for` on it blocks until a
/// predicate holds. A `watch` only keeps the latest value, so callers that
/// need every intermediate state use [`FsmObservers::transitions`].
#[derive(Debug, Clone)]
pub struct FsmObservers {
    pub state: watch::Receiver<ReplicationState>,
    /// Log-entry messages acknowledged.
    pub log_entry_acks: watch::Receiver<u64>,
    /// Snapshot messages (including SNAPSHOT_END) acknowledged.
    pub snapshot_acks: watch::Receiver<u64>,
    pub last_ack: watch::Receiver<Option<ReplicationAck>>,
    pub errors: watch::Receiver<u64>,
    pub last_error_class: watch::Receiver<Option<ErrorClass>>,
    /// Resync requests issued to data control.
    pub data_control_calls: watch::Receiver<u64>,
    /// Resync requests re-sent by the reschedule timer.
    pub reschedules: watch::Receiver<u64>,
    /// Log-entry sync has sent and acknowledged everything in the log.
    pub caught_up: watch::Receiver<bool>,
    /// Completed snapshot syncs.
    pub snapshot_syncs: watch::Receiver<u64>,
    transitions: broadcast::Sender<(ReplicationState, ReplicationState)>,
}

impl FsmObservers {
    /// Every `(from, to)` transition made after this call.
    pub fn transitions(&self) -> broadcast::Receiver<(ReplicationState, ReplicationState)> {
        self.transitions.subscribe()
    }
}

/// Sending half of [`FsmObservers`], shared by the FSM and its workers.
#[derive(Debug)]
pub struct FsmPublishers {
    pub state: watch::Sender<ReplicationState>,
    pub log_entry_acks: watch::Sender<u64>,
    pub snapshot_acks: watch::Sender<u64>,
    pub last_ack: watch::Sender<Option<ReplicationAck>>,
    pub errors: watch::Sender<u64>,
    pub last_error_class: watch::Sender<Option<ErrorClass>>,
    pub data_control_calls: watch::Sender<u64>,
    pub reschedules: watch::Sender<u64>,
    pub caught_up: watch::Sender<bool>,
    pub snapshot_syncs: watch::Sender<u64>,
    pub transitions: broadcast::Sender<(ReplicationState, ReplicationState)>,
}

impl FsmPublishers {
    pub fn new() -> (Self, FsmObservers) {
        let (state, state_rx) = watch::channel(ReplicationState::Initialized);
        let (log_entry_acks, log_entry_acks_rx) = watch::channel(0);
        let (snapshot_acks, snapshot_acks_rx) = watch::channel(0);
        let (last_ack, last_ack_rx) = watch::channel(None);
        let (errors, errors_rx) = watch::channel(0);
        let (last_error_class, last_error_class_rx) = watch::channel(None);
        let (data_control_calls, data_control_calls_rx) = watch::channel(0);
        let (reschedules, reschedules_rx) = watch::channel(0);
        let (caught_up, caught_up_rx) = watch::channel(false);
        let (snapshot_syncs, snapshot_syncs_rx) = watch::channel(0);
        let (transitions, _) = broadcast::channel(TRANSITION_HISTORY);

        let publishers = Self {
            state,
            log_entry_acks,
            snapshot_acks,
            last_ack,
            errors,
            last_error_class,
            data_control_calls,
            reschedules,
            caught_up,
            snapshot_syncs,
            transitions: transitions.clone(),
        };
        let observers = FsmObservers {
            state: state_rx,
            log_entry_acks: log_entry_acks_rx,
            snapshot_acks: snapshot_acks_rx,
            last_ack: last_ack_rx,
            errors: errors_rx,
            last_error_class: last_error_class_rx,
            data_control_calls: data_control_calls_rx,
            reschedules: reschedules_rx,
            caught_up: caught_up_rx,
            snapshot_syncs: snapshot_syncs_rx,
            transitions,
        };
        (publishers, observers)
    }

    pub(crate) fn bump(counter: &watch::Sender<u64>, by: u64) {
        counter.send_modify(|value| *value += by);
    }

    pub(crate) fn record_ack(&self, ack: &ReplicationAck, acked: u64, log_entry: bool) {
        if log_entry {
            Self::bump(&self.log_entry_acks, acked);
        } else {
            Self::bump(&self.snapshot_acks, acked);
        }
        self.last_ack.send_replace(Some(ack.clone()));
    }

    pub(crate) fn set_caught_up(&self, caught_up: bool) {
        self.caught_up.send_if_modified(|value| {
            let changed = *value != caught_up;
            *value = caught_up;
            changed
        });
    }
}
