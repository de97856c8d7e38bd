// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data control: asking the application to re-trigger a snapshot sync.
//!
//! When a sync cannot continue (trimmed log, invalidated session, exhausted
//! retransmits) the FSM parks in `IN_REQUIRE_SNAPSHOT_SYNC` and calls
//! [`DataControl::request_snapshot_sync`]. The request may be lost; the FSM
//! re-sends it on a backoff timer until one is accepted.

use crate::log::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// Application callback for resync requests.
pub trait DataControl: Send + Sync + 'static {
    /// Ask for a snapshot sync towards `remote_cluster_id`.
    ///
    /// Resolving to `true` lets the FSM start the snapshot sync. A future
    /// that never resolves is a dropped request.
    fn request_snapshot_sync<'a>(&'a self, remote_cluster_id: &'a str) -> BoxFuture<'a, bool>;
}

/// Accepts every request, or refuses every request while paused.
#[derive(Debug)]
pub struct AutoDataControl {
    paused: AtomicBool,
    requests: AtomicU64,
}

impl Default for AutoDataControl {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoDataControl {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            requests: AtomicU64::new(0),
        }
    }

    /// Refuse requests until resumed.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Requests seen so far.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

impl DataControl for AutoDataControl {
    fn request_snapshot_sync<'a>(&'a self, remote_cluster_id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let accepted = !self.paused.load(Ordering::SeqCst);
            debug!(remote = %remote_cluster_id, accepted, "Snapshot sync requested");
            Ok(accepted)
        })
    }
}
