// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Destination-side writers.
//!
//! Both writers gate every apply on the persisted writer metadata and commit
//! the metadata update in the same transaction as the stream mutation, so a
//! redelivered or replayed message is detected and skipped after a crash.
//!
//! ```text
//! SNAPSHOT ──► StreamsSnapshotWriter ──► S' (shadow)
//!                                         │  SNAPSHOT_END: one tx
//!                                         ▼  clear S, copy S' → S, clear S'
//!                                         S (live)
//! LOG_ENTRY ─► LogEntryWriter ──────────► S (live)
//! ```

mod log_entry;
mod snapshot;

pub use log_entry::LogEntryWriter;
pub use snapshot::StreamsSnapshotWriter;

use crate::log::{shadow_name, StreamId, StreamUpdate, Transaction};
use std::collections::BTreeMap;
use tracing::warn;

/// Result of handing one message to a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Committed.
    Applied,
    /// Persisted metadata shows the message was already handled.
    Skipped,
    /// Held until the gap before it is filled.
    Buffered,
}

/// Live and shadow ids of the replicated streams, fixed for a writer's lifetime.
#[derive(Debug, Clone)]
pub(crate) struct ShadowMap {
    /// (name, live, shadow), ordered by name.
    streams: Vec<(String, StreamId, StreamId)>,
    live_to_shadow: BTreeMap<StreamId, StreamId>,
}

impl ShadowMap {
    pub(crate) fn new<'a>(names: impl IntoIterator<Item = &'a String>) -> Self {
        let mut streams: Vec<_> = names
            .into_iter()
            .map(|name| (name.clone(), StreamId::from_name(name), StreamId::from_name(&shadow_name(name))))
            .collect();
        streams.sort();
        let live_to_shadow = streams.iter().map(|(_, live, shadow)| (*live, *shadow)).collect();
        Self { streams, live_to_shadow }
    }

    pub(crate) fn streams(&self) -> &[(String, StreamId, StreamId)] {
        &self.streams
    }

    pub(crate) fn shadow_of(&self, live: &StreamId) -> Option<StreamId> {
        self.live_to_shadow.get(live).copied()
    }

    pub(crate) fn is_replicated(&self, live: &StreamId) -> bool {
        self.live_to_shadow.contains_key(live)
    }

    pub(crate) fn shadows(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.streams.iter().map(|(_, _, shadow)| *shadow)
    }
}

/// Stage updates onto configured streams, dropping streams this cluster does not replicate.
///
/// `target` maps a live id to the id the updates are written to. Returns
/// the number of updates staged.
pub(crate) fn stage_updates(
    tx: &mut Transaction,
    entries: BTreeMap<StreamId, Vec<StreamUpdate>>,
    remote: &str,
    target: impl Fn(&StreamId) -> Option<StreamId>,
) -> usize {
    let mut staged = 0;
    for (stream, updates) in entries {
        if updates.is_empty() {
            continue;
        }
        match target(&stream) {
            Some(id) => {
                staged += updates.len();
                tx.log_updates(id, updates);
            }
            None => {
                warn!(remote = %remote, stream = %stream, "Dropping updates for a stream not replicated here");
            }
        }
    }
    staged
}
