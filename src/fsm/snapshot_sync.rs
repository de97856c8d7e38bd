// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot sync worker.
//!
//! Each cycle reads one batch from the snapshot reader, sends it, and
//! resends whatever the acks do not cover, in sequence order. The last
//! cycle sends `SNAPSHOT_END` and waits for the destination to confirm the
//! apply before the session completes.
//!
//! The reader lock is held for the whole cycle, so a newer session cannot
//! reset the reader while an older cycle is still sending.

use super::{ReplicationEvent, SyncContext};
use crate::error::{ReplicationError, Result};
use crate::log::LogAddress;
use crate::message::{MessageKind, ReplicationAck, ReplicationMessage};
use crate::metrics;
use crate::reader::SnapshotReader;
use crate::transport::{send_batch_with_timeout, send_with_timeout};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

/// The snapshot reader and the session it was last reset for.
pub(crate) struct SnapshotReaderSlot {
    reader: Box<dyn SnapshotReader>,
    session: Option<Uuid>,
}

impl SnapshotReaderSlot {
    pub fn new(reader: Box<dyn SnapshotReader>) -> Self {
        Self { reader, session: None }
    }
}

enum CycleOutcome {
    Continue,
    Complete { base: LogAddress },
    Cancelled,
}

/// Run one snapshot cycle and report the outcome to the FSM.
pub(crate) async fn run_cycle(ctx: Arc<SyncContext>, session: Uuid, cancel: watch::Receiver<bool>) {
    let span = info_span!("snapshot_sync", remote = %ctx.remote, %session);
    async move {
        match cycle(&ctx, session, &cancel).await {
            Ok(CycleOutcome::Continue) => ctx.post(ReplicationEvent::SnapshotSyncContinue { session }),
            Ok(CycleOutcome::Complete { base }) => {
                ctx.post(ReplicationEvent::SnapshotSyncComplete { session, base })
            }
            Ok(CycleOutcome::Cancelled) => debug!("Snapshot cycle cancelled"),
            Err(error) if *cancel.borrow() => debug!(error = %error, "Snapshot cycle stopped after cancel"),
            Err(error) => {
                warn!(error = %error, "Snapshot cycle failed");
                ctx.post(ReplicationEvent::SyncError { session, error });
            }
        }
    }
    .instrument(span)
    .await
}

async fn cycle(ctx: &SyncContext, session: Uuid, cancel: &watch::Receiver<bool>) -> Result<CycleOutcome> {
    let mut slot = ctx.snapshot_reader.lock().await;
    if *cancel.borrow() {
        return Ok(CycleOutcome::Cancelled);
    }
    let Some(info) = ctx.sessions.get(&session) else {
        return Ok(CycleOutcome::Cancelled);
    };
    let base = info.base_snapshot_timestamp;

    if slot.session != Some(session) {
        slot.reader.set_topology_config_id(ctx.site_config_id());
        slot.reader.reset(base);
        slot.session = Some(session);
    }

    let batch = slot.reader.read(session).await?;
    let sent = batch.messages.len();
    if sent > 0 {
        metrics::record_messages_sent(&ctx.remote, MessageKind::Snapshot.label(), sent);
        deliver_batch(ctx, batch.messages, cancel).await?;
        ctx.sessions.update(&session, |s| s.messages_sent += sent as i64);
    }
    if !batch.end_of_sync {
        trace!(sent, "Snapshot batch delivered");
        return Ok(CycleOutcome::Continue);
    }

    if *cancel.borrow() {
        return Ok(CycleOutcome::Cancelled);
    }
    let messages_sent = ctx
        .sessions
        .get(&session)
        .map(|s| s.messages_sent)
        .unwrap_or(info.messages_sent + sent as i64);
    let end = ReplicationMessage::snapshot_end(session, ctx.site_config_id(), base, messages_sent);
    metrics::record_messages_sent(&ctx.remote, MessageKind::SnapshotEnd.label(), 1);
    let ack = deliver(ctx, end, false, cancel).await?;
    ctx.publishers.record_ack(&ack, 1, false);
    metrics::record_messages_acked(&ctx.remote, MessageKind::SnapshotEnd.label(), 1);

    ctx.reader_metadata.record_snapshot_sync(base).await?;
    super::FsmPublishers::bump(&ctx.publishers.snapshot_syncs, 1);
    metrics::record_snapshot_sync_complete(&ctx.remote, messages_sent as u64 + 1, info.started_at.elapsed());
    slot.session = None;
    info!(base, messages = messages_sent, "Snapshot transferred and applied");
    Ok(CycleOutcome::Complete { base })
}

/// Send a batch, then resend uncovered messages one at a time in order.
async fn deliver_batch(
    ctx: &SyncContext,
    messages: Vec<ReplicationMessage>,
    cancel: &watch::Receiver<bool>,
) -> Result<()> {
    let timeout = ctx.settings.transport.message_timeout_duration();
    let mut acked = vec![false; messages.len()];

    match send_batch_with_timeout(ctx.sender.as_ref(), messages.clone(), timeout).await {
        Ok(results) => {
            for result in results {
                match result {
                    Ok(ack) => {
                        mark_covered(ctx, &messages, &mut acked, &ack);
                    }
                    Err(e) if e.is_retryable() => trace!(error = %e, "Snapshot message not applied"),
                    Err(e) => return Err(e),
                }
            }
        }
        Err(e) if e.is_retryable() => debug!(error = %e, "Snapshot batch not acknowledged"),
        Err(e) => return Err(e),
    }

    while let Some(index) = acked.iter().position(|done| !done) {
        let ack = deliver(ctx, messages[index].clone(), true, cancel).await?;
        mark_covered(ctx, &messages, &mut acked, &ack);
    }
    Ok(())
}

fn mark_covered(ctx: &SyncContext, messages: &[ReplicationMessage], acked: &mut [bool], ack: &ReplicationAck) {
    let mut newly = 0;
    for (message, done) in messages.iter().zip(acked.iter_mut()) {
        if !*done && ack.covers(message) {
            *done = true;
            newly += 1;
        }
    }
    if newly > 0 {
        ctx.publishers.record_ack(ack, newly, false);
        metrics::record_messages_acked(&ctx.remote, MessageKind::Snapshot.label(), newly as usize);
    }
}

/// Send `message` until an ack covers it.
///
/// `resend` marks the first attempt as a retransmit. Gives up with a
/// transport error after the configured number of retransmits, or with
/// [`ReplicationError::Shutdown`] once the session is cancelled.
async fn deliver(
    ctx: &SyncContext,
    message: ReplicationMessage,
    resend: bool,
    cancel: &watch::Receiver<bool>,
) -> Result<ReplicationAck> {
    let transport = &ctx.settings.transport;
    let timeout = transport.message_timeout_duration();
    let label = message.kind.label();
    let mut retransmits = 0u32;
    let mut is_retransmit = resend;

    loop {
        if *cancel.borrow() {
            return Err(ReplicationError::Shutdown);
        }
        if is_retransmit {
            if retransmits >= transport.max_retransmits {
                return Err(ReplicationError::transport(
                    &ctx.remote,
                    format!(
                        "{} seq {} unacknowledged after {} retransmits",
                        message.kind, message.sequence_number, retransmits
                    ),
                ));
            }
            retransmits += 1;
            metrics::record_retransmits(&ctx.remote, label, 1);
        }
        is_retransmit = true;

        match send_with_timeout(ctx.sender.as_ref(), message.clone(), timeout).await {
            Ok(ack) if ack.covers(&message) => return Ok(ack),
            Ok(ack) => {
                debug!(kind = label, seq = message.sequence_number, acked_seq = ack.sequence_number, "Ack does not cover message");
            }
            Err(e) if e.is_retryable() => {
                debug!(kind = label, seq = message.sequence_number, error = %e, "Send failed, retransmitting");
            }
            Err(e) => return Err(e),
        }
    }
}
