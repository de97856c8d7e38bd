// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Log-entry sync worker: tails the log and pipelines sends.
//!
//! Up to `max_in_flight` messages are outstanding at once. Acks are
//! cumulative, so one ack may release several pending messages. When every
//! in-flight send has finished but some messages are still unacknowledged,
//! the whole pending window is resent in order; the destination skips what
//! it already applied and buffers what arrives early.
//!
//! Progress is persisted at most once per `progress_flush_interval` while
//! acks stream in, and always before the tailer reports itself caught up.
//! Progress lost to a crash is redelivered and skipped by the destination.

use super::{ReplicationEvent, SyncContext};
use crate::error::{ReplicationError, Result};
use crate::message::{MessageKind, ReplicationAck, ReplicationMessage};
use crate::metrics;
use crate::resilience::Bulkhead;
use crate::transport::{send_with_timeout, DataSender};
use futures::stream::{FuturesOrdered, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

/// Run the tailer for `session` until it is cancelled or fails.
pub(crate) async fn run(ctx: Arc<SyncContext>, session: Uuid, mut cancel: watch::Receiver<bool>) {
    let span = info_span!("log_entry_sync", remote = %ctx.remote, %session);
    async move {
        info!("Starting log entry tailer");
        match tail(&ctx, session, &mut cancel).await {
            Ok(()) => debug!("Log entry tailer stopped"),
            Err(error) if *cancel.borrow() => debug!(error = %error, "Log entry tailer stopped after cancel"),
            Err(error) => {
                warn!(error = %error, "Log entry sync failed");
                ctx.post(ReplicationEvent::SyncError { session, error });
            }
        }
    }
    .instrument(span)
    .await
}

async fn send_one(
    sender: Arc<dyn DataSender>,
    message: ReplicationMessage,
    timeout: Duration,
    _permit: OwnedSemaphorePermit,
) -> Result<ReplicationAck> {
    send_with_timeout(sender.as_ref(), message, timeout).await
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    // A closed channel means the FSM is gone.
    let _ = cancel.wait_for(|c| *c).await;
}

async fn tail(ctx: &SyncContext, session: Uuid, cancel: &mut watch::Receiver<bool>) -> Result<()> {
    let Some(info) = ctx.sessions.get(&session) else {
        return Ok(());
    };
    let mut reader = ctx.log_entry_reader.lock().await;
    if *cancel.borrow() {
        return Ok(());
    }
    reader.set_topology_config_id(ctx.site_config_id());
    reader.reset(info.base_snapshot_timestamp, info.last_acked_timestamp);
    ctx.publishers.set_caught_up(false);

    let settings = &ctx.settings;
    let max_in_flight = settings.log_entry.max_in_flight.max(1);
    let max_retransmits = settings.transport.max_retransmits as usize;
    let timeout = settings.transport.message_timeout_duration();
    let poll_interval = settings.log_entry.poll_interval_duration();
    let flush_interval = settings.log_entry.progress_flush_interval_duration();
    let label = MessageKind::LogEntry.label();

    let window = Bulkhead::for_in_flight(max_in_flight);
    let mut pending: VecDeque<ReplicationMessage> = VecDeque::with_capacity(max_in_flight);
    let mut in_flight = FuturesOrdered::new();
    let mut last_acked = info.last_acked_timestamp.max(info.base_snapshot_timestamp);
    let mut persisted = last_acked;
    let mut next_flush = Instant::now();
    let mut retransmit_rounds = 0usize;
    let mut noise_reported = false;

    loop {
        if *cancel.borrow() {
            return Ok(());
        }

        while pending.len() < max_in_flight {
            let Some(permit) = window.try_acquire() else { break };
            let Some(message) = reader.read(session).await? else { break };
            ctx.publishers.set_caught_up(false);
            trace!(timestamp = message.timestamp, previous = message.previous_timestamp, "Sending log entry");
            metrics::record_messages_sent(&ctx.remote, label, 1);
            pending.push_back(message.clone());
            in_flight.push_back(send_one(Arc::clone(&ctx.sender), message, timeout, permit));
        }
        if reader.has_noise_data() && !noise_reported {
            debug!("Log contains entries outside the replicated streams");
            metrics::record_noise_entries(&ctx.remote, 1);
            noise_reported = true;
        }

        if in_flight.is_empty() {
            if !pending.is_empty() {
                retransmit_rounds += 1;
                if retransmit_rounds > max_retransmits {
                    return Err(ReplicationError::transport(
                        &ctx.remote,
                        format!(
                            "log entries after {last_acked} unacknowledged after {max_retransmits} retransmits"
                        ),
                    ));
                }
                debug!(pending = pending.len(), round = retransmit_rounds, "Retransmitting pending log entries");
                metrics::record_retransmits(&ctx.remote, label, pending.len());
                for message in &pending {
                    let Some(permit) = window.try_acquire() else { break };
                    in_flight.push_back(send_one(Arc::clone(&ctx.sender), message.clone(), timeout, permit));
                }
                continue;
            }

            if last_acked > persisted {
                ctx.reader_metadata.record_log_entry_sync(last_acked).await?;
                persisted = last_acked;
            }
            ctx.publishers.set_caught_up(true);
            metrics::set_log_entry_lag(&ctx.remote, 0);
            tokio::select! {
                _ = cancelled(cancel) => return Ok(()),
                _ = tokio::time::sleep(poll_interval) => {}
            }
            continue;
        }

        tokio::select! {
            biased;
            _ = cancelled(cancel) => return Ok(()),
            Some(result) = in_flight.next() => match result {
                Ok(ack) => {
                    let mut released = 0u64;
                    while let Some(front) = pending.front() {
                        if !ack.covers(front) {
                            break;
                        }
                        last_acked = last_acked.max(front.timestamp);
                        pending.pop_front();
                        released += 1;
                    }
                    if released > 0 {
                        retransmit_rounds = 0;
                        ctx.sessions.update(&session, |s| {
                            s.last_acked_timestamp = last_acked;
                            s.messages_sent += released as i64;
                        });
                        if Instant::now() >= next_flush {
                            ctx.reader_metadata.record_log_entry_sync(last_acked).await?;
                            persisted = last_acked;
                            next_flush = Instant::now() + flush_interval;
                            let tail = ctx.log.log_tail().await?;
                            metrics::set_log_entry_lag(&ctx.remote, (tail - last_acked).max(0));
                        }
                        ctx.publishers.record_ack(&ack, released, true);
                        metrics::record_messages_acked(&ctx.remote, label, released as usize);
                    }
                }
                Err(e) if e.is_retryable() => {
                    trace!(error = %e, "Log entry send failed");
                }
                Err(e) => return Err(e),
            },
        }
    }
}
