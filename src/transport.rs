// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport boundary between source and destination.
//!
//! The source pushes messages through a [`DataSender`]; the destination
//! answers through a [`DataReceiver`]. Both are object-safe traits with
//! boxed futures so any RPC layer can sit in between.
//!
//! A send whose future never resolves models a dropped message: callers
//! bound every send with [`send_with_timeout`] and retransmit.

use crate::error::{ReplicationError, Result};
use crate::log::BoxFuture;
use crate::message::{ReplicationAck, ReplicationMessage};
use crate::resilience::{RateLimitConfig, RateLimiter};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Destination-facing boundary.
///
/// Implementations must preserve message order within a session.
pub trait DataReceiver: Send + Sync + 'static {
    fn receive(&self, message: ReplicationMessage) -> BoxFuture<'_, ReplicationAck>;

    /// One result per message, in order.
    fn receive_batch(&self, messages: Vec<ReplicationMessage>) -> BoxFuture<'_, Vec<Result<ReplicationAck>>> {
        Box::pin(async move {
            let mut results = Vec::with_capacity(messages.len());
            for message in messages {
                results.push(self.receive(message).await);
            }
            Ok(results)
        })
    }
}

/// Source-facing boundary.
pub trait DataSender: Send + Sync + 'static {
    fn send(&self, message: ReplicationMessage) -> BoxFuture<'_, ReplicationAck>;

    fn send_batch(&self, messages: Vec<ReplicationMessage>) -> BoxFuture<'_, Vec<Result<ReplicationAck>>> {
        Box::pin(async move {
            let mut results = Vec::with_capacity(messages.len());
            for message in messages {
                results.push(self.send(message).await);
            }
            Ok(results)
        })
    }
}

/// Send one message, failing with [`ReplicationError::Timeout`] if no ack arrives in time.
pub async fn send_with_timeout(
    sender: &dyn DataSender,
    message: ReplicationMessage,
    timeout: Duration,
) -> Result<ReplicationAck> {
    let label = format!("{} seq {}", message.kind, message.sequence_number);
    match tokio::time::timeout(timeout, sender.send(message)).await {
        Ok(result) => result,
        Err(_) => Err(ReplicationError::Timeout(label)),
    }
}

/// Send a batch, failing as a whole if it does not complete in time.
pub async fn send_batch_with_timeout(
    sender: &dyn DataSender,
    messages: Vec<ReplicationMessage>,
    timeout: Duration,
) -> Result<Vec<Result<ReplicationAck>>> {
    let count = messages.len();
    match tokio::time::timeout(timeout, sender.send_batch(messages)).await {
        Ok(result) => result,
        Err(_) => Err(ReplicationError::Timeout(format!("batch of {count} messages"))),
    }
}

/// In-process transport straight into a receiver.
///
/// Messages go through the wire encoding on the way, so payload and
/// framing bugs surface in local tests too.
pub struct LocalDataSender {
    receiver: Arc<dyn DataReceiver>,
    encode: bool,
}

impl LocalDataSender {
    pub fn new(receiver: Arc<dyn DataReceiver>) -> Self {
        Self { receiver, encode: true }
    }

    /// Hand messages over without encoding them.
    pub fn without_encoding(receiver: Arc<dyn DataReceiver>) -> Self {
        Self { receiver, encode: false }
    }

    fn wire(&self, message: ReplicationMessage) -> Result<ReplicationMessage> {
        if self.encode {
            ReplicationMessage::from_bytes(&message.to_bytes()?)
        } else {
            Ok(message)
        }
    }
}

impl DataSender for LocalDataSender {
    fn send(&self, message: ReplicationMessage) -> BoxFuture<'_, ReplicationAck> {
        Box::pin(async move {
            let message = self.wire(message)?;
            trace!(kind = %message.kind, seq = message.sequence_number, "Local send");
            self.receiver.receive(message).await
        })
    }

    fn send_batch(&self, messages: Vec<ReplicationMessage>) -> BoxFuture<'_, Vec<Result<ReplicationAck>>> {
        Box::pin(async move {
            let messages = messages
                .into_iter()
                .map(|m| self.wire(m))
                .collect::<Result<Vec<_>>>()?;
            self.receiver.receive_batch(messages).await
        })
    }
}

/// Throttles another sender with a token bucket, one token per message.
pub struct RateLimitedSender {
    inner: Arc<dyn DataSender>,
    limiter: RateLimiter,
}

impl RateLimitedSender {
    pub fn new(inner: Arc<dyn DataSender>, config: RateLimitConfig) -> Self {
        Self {
            inner,
            limiter: RateLimiter::new(config),
        }
    }

    /// Wrap `inner` only when a rate limit is configured.
    pub fn wrap(inner: Arc<dyn DataSender>, config: Option<RateLimitConfig>) -> Arc<dyn DataSender> {
        match config {
            Some(config) => Arc::new(Self::new(inner, config)),
            None => inner,
        }
    }
}

impl DataSender for RateLimitedSender {
    fn send(&self, message: ReplicationMessage) -> BoxFuture<'_, ReplicationAck> {
        Box::pin(async move {
            self.limiter.acquire().await;
            self.inner.send(message).await
        })
    }

    fn send_batch(&self, messages: Vec<ReplicationMessage>) -> BoxFuture<'_, Vec<Result<ReplicationAck>>> {
        Box::pin(async move {
            self.limiter.acquire_many(messages.len() as u32).await;
            self.inner.send_batch(messages).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Acks everything it receives.
    struct EchoReceiver {
        received: AtomicUsize,
    }

    impl DataReceiver for EchoReceiver {
        fn receive(&self, message: ReplicationMessage) -> BoxFuture<'_, ReplicationAck> {
            Box::pin(async move {
                self.received.fetch_add(1, Ordering::SeqCst);
                Ok(ReplicationAck {
                    sync_request_id: message.sync_request_id,
                    kind: message.kind,
                    snapshot_timestamp: message.snapshot_timestamp,
                    sequence_number: message.sequence_number,
                    timestamp: message.timestamp,
                })
            })
        }
    }

    /// Never answers.
    struct BlackHole;

    impl DataSender for BlackHole {
        fn send(&self, _message: ReplicationMessage) -> BoxFuture<'_, ReplicationAck> {
            Box::pin(futures::future::pending::<Result<ReplicationAck>>())
        }
    }

    fn message(seq: i64) -> ReplicationMessage {
        ReplicationMessage::snapshot(Uuid::new_v4(), 1, 4, seq, b"{}".to_vec())
    }

    #[tokio::test]
    async fn test_local_sender_round_trips_through_wire() {
        let receiver = Arc::new(EchoReceiver { received: AtomicUsize::new(0) });
        let sender = LocalDataSender::new(receiver.clone());
        let ack = sender.send(message(3)).await.unwrap();
        assert_eq!(ack.kind, MessageKind::Snapshot);
        assert_eq!(ack.sequence_number, 3);

        let acks = sender.send_batch(vec![message(0), message(1)]).await.unwrap();
        assert_eq!(acks.len(), 2);
        assert_eq!(receiver.received.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dropped_send_times_out() {
        let err = send_with_timeout(&BlackHole, message(0), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Timeout(_)));
        assert!(err.is_retryable());

        let err = send_batch_with_timeout(&BlackHole, vec![message(0)], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_rate_limited_sender_passes_through() {
        let receiver = Arc::new(EchoReceiver { received: AtomicUsize::new(0) });
        let inner: Arc<dyn DataSender> = Arc::new(LocalDataSender::without_encoding(receiver.clone()));
        let sender = RateLimitedSender::wrap(inner, Some(RateLimitConfig::default()));
        sender.send(message(0)).await.unwrap();
        assert_eq!(receiver.received.load(Ordering::SeqCst), 1);
    }
}
