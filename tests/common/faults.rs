//! Fault injection: lossy transport and unreliable data control.

use log_replication_engine::log::BoxFuture;
use log_replication_engine::{DataControl, DataSender, MessageKind, ReplicationAck, ReplicationMessage, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Which messages a [`FaultySender`] loses.
#[derive(Debug, Clone, Copy)]
pub enum DropMode {
    /// Lose the first `count` messages of `kind`, deliver the rest.
    FirstN { kind: MessageKind, count: usize },
    /// Lose every message of `kind`.
    Always(MessageKind),
}

/// Loses messages by never answering, like a dropped packet.
pub struct FaultySender {
    inner: Arc<dyn DataSender>,
    mode: DropMode,
    seen: AtomicUsize,
    dropped: AtomicUsize,
}

impl FaultySender {
    pub fn new(inner: Arc<dyn DataSender>, mode: DropMode) -> Self {
        Self {
            inner,
            mode,
            seen: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    pub fn wrap(mode: DropMode) -> impl FnOnce(Arc<dyn DataSender>) -> Arc<dyn DataSender> {
        move |inner| Arc::new(Self::new(inner, mode)) as Arc<dyn DataSender>
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    fn should_drop(&self, message: &ReplicationMessage) -> bool {
        match self.mode {
            DropMode::Always(kind) => message.kind == kind,
            DropMode::FirstN { kind, count } => {
                message.kind == kind && self.seen.fetch_add(1, Ordering::SeqCst) < count
            }
        }
    }
}

impl DataSender for FaultySender {
    fn send(&self, message: ReplicationMessage) -> BoxFuture<'_, ReplicationAck> {
        if self.should_drop(&message) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            return Box::pin(futures::future::pending::<Result<ReplicationAck>>());
        }
        self.inner.send(message)
    }
}

/// Delivers every message twice and answers with the second ack.
pub struct DuplicatingSender {
    inner: Arc<dyn DataSender>,
}

impl DuplicatingSender {
    pub fn wrap(inner: Arc<dyn DataSender>) -> Arc<dyn DataSender> {
        Arc::new(Self { inner })
    }
}

impl DataSender for DuplicatingSender {
    fn send(&self, message: ReplicationMessage) -> BoxFuture<'_, ReplicationAck> {
        Box::pin(async move {
            let _ = self.inner.send(message.clone()).await;
            self.inner.send(message).await
        })
    }
}

/// Holds messages of one kind until the test releases them.
#[derive(Default)]
pub struct Gate {
    pub arrived: Notify,
    pub release: Notify,
}

pub struct GatedSender {
    inner: Arc<dyn DataSender>,
    kind: MessageKind,
    gate: Arc<Gate>,
}

impl GatedSender {
    pub fn wrap(kind: MessageKind, gate: Arc<Gate>) -> impl FnOnce(Arc<dyn DataSender>) -> Arc<dyn DataSender> {
        move |inner| Arc::new(Self { inner, kind, gate }) as Arc<dyn DataSender>
    }
}

impl DataSender for GatedSender {
    fn send(&self, message: ReplicationMessage) -> BoxFuture<'_, ReplicationAck> {
        Box::pin(async move {
            if message.kind == self.kind {
                self.gate.arrived.notify_one();
                self.gate.release.notified().await;
            }
            self.inner.send(message).await
        })
    }
}

/// Loses the first `drops` resync requests, then accepts.
pub struct DropNDataControl {
    drops: usize,
    calls: AtomicUsize,
    outstanding: Arc<AtomicUsize>,
}

/// Counts a lost request for as long as its future is alive.
struct Outstanding(Arc<AtomicUsize>);

impl Outstanding {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for Outstanding {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DropNDataControl {
    pub fn new(drops: usize) -> Self {
        Self {
            drops,
            calls: AtomicUsize::new(0),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Lost requests whose futures have not been dropped yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl DataControl for DropNDataControl {
    fn request_snapshot_sync<'a>(&'a self, _remote_cluster_id: &'a str) -> BoxFuture<'a, bool> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.drops {
            let guard = Outstanding::new(&self.outstanding);
            return Box::pin(async move {
                let _guard = guard;
                futures::future::pending::<Result<bool>>().await
            });
        }
        Box::pin(async { Ok(true) })
    }
}
