//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A source/sink pair wired through an in-process transport
//! - Fault-injecting senders and data control
//! - Log write helpers and watch-based wait helpers

#![allow(dead_code)]

pub mod faults;

pub use faults::*;

use log_replication_engine::fsm::FsmObservers;
use log_replication_engine::log::{stream_state, StreamState};
use log_replication_engine::{
    DataControl, DataSender, LocalDataSender, LogAddress, ReplicationConfig, ReplicationState,
    SharedLog, SinkManager, SourceManager, StreamId, StreamUpdate, Transaction,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(10);

pub fn config(streams: &[&str]) -> ReplicationConfig {
    ReplicationConfig::for_testing("standby", streams)
}

/// Source and sink for one replication session.
pub struct Pair {
    pub source: SourceManager,
    pub sink: Arc<SinkManager>,
    pub source_log: Arc<dyn SharedLog>,
    pub sink_log: Arc<dyn SharedLog>,
    pub observers: FsmObservers,
}

impl Pair {
    /// In-memory logs, lossless transport, accepting data control.
    pub fn new(config: ReplicationConfig) -> Self {
        Self::with(
            config,
            Arc::new(log_replication_engine::MemoryLog::new()),
            Arc::new(log_replication_engine::MemoryLog::new()),
            |sender| sender,
            Arc::new(log_replication_engine::AutoDataControl::new()),
        )
    }

    /// `wrap` decorates the lossless sender, e.g. with a [`FaultySender`].
    pub fn with(
        config: ReplicationConfig,
        source_log: Arc<dyn SharedLog>,
        sink_log: Arc<dyn SharedLog>,
        wrap: impl FnOnce(Arc<dyn DataSender>) -> Arc<dyn DataSender>,
        data_control: Arc<dyn DataControl>,
    ) -> Self {
        let sink = Arc::new(SinkManager::new(sink_log.clone(), &config));
        let sender = wrap(Arc::new(LocalDataSender::new(sink.clone())));
        let source = SourceManager::new(config, source_log.clone(), sender, data_control);
        let observers = source.observers();
        Self {
            source,
            sink,
            source_log,
            sink_log,
            observers,
        }
    }

    /// Live state of `stream` on both sides.
    pub async fn states(&self, stream: &str) -> (StreamState, StreamState) {
        (
            state(self.source_log.as_ref(), stream).await,
            state(self.sink_log.as_ref(), stream).await,
        )
    }

    pub async fn assert_in_sync(&self, streams: &[&str]) {
        for stream in streams {
            let (source, sink) = self.states(stream).await;
            assert_eq!(source, sink, "stream {stream} diverged");
        }
    }
}

/// Commit one put to `stream`.
pub async fn put(log: &dyn SharedLog, stream: &str, key: &str, value: &str) -> LogAddress {
    put_across(log, &[stream], key, value).await
}

/// Commit one transaction putting `key` into every stream in `streams`.
pub async fn put_across(log: &dyn SharedLog, streams: &[&str], key: &str, value: &str) -> LogAddress {
    let mut tx = Transaction::new();
    for stream in streams {
        tx.log_update(StreamId::from_name(stream), StreamUpdate::put(key, value));
    }
    log.append(tx).await.unwrap()
}

/// Commit `count` single-key puts to `stream`, keys `{prefix}{i}`.
pub async fn put_many(log: &dyn SharedLog, stream: &str, prefix: &str, count: usize) -> LogAddress {
    let mut last = -1;
    for i in 0..count {
        last = put(log, stream, &format!("{prefix}{i}"), &format!("value-{i}")).await;
    }
    last
}

pub async fn state(log: &dyn SharedLog, stream: &str) -> StreamState {
    stream_state(log, StreamId::from_name(stream)).await.unwrap()
}

/// Wait until `predicate` holds for the watched value.
pub async fn wait_until<T>(rx: &watch::Receiver<T>, what: &str, predicate: impl FnMut(&T) -> bool) {
    let mut rx = rx.clone();
    match tokio::time::timeout(WAIT, rx.wait_for(predicate)).await {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => panic!("channel closed while waiting for {what}"),
        Err(_) => panic!("timed out waiting for {what}"),
    };
}

pub async fn wait_state(observers: &FsmObservers, state: ReplicationState) {
    wait_until(&observers.state, &format!("state {state}"), |s| *s == state).await;
}

/// Collect the next `count` transitions, in order.
pub async fn next_transitions(
    rx: &mut broadcast::Receiver<(ReplicationState, ReplicationState)>,
    count: usize,
) -> Vec<(ReplicationState, ReplicationState)> {
    let mut seen = Vec::with_capacity(count);
    while seen.len() < count {
        match tokio::time::timeout(WAIT, rx.recv()).await {
            Ok(Ok(step)) => seen.push(step),
            Ok(Err(e)) => panic!("transition history broken after {seen:?}: {e}"),
            Err(_) => panic!("timed out waiting for transitions, saw {seen:?}"),
        }
    }
    seen
}

/// Log-entry sync running and everything written so far acknowledged.
pub async fn wait_caught_up(observers: &FsmObservers) {
    wait_state(observers, ReplicationState::InLogEntrySync).await;
    wait_until(&observers.caught_up, "log entry sync to catch up", |c| *c).await;
}

/// Wait until the destination holds `expected` keys in `stream`.
pub async fn wait_for_keys(log: &dyn SharedLog, stream: &str, expected: usize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if state(log, stream).await.len() == expected {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {expected} keys in {stream}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
