// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process shared log.

use super::{BoxFuture, LogAddress, LogEntry, SharedLog, StreamId, Transaction, NON_ADDRESS};
use crate::error::ReplicationError;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    entries: BTreeMap<LogAddress, LogEntry>,
    tail: LogAddress,
    trim_mark: LogAddress,
    /// (table, key) -> versions in address order.
    metadata: HashMap<(String, String), Vec<(LogAddress, i64)>>,
    /// Address of the latest write to each metadata table.
    table_versions: HashMap<String, LogAddress>,
}

/// Shared log held entirely in memory.
///
/// All operations take one `RwLock`, so a commit is visible to readers
/// all at once or not at all.
pub struct MemoryLog {
    inner: RwLock<Inner>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                tail: NON_ADDRESS,
                trim_mark: 0,
                ..Default::default()
            }),
        }
    }

    /// Number of entries still retained.
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }
}

impl SharedLog for MemoryLog {
    fn commit(&self, tx: Transaction, read_timestamp: Option<LogAddress>) -> BoxFuture<'_, LogAddress> {
        Box::pin(async move {
            let mut inner = self.inner.write().await;

            if let Some(read_ts) = read_timestamp {
                for write in &tx.metadata {
                    if let Some(&version) = inner.table_versions.get(&write.table) {
                        if version > read_ts {
                            return Err(ReplicationError::TransactionAborted {
                                table: write.table.clone(),
                                read_timestamp: read_ts,
                                conflict_address: version,
                            });
                        }
                    }
                }
            }

            let address = inner.tail + 1;
            inner.tail = address;
            for write in tx.metadata {
                inner
                    .metadata
                    .entry((write.table.clone(), write.key))
                    .or_default()
                    .push((address, write.value));
                inner.table_versions.insert(write.table, address);
            }
            inner.entries.insert(
                address,
                LogEntry {
                    address,
                    kind: tx.kind,
                    updates: tx.updates,
                },
            );
            Ok(address)
        })
    }

    fn read_range(&self, from: LogAddress, to: LogAddress) -> BoxFuture<'_, Vec<LogEntry>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            let from = from.max(0);
            if from < inner.trim_mark {
                return Err(ReplicationError::TrimmedLog {
                    requested: from,
                    trim_mark: inner.trim_mark,
                });
            }
            if to < from {
                return Ok(Vec::new());
            }
            Ok(inner.entries.range(from..=to).map(|(_, e)| e.clone()).collect())
        })
    }

    fn read_stream(&self, stream: StreamId, from: LogAddress, to: LogAddress) -> BoxFuture<'_, Vec<LogEntry>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            let from = from.max(0);
            if from < inner.trim_mark {
                return Err(ReplicationError::TrimmedLog {
                    requested: from,
                    trim_mark: inner.trim_mark,
                });
            }
            if to < from {
                return Ok(Vec::new());
            }
            Ok(inner
                .entries
                .range(from..=to)
                .filter(|(_, e)| e.touches(&stream))
                .map(|(_, e)| e.clone())
                .collect())
        })
    }

    fn log_tail(&self) -> BoxFuture<'_, LogAddress> {
        Box::pin(async move { Ok(self.inner.read().await.tail) })
    }

    fn trim_mark(&self) -> BoxFuture<'_, LogAddress> {
        Box::pin(async move { Ok(self.inner.read().await.trim_mark) })
    }

    fn prefix_trim(&self, address: LogAddress) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            let address = address.min(inner.tail + 1);
            if address <= inner.trim_mark {
                return Ok(());
            }
            let retained = inner.entries.split_off(&address);
            inner.entries = retained;
            inner.trim_mark = address;
            // Keep only the newest metadata version below the mark.
            for versions in inner.metadata.values_mut() {
                let below = versions.iter().filter(|(a, _)| *a < address).count();
                if below > 1 {
                    versions.drain(..below - 1);
                }
            }
            Ok(())
        })
    }

    fn metadata_get(&self, table: &str, key: &str, at: LogAddress) -> BoxFuture<'_, Option<i64>> {
        let lookup = (table.to_string(), key.to_string());
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner.metadata.get(&lookup).and_then(|versions| {
                versions
                    .iter()
                    .rev()
                    .find(|(address, _)| *address <= at)
                    .map(|(_, value)| *value)
            }))
        })
    }
}
