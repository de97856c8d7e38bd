//! Configuration for the log replication engine.
//!
//! One [`ReplicationConfig`] describes replication towards one remote
//! (standby) cluster. It can be constructed programmatically or
//! deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use log_replication_engine::config::ReplicationConfig;
//!
//! let config = ReplicationConfig::for_testing("standby-1", &["orders", "customers"]);
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── remote_cluster_id: String          # Standby cluster this session feeds
//! ├── streams_to_replicate: [String]     # Logical streams (empty = rejected)
//! ├── settings: ReplicationSettings
//! │   ├── snapshot: SnapshotSyncConfig   # Batch and message sizing
//! │   ├── log_entry: LogEntrySyncConfig  # In-flight window, polling
//! │   ├── transport: TransportConfig     # Ack timeout, retransmits, rate limit
//! │   ├── data_control: DataControlConfig # Resync request reschedule backoff
//! │   └── writer: WriterConfig           # Destination reorder buffer
//! └── metadata: MetadataStoreConfig      # SQLite store for the durable log
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! remote_cluster_id: "standby-eu-west"
//! streams_to_replicate: ["orders", "customers"]
//!
//! settings:
//!   snapshot:
//!     max_num_msg_per_batch: 10
//!     max_msg_size: 67108864
//!   transport:
//!     message_timeout: "5s"
//!     max_retransmits: 3
//!   data_control:
//!     initial_delay: "500ms"
//!     max_delay: "30s"
//!
//! metadata:
//!   sqlite_path: "/var/lib/replication/standby-eu-west.db"
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Default max number of snapshot messages sent per cycle.
pub const DEFAULT_MAX_NUM_MSG_PER_BATCH: usize = 10;

/// Default max size of one replication message (64 MiB).
pub const DEFAULT_MAX_MSG_SIZE: usize = 64 << 20;

/// Share of a message reserved for data; the rest covers framing.
pub const DATA_FRACTION_PER_MSG: usize = 90;

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Parameters of replication towards one remote cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Identifier of the standby cluster. Names the persisted metadata tables.
    pub remote_cluster_id: String,

    /// Logical streams to replicate. Names that do not exist yet are allowed
    /// and simply contribute no data.
    #[serde(default)]
    pub streams_to_replicate: BTreeSet<String>,

    #[serde(default)]
    pub settings: ReplicationSettings,

    #[serde(default)]
    pub metadata: MetadataStoreConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            remote_cluster_id: "standby.default".to_string(),
            streams_to_replicate: BTreeSet::new(),
            settings: ReplicationSettings::default(),
            metadata: MetadataStoreConfig::default(),
        }
    }
}

impl ReplicationConfig {
    pub fn new<I, S>(remote_cluster_id: &str, streams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            remote_cluster_id: remote_cluster_id.to_string(),
            streams_to_replicate: streams.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Create a config with fast timeouts for tests.
    pub fn for_testing(remote_cluster_id: &str, streams: &[&str]) -> Self {
        Self {
            remote_cluster_id: remote_cluster_id.to_string(),
            streams_to_replicate: streams.iter().map(|s| s.to_string()).collect(),
            settings: ReplicationSettings::for_testing(),
            metadata: MetadataStoreConfig::in_memory(),
        }
    }

    /// Check the config before starting a sync.
    pub fn validate(&self) -> Result<()> {
        if self.streams_to_replicate.is_empty() {
            return Err(ReplicationError::EmptyReplicationSet);
        }
        if self.remote_cluster_id.is_empty() {
            return Err(ReplicationError::Config("remote_cluster_id is empty".to_string()));
        }
        let s = &self.settings;
        if s.snapshot.max_num_msg_per_batch == 0 {
            return Err(ReplicationError::Config("snapshot.max_num_msg_per_batch must be > 0".to_string()));
        }
        if s.snapshot.max_data_size_per_msg() == 0 {
            return Err(ReplicationError::Config("snapshot.max_msg_size too small".to_string()));
        }
        if s.log_entry.max_in_flight == 0 {
            return Err(ReplicationError::Config("log_entry.max_in_flight must be > 0".to_string()));
        }
        if s.log_entry.read_batch_size == 0 {
            return Err(ReplicationError::Config("log_entry.read_batch_size must be > 0".to_string()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunables for both sync modes and the destination.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub snapshot: SnapshotSyncConfig,
    #[serde(default)]
    pub log_entry: LogEntrySyncConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub data_control: DataControlConfig,
    #[serde(default)]
    pub writer: WriterConfig,
}

impl ReplicationSettings {
    pub fn for_testing() -> Self {
        Self {
            snapshot: SnapshotSyncConfig::default(),
            log_entry: LogEntrySyncConfig {
                poll_interval: "10ms".to_string(),
                ..Default::default()
            },
            transport: TransportConfig {
                message_timeout: "200ms".to_string(),
                max_retransmits: 3,
                ..Default::default()
            },
            data_control: DataControlConfig {
                initial_delay: "50ms".to_string(),
                max_delay: "200ms".to_string(),
                backoff_factor: 1.0,
            },
            writer: WriterConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SnapshotSyncConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot sync sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSyncConfig {
    /// Messages produced per reader cycle. The FSM interleaves other events
    /// between cycles.
    #[serde(default = "default_max_num_msg_per_batch")]
    pub max_num_msg_per_batch: usize,

    /// Upper bound on one message's size in bytes.
    #[serde(default = "default_max_msg_size")]
    pub max_msg_size: usize,
}

fn default_max_num_msg_per_batch() -> usize {
    DEFAULT_MAX_NUM_MSG_PER_BATCH
}

fn default_max_msg_size() -> usize {
    DEFAULT_MAX_MSG_SIZE
}

impl Default for SnapshotSyncConfig {
    fn default() -> Self {
        Self {
            max_num_msg_per_batch: DEFAULT_MAX_NUM_MSG_PER_BATCH,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
        }
    }
}

impl SnapshotSyncConfig {
    /// Bytes of update data allowed per message.
    pub fn max_data_size_per_msg(&self) -> usize {
        self.max_msg_size / 100 * DATA_FRACTION_PER_MSG
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LogEntrySyncConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Log-entry sync pipelining and polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntrySyncConfig {
    /// Messages that may be sent but not yet acknowledged.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Log addresses fetched per read from the shared log.
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,

    /// Pause between polls once caught up, as a duration string.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Least time between two persisted progress records while acks stream
    /// in. Progress is always persisted before the tailer goes idle.
    #[serde(default = "default_progress_flush_interval")]
    pub progress_flush_interval: String,
}

fn default_max_in_flight() -> usize {
    10
}

fn default_read_batch_size() -> usize {
    100
}

fn default_poll_interval() -> String {
    "50ms".to_string()
}

fn default_progress_flush_interval() -> String {
    "1s".to_string()
}

impl Default for LogEntrySyncConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 10,
            read_batch_size: 100,
            poll_interval: "50ms".to_string(),
            progress_flush_interval: "1s".to_string(),
        }
    }
}

impl LogEntrySyncConfig {
    pub fn poll_interval_duration(&self) -> Duration {
        parse_duration_or(&self.poll_interval, Duration::from_millis(50))
    }

    pub fn progress_flush_interval_duration(&self) -> Duration {
        parse_duration_or(&self.progress_flush_interval, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TransportConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Acknowledgement timeouts, retransmission and send rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// How long to wait for the ack of one message.
    #[serde(default = "default_message_timeout")]
    pub message_timeout: String,

    /// Consecutive unacknowledged attempts before the sync is abandoned.
    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: u32,

    #[serde(default)]
    pub rate_limit_enabled: bool,

    /// Sustained messages per second.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst above the sustained rate.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_message_timeout() -> String {
    "5s".to_string()
}

fn default_max_retransmits() -> u32 {
    5
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            message_timeout: "5s".to_string(),
            max_retransmits: 5,
            rate_limit_enabled: false,
            rate_limit_per_sec: 1000,
            rate_limit_burst: 100,
        }
    }
}

impl TransportConfig {
    pub fn message_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.message_timeout, Duration::from_secs(5))
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit_enabled.then(|| RateLimitConfig {
            burst_size: self.rate_limit_burst,
            refill_rate: self.rate_limit_per_sec,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DataControlConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Reschedule policy for unacknowledged snapshot sync requests.
///
/// Requests are re-sent forever; only the spacing backs off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataControlConfig {
    #[serde(default = "default_dc_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_dc_max_delay")]
    pub max_delay: String,

    /// 1.0 gives a fixed interval.
    #[serde(default = "default_dc_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_dc_initial_delay() -> String {
    "500ms".to_string()
}

fn default_dc_max_delay() -> String {
    "30s".to_string()
}

fn default_dc_backoff_factor() -> f64 {
    2.0
}

impl Default for DataControlConfig {
    fn default() -> Self {
        Self {
            initial_delay: "500ms".to_string(),
            max_delay: "30s".to_string(),
            backoff_factor: 2.0,
        }
    }
}

impl DataControlConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: parse_duration_or(&self.initial_delay, Duration::from_millis(500)),
            max_delay: parse_duration_or(&self.max_delay, Duration::from_secs(30)),
            backoff_factor: self.backoff_factor.max(1.0),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WriterConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Destination writer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Out-of-order log entries held until the gap before them fills.
    #[serde(default = "default_max_pending_log_entries")]
    pub max_pending_log_entries: usize,
}

fn default_max_pending_log_entries() -> usize {
    100
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_log_entries: 100,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MetadataStoreConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Location of the durable log and metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataStoreConfig {
    pub sqlite_path: String,

    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MetadataStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_log.db".to_string(),
            wal_mode: true,
        }
    }
}

impl MetadataStoreConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
