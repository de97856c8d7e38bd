// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cluster topology: who is active, who is standby, and under which epoch.
//!
//! Every change to the role assignment bumps `topology_config_id`. Messages
//! carry the id they were produced under as `site_config_id`, and the
//! destination rejects any message whose id differs from the one it last
//! bootstrapped with.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Role of a cluster in the current topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterRole {
    Active,
    Standby,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Standby => write!(f, "STANDBY"),
        }
    }
}

/// One node of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// `host:port` the replication server listens on.
    pub endpoint: String,
    pub node_id: String,
}

impl NodeDescriptor {
    pub fn new(endpoint: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            node_id: node_id.into(),
        }
    }
}

/// A cluster and its nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    pub cluster_id: String,
    pub role: ClusterRole,
    #[serde(default)]
    pub nodes: Vec<NodeDescriptor>,
}

impl ClusterDescriptor {
    pub fn new(cluster_id: impl Into<String>, role: ClusterRole) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            role,
            nodes: Vec::new(),
        }
    }

    pub fn with_node(mut self, endpoint: impl Into<String>, node_id: impl Into<String>) -> Self {
        self.nodes.push(NodeDescriptor::new(endpoint, node_id));
        self
    }

    pub fn has_endpoint(&self, endpoint: &str) -> bool {
        self.nodes.iter().any(|n| n.endpoint == endpoint)
    }
}

/// The role assignment in effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyDescriptor {
    pub topology_config_id: i64,
    pub active_cluster: ClusterDescriptor,
    #[serde(default)]
    pub standby_clusters: BTreeMap<String, ClusterDescriptor>,
}

impl TopologyDescriptor {
    /// A topology with a single active cluster and no standbys.
    pub fn new(topology_config_id: i64, mut active_cluster: ClusterDescriptor) -> Self {
        active_cluster.role = ClusterRole::Active;
        Self {
            topology_config_id,
            active_cluster,
            standby_clusters: BTreeMap::new(),
        }
    }

    /// Add (or replace) a standby and bump the epoch.
    pub fn add_standby(&mut self, mut cluster: ClusterDescriptor) -> i64 {
        cluster.role = ClusterRole::Standby;
        self.standby_clusters.insert(cluster.cluster_id.clone(), cluster);
        self.bump()
    }

    /// Remove a standby. Bumps the epoch only if it was present.
    pub fn remove_standby(&mut self, cluster_id: &str) -> Option<ClusterDescriptor> {
        let removed = self.standby_clusters.remove(cluster_id);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Cluster owning a node endpoint.
    pub fn cluster_for_endpoint(&self, endpoint: &str) -> Option<&ClusterDescriptor> {
        if self.active_cluster.has_endpoint(endpoint) {
            return Some(&self.active_cluster);
        }
        self.standby_clusters.values().find(|c| c.has_endpoint(endpoint))
    }

    pub fn role_of(&self, cluster_id: &str) -> Option<ClusterRole> {
        if self.active_cluster.cluster_id == cluster_id {
            Some(ClusterRole::Active)
        } else {
            self.standby_clusters.get(cluster_id).map(|c| c.role)
        }
    }

    /// Swap the active cluster with a standby (failover). Bumps the epoch.
    pub fn promote(&mut self, standby_id: &str) -> Option<i64> {
        let mut promoted = self.standby_clusters.remove(standby_id)?;
        promoted.role = ClusterRole::Active;
        let mut demoted = std::mem::replace(&mut self.active_cluster, promoted);
        demoted.role = ClusterRole::Standby;
        self.standby_clusters.insert(demoted.cluster_id.clone(), demoted);
        Some(self.bump())
    }

    /// Advance the epoch and return the new id.
    pub fn bump(&mut self) -> i64 {
        self.topology_config_id += 1;
        self.topology_config_id
    }
}
