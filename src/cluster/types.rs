//! Cluster type definitions shared by the topology, pool and executor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Node role in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Owns slots and accepts writes
    #[default]
    Master,
    /// Replicates a master, may serve reads
    Replica,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Replica => write!(f, "replica"),
        }
    }
}

/// One cluster member.
///
/// Identity is the `host:port` pair; the node id and role are informational
/// and come from the discovery reply when available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub role: NodeRole,
}

impl NodeEndpoint {
    /// Endpoint with no node id, assumed master.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            node_id: None,
            role: NodeRole::Master,
        }
    }

    /// Attach the id reported by CLUSTER SLOTS.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Set the role.
    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = role;
        self
    }

    /// Parse `host:port`, splitting at the last colon so bare IPv6 hosts
    /// (`::1:7000`) and bracketed ones (`[::1]:7000`) both work.
    pub fn parse(addr: &str) -> Option<Self> {
        let (host, port) = addr.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }

    /// Key used to identify the node in maps.
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// True for masters.
    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }
}

impl PartialEq for NodeEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for NodeEndpoint {}

impl std::hash::Hash for NodeEndpoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

/// A range of slots, both ends inclusive as reported by `CLUSTER SLOTS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    /// Inclusive range `start..=end`.
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// True when `slot` lies in the range.
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Number of slots covered.
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    /// True for an inverted range.
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Every slot in the range, ascending.
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.start, self.end)
    }
}

/// One shard of the cluster: its slot ranges, master and replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub ranges: Vec<SlotRange>,
    pub master: NodeEndpoint,
    pub replicas: Vec<NodeEndpoint>,
}

/// Which node of a shard serves read-only commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFrom {
    /// Everything goes to the master
    #[default]
    Master,
    /// Read-only commands go to a replica, falling back to the master
    /// when the shard has none
    Replica,
}
