//! Immutable routing table snapshots.
//!
//! A [`TopologyView`] is never modified once published. Refreshes and
//! single-slot repairs build a new view and the provider swaps it in, so
//! readers holding an older `Arc<TopologyView>` keep a consistent table.

use super::pool::NodePool;
use super::slot::SLOT_COUNT;
use super::types::{NodeEndpoint, NodeRole, ShardInfo, SlotRange};
use crate::error::{ClusterError, Result};
use crate::protocol::RespValue;
use std::collections::HashMap;
use std::sync::Arc;

const UNASSIGNED: u16 = u16::MAX;

/// Slot → shard table plus the pools of every known node.
#[derive(Debug, Clone)]
pub struct TopologyView {
    version: u64,
    /// Shard index per slot, `UNASSIGNED` when no master owns it
    slots: Vec<u16>,
    masters: Vec<NodeEndpoint>,
    replicas: Vec<Vec<NodeEndpoint>>,
    pools: HashMap<NodeEndpoint, Arc<NodePool>>,
}

impl TopologyView {
    /// The view before discovery has run.
    pub fn empty() -> Self {
        Self {
            version: 0,
            slots: vec![UNASSIGNED; SLOT_COUNT as usize],
            masters: Vec::new(),
            replicas: Vec::new(),
            pools: HashMap::new(),
        }
    }

    /// Build a view from discovered shards. `pool_for` supplies the pool of
    /// every master and replica.
    pub fn from_shards<F>(shards: &[ShardInfo], mut pool_for: F) -> Self
    where
        F: FnMut(&NodeEndpoint) -> Arc<NodePool>,
    {
        let mut view = Self::empty();

        for shard in shards {
            let index = view.masters.len() as u16;
            let master = shard.master.clone().with_role(NodeRole::Master);
            let replicas: Vec<NodeEndpoint> = shard
                .replicas
                .iter()
                .map(|r| r.clone().with_role(NodeRole::Replica))
                .collect();

            for node in std::iter::once(&master).chain(replicas.iter()) {
                if !view.pools.contains_key(node) {
                    view.pools.insert(node.clone(), pool_for(node));
                }
            }
            for range in &shard.ranges {
                for slot in range.iter() {
                    view.slots[slot as usize] = index;
                }
            }

            view.masters.push(master);
            view.replicas.push(replicas);
        }

        view
    }

    /// Copy of this view where `slot` is owned by `endpoint`. A slot outside
    /// the slot space leaves the copy unchanged.
    pub fn with_slot_owner(&self, slot: u16, endpoint: &NodeEndpoint, pool: Arc<NodePool>) -> Self {
        let mut view = self.clone();
        if slot >= SLOT_COUNT {
            return view;
        }
        let index = match view.masters.iter().position(|m| m == endpoint) {
            Some(index) => index,
            None => {
                view.masters.push(endpoint.clone().with_role(NodeRole::Master));
                view.replicas.push(Vec::new());
                view.masters.len() - 1
            }
        };
        if let Some(owner) = view.slots.get_mut(slot as usize) {
            *owner = index as u16;
        }
        view.pools.entry(endpoint.clone()).or_insert(pool);
        view
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Monotonic publication counter, 0 for the empty view.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// True before the first successful refresh.
    pub fn is_empty(&self) -> bool {
        self.masters.is_empty()
    }

    fn shard_of(&self, slot: u16) -> Option<usize> {
        match self.slots.get(slot as usize) {
            Some(&index) if index != UNASSIGNED => Some(index as usize),
            _ => None,
        }
    }

    /// Master serving `slot`, if assigned.
    pub fn master_for_slot(&self, slot: u16) -> Option<&NodeEndpoint> {
        self.shard_of(slot).map(|i| &self.masters[i])
    }

    /// Replicas of the master serving `slot`; empty when none.
    pub fn replicas_for_slot(&self, slot: u16) -> &[NodeEndpoint] {
        self.shard_of(slot)
            .map(|i| self.replicas[i].as_slice())
            .unwrap_or(&[])
    }

    /// Distinct masters owning at least one slot, in stable `host:port` order.
    pub fn masters(&self) -> Vec<NodeEndpoint> {
        let mut owning = vec![false; self.masters.len()];
        for &index in &self.slots {
            if index != UNASSIGNED {
                owning[index as usize] = true;
            }
        }

        let mut masters: Vec<NodeEndpoint> = self
            .masters
            .iter()
            .zip(owning)
            .filter(|(_, owns)| *owns)
            .map(|(m, _)| m.clone())
            .collect();
        masters.sort_by_key(|m| m.addr());
        masters.dedup();
        masters
    }

    /// Every node with a pool in this view.
    pub fn nodes(&self) -> Vec<NodeEndpoint> {
        let mut nodes: Vec<NodeEndpoint> = self.pools.keys().cloned().collect();
        nodes.sort_by_key(|n| n.addr());
        nodes
    }

    /// Pool of a node known to this view.
    pub fn pool(&self, endpoint: &NodeEndpoint) -> Option<Arc<NodePool>> {
        self.pools.get(endpoint).cloned()
    }

    pub(crate) fn pools(&self) -> impl Iterator<Item = (&NodeEndpoint, &Arc<NodePool>)> {
        self.pools.iter()
    }

    /// Slots with an owner.
    pub fn assigned_slots(&self) -> usize {
        self.slots.iter().filter(|&&i| i != UNASSIGNED).count()
    }
}

/// Parse a `CLUSTER SLOTS` reply.
///
/// Each entry is `[start, end, master, replica...]` where a node is
/// `[host, port, id?, ...]`. Ranges sharing a master are merged into one
/// shard. An empty host means the node that was queried.
pub fn parse_cluster_slots(reply: &RespValue, queried: &NodeEndpoint) -> Result<Vec<ShardInfo>> {
    if let Some(msg) = reply.as_error() {
        return Err(ClusterError::from_error_reply(msg));
    }
    let entries = reply
        .as_array()
        .ok_or_else(|| invalid("CLUSTER SLOTS reply is not an array"))?;

    let mut shards: Vec<ShardInfo> = Vec::new();
    for entry in entries {
        let fields = entry
            .as_array()
            .ok_or_else(|| invalid("slot entry is not an array"))?;
        if fields.len() < 3 {
            continue;
        }

        let start = slot_number(&fields[0])?;
        let end = slot_number(&fields[1])?;
        if start > end {
            return Err(invalid(&format!("slot range {}-{} is reversed", start, end)));
        }
        let range = SlotRange::new(start, end);

        let master = parse_node(&fields[2], queried)?;
        let replicas = fields[3..]
            .iter()
            .filter(|f| f.as_array().map(|a| !a.is_empty()).unwrap_or(false))
            .map(|f| parse_node(f, queried))
            .collect::<Result<Vec<_>>>()?;

        match shards.iter_mut().find(|s| s.master == master) {
            Some(shard) => {
                shard.ranges.push(range);
                for replica in replicas {
                    if !shard.replicas.contains(&replica) {
                        shard.replicas.push(replica);
                    }
                }
            }
            None => shards.push(ShardInfo {
                ranges: vec![range],
                master,
                replicas,
            }),
        }
    }

    Ok(shards)
}

/// Check that the shards assign every slot exactly once.
pub fn validate_coverage(shards: &[ShardInfo]) -> Result<()> {
    if shards.is_empty() {
        return Err(invalid("cluster slots list is empty"));
    }

    let mut seen = vec![false; SLOT_COUNT as usize];
    for range in shards.iter().flat_map(|s| s.ranges.iter()) {
        for slot in range.iter() {
            if std::mem::replace(&mut seen[slot as usize], true) {
                return Err(invalid(&format!("slot {} is assigned twice", slot)));
            }
        }
    }

    match seen.iter().position(|covered| !covered) {
        Some(hole) => Err(invalid(&format!("cluster slots have holes (first: {})", hole))),
        None => Ok(()),
    }
}

fn invalid(msg: &str) -> ClusterError {
    ClusterError::InvalidTopology(msg.to_string())
}

fn slot_number(value: &RespValue) -> Result<u16> {
    value
        .as_integer()
        .filter(|&n| (0..SLOT_COUNT as i64).contains(&n))
        .map(|n| n as u16)
        .ok_or_else(|| invalid(&format!("invalid slot number: {:?}", value)))
}

fn parse_node(value: &RespValue, queried: &NodeEndpoint) -> Result<NodeEndpoint> {
    let fields = value
        .as_array()
        .filter(|f| f.len() >= 2)
        .ok_or_else(|| invalid("node entry needs host and port"))?;

    let host = fields[0]
        .as_bytes()
        .map(|h| String::from_utf8_lossy(h).to_string())
        .unwrap_or_default();
    let host = if host.is_empty() || host == "?" {
        queried.host.clone()
    } else {
        host
    };

    let port = fields[1]
        .as_integer()
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| invalid(&format!("invalid port: {:?}", fields[1])))?;

    let mut node = NodeEndpoint::new(host, port);
    if let Some(id) = fields.get(2).and_then(|v| v.as_bytes()) {
        node = node.with_node_id(String::from_utf8_lossy(id));
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::test_util::MockCluster;
    use bytes::Bytes;

    fn node(host: &str, port: u16, id: &str) -> RespValue {
        RespValue::array(vec![
            RespValue::bulk_string(Bytes::from(host.to_string())),
            RespValue::Integer(port as i64),
            RespValue::bulk_string(Bytes::from(id.to_string())),
        ])
    }

    fn three_shard_reply() -> RespValue {
        RespValue::array(vec![
            RespValue::array(vec![
                RespValue::Integer(0),
                RespValue::Integer(5460),
                node("10.0.0.1", 7000, "a"),
                node("10.0.0.4", 7003, "d"),
            ]),
            RespValue::array(vec![
                RespValue::Integer(5461),
                RespValue::Integer(10922),
                node("10.0.0.2", 7001, "b"),
            ]),
            RespValue::array(vec![
                RespValue::Integer(10923),
                RespValue::Integer(16383),
                node("10.0.0.3", 7002, "c"),
            ]),
        ])
    }

    fn build(shards: &[ShardInfo]) -> TopologyView {
        let cluster = MockCluster::new();
        let connector = cluster.connector();
        TopologyView::from_shards(shards, |ep| {
            NodePool::new(ep.clone(), connector.clone(), PoolConfig::default())
        })
    }

    #[test]
    fn test_parse_cluster_slots() {
        let queried = NodeEndpoint::new("10.0.0.1", 7000);
        let shards = parse_cluster_slots(&three_shard_reply(), &queried).unwrap();

        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0].master, NodeEndpoint::new("10.0.0.1", 7000));
        assert_eq!(shards[0].master.node_id.as_deref(), Some("a"));
        assert_eq!(shards[0].replicas, vec![NodeEndpoint::new("10.0.0.4", 7003)]);
        assert_eq!(shards[2].ranges, vec![SlotRange::new(10923, 16383)]);
        assert!(validate_coverage(&shards).is_ok());
    }

    #[test]
    fn test_ranges_of_one_master_are_merged() {
        let reply = RespValue::array(vec![
            RespValue::array(vec![
                RespValue::Integer(0),
                RespValue::Integer(99),
                node("h", 1, "x"),
            ]),
            RespValue::array(vec![
                RespValue::Integer(200),
                RespValue::Integer(299),
                node("h", 1, "x"),
            ]),
        ]);
        let shards = parse_cluster_slots(&reply, &NodeEndpoint::new("h", 1)).unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].ranges.len(), 2);
        assert!(matches!(
            validate_coverage(&shards),
            Err(ClusterError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_empty_host_means_queried_node() {
        let reply = RespValue::array(vec![RespValue::array(vec![
            RespValue::Integer(0),
            RespValue::Integer(16383),
            node("", 7000, "a"),
        ])]);
        let shards = parse_cluster_slots(&reply, &NodeEndpoint::new("seed.local", 7000)).unwrap();
        assert_eq!(shards[0].master.host, "seed.local");
    }

    #[test]
    fn test_error_and_garbage_replies() {
        let queried = NodeEndpoint::new("h", 1);
        assert!(matches!(
            parse_cluster_slots(&RespValue::error("ERR cluster support disabled"), &queried),
            Err(ClusterError::Server(_))
        ));
        assert!(parse_cluster_slots(&RespValue::Integer(1), &queried).is_err());
        assert!(matches!(
            validate_coverage(&[]),
            Err(ClusterError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_view_lookup() {
        let queried = NodeEndpoint::new("10.0.0.1", 7000);
        let shards = parse_cluster_slots(&three_shard_reply(), &queried).unwrap();
        let view = build(&shards);

        assert_eq!(view.master_for_slot(0).unwrap().port, 7000);
        assert_eq!(view.master_for_slot(5461).unwrap().port, 7001);
        assert_eq!(view.master_for_slot(16383).unwrap().port, 7002);
        assert_eq!(view.replicas_for_slot(100).len(), 1);
        assert!(view.replicas_for_slot(6000).is_empty());
        assert_eq!(view.assigned_slots(), SLOT_COUNT as usize);
        assert_eq!(view.nodes().len(), 4);
        assert_eq!(
            view.masters().iter().map(|m| m.port).collect::<Vec<_>>(),
            vec![7000, 7001, 7002]
        );
    }

    #[test]
    fn test_with_slot_owner_leaves_source_view_untouched() {
        let queried = NodeEndpoint::new("10.0.0.1", 7000);
        let shards = parse_cluster_slots(&three_shard_reply(), &queried).unwrap();
        let view = build(&shards);

        let target = NodeEndpoint::new("10.0.0.9", 7009);
        let pool = NodePool::new(
            target.clone(),
            MockCluster::new().connector(),
            PoolConfig::default(),
        );
        let moved = view.with_slot_owner(500, &target, pool);

        assert_eq!(moved.master_for_slot(500), Some(&target));
        assert_eq!(moved.master_for_slot(501).unwrap().port, 7000);
        assert!(moved.pool(&target).is_some());
        assert_eq!(view.master_for_slot(500).unwrap().port, 7000);
        assert!(view.pool(&target).is_none());
    }

    #[test]
    fn test_with_slot_owner_ignores_slot_outside_range() {
        let queried = NodeEndpoint::new("10.0.0.1", 7000);
        let view = build(&parse_cluster_slots(&three_shard_reply(), &queried).unwrap());

        let target = NodeEndpoint::new("10.0.0.9", 7009);
        let pool = NodePool::new(
            target.clone(),
            MockCluster::new().connector(),
            PoolConfig::default(),
        );
        let same = view.with_slot_owner(20000, &target, pool);
        assert_eq!(same.assigned_slots(), SLOT_COUNT as usize);
        assert!(same.pool(&target).is_none());
        assert_eq!(same.masters(), view.masters());
    }
}
