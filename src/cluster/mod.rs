//! Cluster routing for the AiKv / Redis Cluster protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │   ClusterExecutor (execute / broadcast)     │
//! │   resolve → dispatch → classify → budget    │
//! └─────────────────────────────────────────────┘
//!          │                        │
//!          ▼                        ▼
//! ┌──────────────────────┐  ┌──────────────────────┐
//! │  TopologyProvider    │  │  NodePool (per node) │
//! │  Arc<TopologyView>   │──│  borrow / release    │
//! └──────────────────────┘  └──────────────────────┘
//!          │                        │
//!          ▼                        ▼
//!     CLUSTER SLOTS            Connection (RESP)
//! ```
//!
//! Slot ownership lives in immutable [`TopologyView`]s. A refresh or a
//! MOVED repair builds a new view and swaps it in; calls in flight keep the
//! view they started with.

mod aggregate;
mod broadcast;
mod executor;
mod pool;
mod provider;
mod slot;
mod topology;
mod types;

pub use aggregate::{aggregate, aggregate_all, ResponsePolicy};
pub use broadcast::NodeReply;
pub use executor::{ClusterExecutor, Outcome};
pub use pool::{NodePool, PoolStats, PooledConnection};
pub use provider::TopologyProvider;
pub use slot::{crc16, hash_tag, key_slot, slot_for_keys, SLOT_COUNT};
pub use topology::{parse_cluster_slots, validate_coverage, TopologyView};
pub use types::{NodeEndpoint, NodeRole, ReadFrom, ShardInfo, SlotRange};
