//! Owner of the current topology view.
//!
//! Reads are a pointer clone under a short `RwLock`. Refreshes serialize on
//! an async lock and are coalesced: a caller that waited while another
//! refresh published a newer view takes that view instead of issuing its own
//! `CLUSTER SLOTS` round trip.

use super::pool::NodePool;
use super::slot::SLOT_COUNT;
use super::topology::{parse_cluster_slots, validate_coverage, TopologyView};
use super::types::{NodeEndpoint, ShardInfo};
use crate::config::ClientConfig;
use crate::connection::Connector;
use crate::error::{ClusterError, Result};
use crate::observability::ClusterMetrics;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub struct TopologyProvider {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    current: RwLock<Arc<TopologyView>>,
    refresh_lock: tokio::sync::Mutex<()>,
    /// Bumped after every completed refresh, failed or not
    refresh_generation: AtomicU64,
    /// Error of the latest refresh, `None` when it succeeded
    last_failure: Mutex<Option<String>>,
    /// Pools of redirect targets the current view does not know yet
    extra_pools: Mutex<HashMap<NodeEndpoint, Arc<NodePool>>>,
    suspects: Mutex<HashSet<NodeEndpoint>>,
    metrics: Arc<ClusterMetrics>,
    stop_refresh: Mutex<Option<oneshot::Sender<()>>>,
    closed: AtomicBool,
}

impl TopologyProvider {
    /// Provider with an empty view. Call `refresh` before routing.
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        metrics: Arc<ClusterMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            connector,
            current: RwLock::new(Arc::new(TopologyView::empty())),
            refresh_lock: tokio::sync::Mutex::new(()),
            refresh_generation: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            extra_pools: Mutex::new(HashMap::new()),
            suspects: Mutex::new(HashSet::new()),
            metrics,
            stop_refresh: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Configuration the provider was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Latest published view. Never blocks on a refresh.
    pub fn current_view(&self) -> Arc<TopologyView> {
        self.current.read().clone()
    }

    /// True once `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Rediscover the topology from the seeds and known nodes.
    pub async fn refresh(&self) -> Result<Arc<TopologyView>> {
        self.refresh_from(None).await
    }

    /// Rediscover the topology, asking `hint` first.
    pub async fn refresh_from(&self, hint: Option<&NodeEndpoint>) -> Result<Arc<TopologyView>> {
        if self.is_closed() {
            return Err(ClusterError::TopologyUnavailable {
                tried: 0,
                last: "client is closed".to_string(),
            });
        }

        let observed = self.refresh_generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;
        if self.refresh_generation.load(Ordering::Acquire) != observed {
            // Another caller finished a refresh while we waited: share its outcome
            let last_failure = self.last_failure.lock().clone();
            if let Some(last) = last_failure {
                return Err(ClusterError::TopologyUnavailable { tried: 0, last });
            }
            let view = self.current_view();
            debug!("Reusing topology version {} refreshed by another caller", view.version());
            return Ok(view);
        }

        self.refresh_locked(hint).await
    }

    /// One discovery round. Callers hold `refresh_lock`.
    async fn refresh_locked(&self, hint: Option<&NodeEndpoint>) -> Result<Arc<TopologyView>> {
        self.metrics.refreshes.inc();
        let result = self.discover(hint).await;
        let outcome = match result {
            Ok(shards) => {
                let view = self.publish(&shards);
                info!(
                    "Published topology version {} ({} masters, {} slots)",
                    view.version(),
                    view.masters().len(),
                    view.assigned_slots()
                );
                *self.last_failure.lock() = None;
                Ok(view)
            }
            Err(e) => {
                self.metrics.refresh_failures.inc();
                debug!("Topology refresh failed: {}", e);
                *self.last_failure.lock() = Some(e.to_string());
                Err(e)
            }
        };
        self.refresh_generation.fetch_add(1, Ordering::AcqRel);
        outcome
    }

    /// Seeds in random order, then the nodes of the current view. Suspect
    /// nodes go last; `hint` goes first.
    fn candidates(&self, hint: Option<&NodeEndpoint>) -> Vec<NodeEndpoint> {
        let mut seeds = self.config.seeds.clone();
        seeds.shuffle(&mut rand::thread_rng());

        let mut ordered: Vec<NodeEndpoint> = Vec::new();
        for node in seeds.into_iter().chain(self.current_view().nodes()) {
            if Some(&node) != hint && !ordered.contains(&node) {
                ordered.push(node);
            }
        }

        let suspects = self.suspects.lock();
        let (healthy, suspect): (Vec<_>, Vec<_>) =
            ordered.into_iter().partition(|n| !suspects.contains(n));
        hint.into_iter()
            .cloned()
            .chain(healthy)
            .chain(suspect)
            .collect()
    }

    async fn discover(&self, hint: Option<&NodeEndpoint>) -> Result<Vec<ShardInfo>> {
        let candidates = self.candidates(hint);
        let mut tried = 0;
        let mut last: Option<ClusterError> = None;
        let mut invalid: Option<ClusterError> = None;

        for node in candidates {
            tried += 1;
            match self.query_slots(&node).await {
                Ok(shards) => {
                    self.suspects.lock().remove(&node);
                    return Ok(shards);
                }
                Err(e) => {
                    debug!("CLUSTER SLOTS from {} failed: {}", node, e);
                    if matches!(e, ClusterError::InvalidTopology(_)) {
                        invalid = Some(e);
                    } else {
                        last = Some(e);
                    }
                }
            }
        }

        // A node that answered with an unusable table says more than a
        // node that did not answer at all.
        if let Some(e) = invalid {
            return Err(e);
        }
        Err(ClusterError::TopologyUnavailable {
            tried,
            last: last
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no seed or known node to ask".to_string()),
        })
    }

    async fn query_slots(&self, node: &NodeEndpoint) -> Result<Vec<ShardInfo>> {
        let mut conn = self.connector.connect(node).await?;
        let reply = conn
            .request(&[Bytes::from_static(b"CLUSTER"), Bytes::from_static(b"SLOTS")])
            .await?;

        let shards = parse_cluster_slots(&reply, node)?;
        if shards.is_empty() {
            return Err(ClusterError::InvalidTopology(
                "cluster slots list is empty".to_string(),
            ));
        }
        if !self.config.allow_partial_coverage {
            validate_coverage(&shards)?;
        }
        Ok(shards)
    }

    fn new_pool(&self, endpoint: &NodeEndpoint) -> Arc<NodePool> {
        NodePool::new(
            endpoint.clone(),
            self.connector.clone(),
            self.config.pool.clone(),
        )
    }

    /// Swap in a view built from `shards`, reusing the pools of nodes that
    /// are still present and closing the rest.
    fn publish(&self, shards: &[ShardInfo]) -> Arc<TopologyView> {
        let retired: Vec<Arc<NodePool>>;
        let view = {
            let mut current = self.current.write();
            let mut extras = self.extra_pools.lock();
            let old = current.clone();

            let mut view = TopologyView::from_shards(shards, |ep| {
                old.pool(ep)
                    .or_else(|| extras.remove(ep).filter(|p| !p.is_closed()))
                    .unwrap_or_else(|| self.new_pool(ep))
            });
            view.set_version(old.version() + 1);
            let view = Arc::new(view);

            retired = old
                .pools()
                .filter(|(ep, _)| view.pool(ep).is_none())
                .map(|(_, pool)| pool.clone())
                .chain(extras.drain().map(|(_, pool)| pool))
                .collect();

            *current = view.clone();
            view
        };

        let nodes: HashSet<NodeEndpoint> = view.nodes().into_iter().collect();
        self.suspects.lock().retain(|n| nodes.contains(n));

        for pool in retired {
            debug!("Node {} left the topology", pool.endpoint());
            pool.close();
        }
        view
    }

    /// Publish a copy of the current view where `slot` is owned by
    /// `endpoint`. Used to repair a single slot after a MOVED reply.
    pub fn assign_slot(&self, slot: u16, endpoint: &NodeEndpoint) -> Arc<TopologyView> {
        let mut current = self.current.write();
        if slot >= SLOT_COUNT || current.master_for_slot(slot) == Some(endpoint) {
            return current.clone();
        }

        let pool = match current.pool(endpoint) {
            Some(pool) => pool,
            None => self
                .extra_pools
                .lock()
                .remove(endpoint)
                .filter(|p| !p.is_closed())
                .unwrap_or_else(|| self.new_pool(endpoint)),
        };

        let mut view = current.with_slot_owner(slot, endpoint, pool);
        view.set_version(current.version() + 1);
        let view = Arc::new(view);
        *current = view.clone();

        debug!(
            "Slot {} moved to {} (topology version {})",
            slot,
            endpoint,
            view.version()
        );
        view
    }

    /// Pool of `endpoint`, created on first use when the view does not know
    /// the node. Such pools live until the next refresh.
    pub fn pool_for(&self, endpoint: &NodeEndpoint) -> Arc<NodePool> {
        if let Some(pool) = self.current_view().pool(endpoint) {
            return pool;
        }

        let mut extras = self.extra_pools.lock();
        if let Some(pool) = extras.get(endpoint).filter(|p| !p.is_closed()) {
            return pool.clone();
        }
        let pool = self.new_pool(endpoint);
        extras.insert(endpoint.clone(), pool.clone());
        pool
    }

    /// Remember a node that failed at the connection level; refreshes ask it last.
    pub fn mark_suspect(&self, endpoint: &NodeEndpoint) {
        if self.suspects.lock().insert(endpoint.clone()) {
            warn!("Marking node {} as suspect", endpoint);
        }
    }

    /// Marked by a recent connection failure.
    pub fn is_suspect(&self, endpoint: &NodeEndpoint) -> bool {
        self.suspects.lock().contains(endpoint)
    }

    /// Refresh every `period` in the background until [`shutdown`](Self::shutdown).
    /// Failures are logged and the last good view stays current.
    pub fn spawn_refresh_task(self: &Arc<Self>, period: Duration) {
        let (tx, mut rx) = oneshot::channel::<()>();
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => {
                        let Some(provider) = weak.upgrade() else {
                            break;
                        };
                        if let Err(e) = provider.refresh().await {
                            warn!("Periodic topology refresh failed: {}", e);
                        }
                    }
                }
            }
            debug!("Topology refresh task stopped");
        });

        if let Some(previous) = self.stop_refresh.lock().replace(tx) {
            let _ = previous.send(());
        }
    }

    /// Stop the background refresh and close every pool. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(stop) = self.stop_refresh.lock().take() {
            let _ = stop.send(());
        }

        let view = self.current_view();
        for (_, pool) in view.pools() {
            pool.close();
        }
        for (_, pool) in self.extra_pools.lock().drain() {
            pool.close();
        }
        info!("Topology provider shut down");
    }
}

impl std::fmt::Debug for TopologyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyProvider")
            .field("version", &self.current_view().version())
            .field("closed", &self.is_closed())
            .finish()
    }
}
