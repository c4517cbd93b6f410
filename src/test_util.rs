//! In-memory cluster used by unit tests.

use crate::cluster::{key_slot, NodeEndpoint};
use crate::connection::{Connection, Connector};
use crate::error::{ClusterError, Result};
use crate::protocol::RespValue;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Handler = Arc<dyn Fn(&[Bytes]) -> RespValue + Send + Sync>;

struct MockNode {
    down: bool,
    connect_delay: Duration,
    /// Set for replicas: data commands without READONLY are redirected here
    master: Option<NodeEndpoint>,
    script: VecDeque<RespValue>,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    nodes: Mutex<HashMap<String, MockNode>>,
    slots_reply: Mutex<Option<RespValue>>,
    log: Mutex<Vec<(String, String)>>,
    connects: AtomicUsize,
    connect_attempts: AtomicUsize,
}

/// Nodes answering from canned scripts, `CLUSTER SLOTS` from a shared
/// table, everything else from a per-node handler.
#[derive(Clone, Default)]
pub struct MockCluster {
    inner: Arc<Inner>,
}

fn default_handler(node: String) -> Handler {
    Arc::new(move |args: &[Bytes]| {
        let name = String::from_utf8_lossy(&args[0]).to_uppercase();
        match name.as_str() {
            "PING" => RespValue::simple_string("PONG"),
            "GET" => RespValue::bulk_string(Bytes::from(node.clone())),
            "DBSIZE" => RespValue::Integer(1),
            _ => RespValue::ok(),
        }
    })
}

impl MockCluster {
    /// An empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reachable node serving the default handler.
    pub fn add_node(&self, host: &str, port: u16) -> NodeEndpoint {
        let endpoint = NodeEndpoint::new(host, port);
        self.inner.nodes.lock().insert(
            endpoint.addr(),
            MockNode {
                down: false,
                connect_delay: Duration::ZERO,
                master: None,
                script: VecDeque::new(),
                handler: default_handler(endpoint.addr()),
            },
        );
        endpoint
    }

    /// Refuse new connections and fail open ones.
    pub fn set_down(&self, host: &str, port: u16, down: bool) {
        if let Some(node) = self.inner.nodes.lock().get_mut(&NodeEndpoint::new(host, port).addr()) {
            node.down = down;
        }
    }

    /// Delay every connect to a node by `delay`.
    pub fn set_connect_delay(&self, endpoint: &NodeEndpoint, delay: Duration) {
        if let Some(node) = self.inner.nodes.lock().get_mut(&endpoint.addr()) {
            node.connect_delay = delay;
        }
    }

    /// Replies returned, in order, to the next data commands of a node.
    pub fn script(&self, endpoint: &NodeEndpoint, replies: Vec<RespValue>) {
        if let Some(node) = self.inner.nodes.lock().get_mut(&endpoint.addr()) {
            node.script.extend(replies);
        }
    }

    /// Replace the handler used once the script runs dry.
    pub fn set_handler<F>(&self, endpoint: &NodeEndpoint, handler: F)
    where
        F: Fn(&[Bytes]) -> RespValue + Send + Sync + 'static,
    {
        if let Some(node) = self.inner.nodes.lock().get_mut(&endpoint.addr()) {
            node.handler = Arc::new(handler);
        }
    }

    /// Publish the slot table every node reports. Listed replicas only
    /// serve connections that sent READONLY.
    pub fn set_slots(&self, shards: &[(u16, u16, &NodeEndpoint, &[NodeEndpoint])]) {
        {
            let mut nodes = self.inner.nodes.lock();
            for (_, _, master, replicas) in shards {
                for replica in replicas.iter() {
                    if let Some(node) = nodes.get_mut(&replica.addr()) {
                        node.master = Some((*master).clone());
                    }
                }
            }
        }
        let entries = shards
            .iter()
            .map(|(start, end, master, replicas)| {
                let mut entry = vec![
                    RespValue::Integer(*start as i64),
                    RespValue::Integer(*end as i64),
                    node_entry(master),
                ];
                entry.extend(replicas.iter().map(node_entry));
                RespValue::array(entry)
            })
            .collect();
        *self.inner.slots_reply.lock() = Some(RespValue::array(entries));
    }

    /// Connector opening in-memory connections to this cluster.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            cluster: self.clone(),
        })
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Connects tried, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Command names received by a node, in order.
    pub fn requests_to(&self, endpoint: &NodeEndpoint) -> Vec<String> {
        let addr = endpoint.addr();
        self.inner
            .log
            .lock()
            .iter()
            .filter(|(a, _)| *a == addr)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    /// Like [`requests_to`](Self::requests_to) without discovery requests.
    pub fn data_requests_to(&self, endpoint: &NodeEndpoint) -> Vec<String> {
        self.requests_to(endpoint)
            .into_iter()
            .filter(|cmd| cmd != "CLUSTER SLOTS")
            .collect()
    }

    /// Data commands (anything but discovery) received across the cluster.
    pub fn data_requests(&self) -> usize {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|(_, cmd)| cmd != "CLUSTER SLOTS")
            .count()
    }

    /// CLUSTER SLOTS requests received by any node.
    pub fn slots_requests(&self) -> usize {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|(_, cmd)| cmd == "CLUSTER SLOTS")
            .count()
    }

    /// Connect delay of a reachable node, `None` when it refuses connections.
    fn connect_delay(&self, endpoint: &NodeEndpoint) -> Option<Duration> {
        self.inner
            .nodes
            .lock()
            .get(&endpoint.addr())
            .filter(|n| !n.down)
            .map(|n| n.connect_delay)
    }

    fn handle(&self, endpoint: &NodeEndpoint, args: &[Bytes], read_only: &mut bool) -> Result<RespValue> {
        let mut name = String::from_utf8_lossy(&args[0]).to_uppercase();
        if name == "CLUSTER" && args.len() > 1 {
            name = format!("CLUSTER {}", String::from_utf8_lossy(&args[1]).to_uppercase());
        }
        self.inner.log.lock().push((endpoint.addr(), name.clone()));

        let handler = {
            let mut nodes = self.inner.nodes.lock();
            let node = match nodes.get_mut(&endpoint.addr()) {
                Some(node) if !node.down => node,
                _ => return Err(ClusterError::ConnectionClosed),
            };
            match name.as_str() {
                "CLUSTER SLOTS" => {
                    return Ok(self
                        .inner
                        .slots_reply
                        .lock()
                        .clone()
                        .unwrap_or_else(|| RespValue::error("ERR This instance has cluster support disabled")))
                }
                "ASKING" => return Ok(RespValue::ok()),
                "READONLY" => {
                    *read_only = true;
                    return Ok(RespValue::ok());
                }
                _ => {}
            }
            if let Some(master) = node.master.as_ref().filter(|_| !*read_only) {
                let slot = args.get(1).map(|k| key_slot(k)).unwrap_or(0);
                return Ok(RespValue::error(format!("MOVED {} {}", slot, master.addr())));
            }
            if let Some(reply) = node.script.pop_front() {
                return Ok(reply);
            }
            node.handler.clone()
        };
        Ok(handler(args))
    }
}

fn node_entry(endpoint: &NodeEndpoint) -> RespValue {
    RespValue::array(vec![
        RespValue::bulk_string(Bytes::from(endpoint.host.clone())),
        RespValue::Integer(endpoint.port as i64),
        RespValue::bulk_string(Bytes::from(format!("id-{}", endpoint.port))),
    ])
}

struct MockConnector {
    cluster: MockCluster,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &NodeEndpoint) -> Result<Box<dyn Connection>> {
        self.cluster.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let Some(delay) = self.cluster.connect_delay(endpoint) else {
            return Err(ClusterError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("connection refused: {}", endpoint),
            )));
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.cluster.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            endpoint: endpoint.clone(),
            cluster: self.cluster.clone(),
            pending: None,
            read_only: false,
        }))
    }
}

struct MockConnection {
    endpoint: NodeEndpoint,
    cluster: MockCluster,
    pending: Option<Vec<Bytes>>,
    read_only: bool,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, args: &[Bytes]) -> Result<()> {
        self.pending = Some(args.to_vec());
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<RespValue> {
        let args = self
            .pending
            .take()
            .ok_or_else(|| ClusterError::Protocol("no pending request".to_string()))?;
        self.cluster.handle(&self.endpoint, &args, &mut self.read_only)
    }

    fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }
}
