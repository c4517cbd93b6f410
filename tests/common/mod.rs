//! Loopback RESP servers impersonating cluster nodes.

#![allow(dead_code)]

use aikv_cluster_client::cluster::{key_slot, NodeEndpoint};
use aikv_cluster_client::protocol::{RespParser, RespValue};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Default)]
struct NodeState {
    script: Mutex<VecDeque<RespValue>>,
    log: Mutex<Vec<String>>,
    down: AtomicBool,
}

pub struct TestNode {
    pub endpoint: NodeEndpoint,
    state: Arc<NodeState>,
    accept: JoinHandle<()>,
}

/// A set of nodes sharing one `CLUSTER SLOTS` table.
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    slots: Arc<Mutex<RespValue>>,
}

impl TestCluster {
    pub async fn start(count: usize) -> Self {
        let slots = Arc::new(Mutex::new(RespValue::array(vec![])));
        let mut nodes = Vec::with_capacity(count);

        for _ in 0..count {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let endpoint = NodeEndpoint::new("127.0.0.1", port);
            let state = Arc::new(NodeState::default());

            let accept = {
                let state = state.clone();
                let slots = slots.clone();
                let me = endpoint.clone();
                tokio::spawn(async move {
                    while let Ok((socket, _)) = listener.accept().await {
                        tokio::spawn(serve(socket, me.clone(), state.clone(), slots.clone()));
                    }
                })
            };

            nodes.push(TestNode {
                endpoint,
                state,
                accept,
            });
        }

        Self { nodes, slots }
    }

    /// Three nodes splitting the slots evenly.
    pub async fn three_masters() -> Self {
        let cluster = Self::start(3).await;
        cluster.assign(&[(0, 5460, 0), (5461, 10922, 1), (10923, 16383, 2)]);
        cluster
    }

    pub fn endpoint(&self, node: usize) -> NodeEndpoint {
        self.nodes[node].endpoint.clone()
    }

    pub fn seeds(&self) -> Vec<NodeEndpoint> {
        self.nodes.iter().map(|n| n.endpoint.clone()).collect()
    }

    /// Publish `(start, end, node index)` ranges as the slot table.
    pub fn assign(&self, ranges: &[(u16, u16, usize)]) {
        let entries = ranges
            .iter()
            .map(|&(start, end, node)| {
                let ep = &self.nodes[node].endpoint;
                RespValue::array(vec![
                    RespValue::Integer(start as i64),
                    RespValue::Integer(end as i64),
                    RespValue::array(vec![
                        RespValue::bulk_string(Bytes::from(ep.host.clone())),
                        RespValue::Integer(ep.port as i64),
                        RespValue::bulk_string(Bytes::from(format!("node-{}", node))),
                    ]),
                ])
            })
            .collect();
        *self.slots.lock().unwrap() = RespValue::array(entries);
    }

    /// Replies sent, in order, to the next data commands of a node.
    pub fn script(&self, node: usize, replies: Vec<RespValue>) {
        self.nodes[node].state.script.lock().unwrap().extend(replies);
    }

    /// Command names received by a node, discovery excluded.
    pub fn requests(&self, node: usize) -> Vec<String> {
        self.nodes[node]
            .state
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() != "CLUSTER")
            .cloned()
            .collect()
    }

    pub fn slots_requests(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| n.state.log.lock().unwrap().iter().filter(|c| c.as_str() == "CLUSTER").count())
            .sum()
    }

    /// Stop accepting and drop open connections: later connects are refused.
    pub async fn kill(&self, node: usize) {
        self.nodes[node].state.down.store(true, Ordering::SeqCst);
        self.nodes[node].accept.abort();
        // Let the runtime drop the aborted accept loop and its listener
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.accept.abort();
        }
    }
}

async fn serve(
    mut socket: TcpStream,
    me: NodeEndpoint,
    state: Arc<NodeState>,
    slots: Arc<Mutex<RespValue>>,
) {
    let mut parser = RespParser::new(4096);
    let mut buf = vec![0u8; 4096];

    loop {
        loop {
            let request = match parser.parse() {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(_) => return,
            };
            if state.down.load(Ordering::SeqCst) {
                return;
            }
            let reply = handle(&request, &me, &state, &slots);
            if socket.write_all(&reply.serialize()).await.is_err() {
                return;
            }
        }

        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => parser.feed(&buf[..n]),
        }
    }
}

fn handle(
    request: &RespValue,
    me: &NodeEndpoint,
    state: &NodeState,
    slots: &Mutex<RespValue>,
) -> RespValue {
    let args: Vec<&[u8]> = request
        .as_array()
        .unwrap_or(&[])
        .iter()
        .filter_map(|a| a.as_bytes())
        .collect();
    let Some(name) = args.first() else {
        return RespValue::error("ERR empty command");
    };
    let name = String::from_utf8_lossy(name).to_uppercase();
    state.log.lock().unwrap().push(name.clone());

    match name.as_str() {
        "CLUSTER" => return slots.lock().unwrap().clone(),
        "ASKING" => return RespValue::ok(),
        _ => {}
    }
    if let Some(reply) = state.script.lock().unwrap().pop_front() {
        return reply;
    }

    match name.as_str() {
        "PING" => RespValue::simple_string("PONG"),
        "GET" => RespValue::bulk_string(Bytes::from(me.addr())),
        "DBSIZE" => RespValue::Integer(1),
        _ => RespValue::ok(),
    }
}

/// A key hashing to `slot`.
pub fn key_for_slot(slot: u16) -> String {
    (0..)
        .map(|i| format!("key:{}", i))
        .find(|k| key_slot(k.as_bytes()) == slot)
        .unwrap()
}
