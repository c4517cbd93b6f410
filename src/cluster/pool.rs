//! Bounded connection pool for one cluster node.

use super::NodeEndpoint;
use crate::config::PoolConfig;
use crate::connection::{Connection, Connector};
use crate::error::{ClusterError, Result};
use crate::protocol::RespValue;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::debug;

/// Point-in-time counters of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections, idle or borrowed
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
}

/// Reusable connections to a single [`NodeEndpoint`].
///
/// At most `max_size` connections are borrowed at once; further borrowers
/// wait up to `borrow_timeout`. Connections are opened lazily through the
/// [`Connector`].
pub struct NodePool {
    endpoint: NodeEndpoint,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
    live: AtomicUsize,
    closed: AtomicBool,
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    read_only: bool,
}

impl NodePool {
    /// Create an empty pool; nothing is connected until the first borrow.
    pub fn new(endpoint: NodeEndpoint, connector: Arc<dyn Connector>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(VecDeque::with_capacity(config.max_idle)),
            live: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            endpoint,
            connector,
            config,
        })
    }

    /// The node this pool connects to.
    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Borrow a connection, reusing an idle one when available.
    pub async fn borrow(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(ClusterError::PoolClosed(self.endpoint.clone()));
        }

        let permit = match timeout(
            self.config.borrow_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ClusterError::PoolClosed(self.endpoint.clone())),
            Err(_) => {
                return Err(ClusterError::PoolExhausted {
                    endpoint: self.endpoint.clone(),
                    waited: self.config.borrow_timeout,
                })
            }
        };

        let reused = self.idle.lock().pop_front();
        let (conn, read_only) = match reused {
            Some(idle) => (idle.conn, idle.read_only),
            None => {
                let conn = self.connector.connect(&self.endpoint).await?;
                self.live.fetch_add(1, Ordering::AcqRel);
                (conn, false)
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            read_only,
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    fn give_back(&self, conn: Box<dyn Connection>, read_only: bool, healthy: bool) {
        if healthy {
            let mut idle = self.idle.lock();
            // Checked under the idle lock so a concurrent close cannot miss it
            if !self.is_closed() && idle.len() < self.config.max_idle {
                idle.push_back(IdleConnection { conn, read_only });
                return;
            }
        }

        self.live.fetch_sub(1, Ordering::AcqRel);
        drop(conn);
    }

    /// Stop handing out connections and drop the idle ones. Borrowed
    /// connections are closed when they come back.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let drained: Vec<_> = self.idle.lock().drain(..).collect();
        self.live.fetch_sub(drained.len(), Ordering::AcqRel);
        debug!("Closed pool for {} ({} idle dropped)", self.endpoint, drained.len());
    }

    /// Current live, idle and borrowed counts.
    pub fn stats(&self) -> PoolStats {
        let live = self.live.load(Ordering::Acquire);
        let idle = self.idle.lock().len();
        PoolStats {
            live,
            idle,
            in_use: live.saturating_sub(idle),
        }
    }
}

impl std::fmt::Debug for NodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePool")
            .field("endpoint", &self.endpoint)
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A borrowed connection. Hand it back with [`PooledConnection::release`];
/// dropping it without releasing discards the connection.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    /// READONLY was sent on this connection
    read_only: bool,
    pool: Arc<NodePool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// The node this connection talks to.
    pub fn endpoint(&self) -> &NodeEndpoint {
        self.pool.endpoint()
    }

    /// Send READONLY unless this connection already did, so a replica
    /// serves reads instead of redirecting them to its master.
    pub async fn ensure_read_only(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let reply = self.request(&[Bytes::from_static(b"READONLY")]).await?;
        if let Some(msg) = reply.as_error() {
            return Err(ClusterError::from_error_reply(msg));
        }
        self.read_only = true;
        Ok(())
    }

    /// Send one command and read its reply.
    pub async fn request(&mut self, args: &[Bytes]) -> Result<RespValue> {
        match self.conn.as_mut() {
            Some(conn) => conn.request(args).await,
            None => Err(ClusterError::ConnectionClosed),
        }
    }

    /// Return the connection: healthy ones go back to the idle list,
    /// unhealthy ones are closed.
    pub fn release(mut self, healthy: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn, self.read_only, healthy);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("endpoint", self.endpoint())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn, self.read_only, false);
        }
    }
}
