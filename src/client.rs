//! Cluster client facade

use crate::cluster::{
    ClusterExecutor, NodeReply, Outcome, ResponsePolicy, TopologyProvider, TopologyView,
};
use crate::command::Command;
use crate::config::{ClientConfig, RetryPolicy};
use crate::connection::{Connector, TcpConnector};
use crate::error::{ClusterError, Result};
use crate::observability::{ClusterMetrics, MetricsSnapshot};
use crate::protocol::RespValue;
use bytes::Bytes;
use std::sync::Arc;
use tracing::info;

struct ClientInner {
    executor: ClusterExecutor,
    retry: RetryPolicy,
    metrics: Arc<ClusterMetrics>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.executor.provider().shutdown();
    }
}

/// Cluster-aware client. Cheap to clone; clones share pools and topology.
///
/// # Example
/// ```no_run
/// # use aikv_cluster_client::{ClientConfig, ClusterClient};
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::from_addrs(["127.0.0.1:7000", "127.0.0.1:7001"])?;
/// let client = ClusterClient::connect(config).await?;
///
/// client.set("user:1", "alice").await?;
/// let name = client.get("user:1").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<ClientInner>,
}

impl ClusterClient {
    /// Connect over TCP and discover the cluster from the seeds.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let connector = TcpConnector::new(config.connect_timeout, config.socket_timeout);
        Self::with_connector(config, Arc::new(connector)).await
    }

    /// Like [`connect`](Self::connect) with a custom [`Connector`].
    pub async fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let retry = config.retry;
        let refresh_period = config.refresh_period;
        let metrics = Arc::new(ClusterMetrics::new());

        let provider = TopologyProvider::new(config, connector, metrics.clone());
        let view = provider.refresh().await?;
        info!(
            "Connected to cluster: {} masters, topology version {}",
            view.masters().len(),
            view.version()
        );
        if let Some(period) = refresh_period {
            provider.spawn_refresh_task(period);
        }

        Ok(Self {
            inner: Arc::new(ClientInner {
                executor: ClusterExecutor::new(provider, metrics.clone()),
                retry,
                metrics,
            }),
        })
    }

    fn executor(&self) -> &ClusterExecutor {
        &self.inner.executor
    }

    /// Run a command under the configured retry budget.
    pub async fn query(&self, command: &Command) -> Result<RespValue> {
        Ok(self.execute(command, self.inner.retry).await?.reply)
    }

    /// Run a command under an explicit budget; the outcome carries the
    /// number of attempts.
    pub async fn execute(&self, command: &Command, policy: RetryPolicy) -> Result<Outcome> {
        self.executor().execute(command, policy).await
    }

    /// One reply per master, in node order.
    pub async fn broadcast(&self, command: &Command) -> Result<Vec<NodeReply>> {
        self.executor().broadcast(command, self.inner.retry).await
    }

    /// Send to every master; the first success wins.
    pub async fn broadcast_any(&self, command: &Command) -> Result<NodeReply> {
        self.executor().broadcast_any(command, self.inner.retry).await
    }

    /// Send to every master and require identical replies.
    pub async fn broadcast_unanimous(&self, command: &Command) -> Result<RespValue> {
        self.executor()
            .broadcast_unanimous(command, self.inner.retry)
            .await
    }

    /// Send to every master and merge the replies by `policy`.
    pub async fn broadcast_aggregate(&self, command: &Command, policy: ResponsePolicy) -> Result<RespValue> {
        self.executor()
            .broadcast_aggregate(command, policy, self.inner.retry)
            .await
    }

    /// Value of `key`, `None` when missing.
    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        let reply = self.query(&Command::new("GET").key(key).read_only()).await?;
        match reply {
            RespValue::BulkString(value) => Ok(value),
            RespValue::Null => Ok(None),
            other => Err(unexpected("GET", &other)),
        }
    }

    /// SET `key` to `value`.
    pub async fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        self.query(&Command::new("SET").key(key).arg(value)).await?;
        Ok(())
    }

    /// Delete keys sharing one slot; returns how many existed.
    pub async fn del<I, K>(&self, keys: I) -> Result<i64>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        let command = keys.into_iter().fold(Command::new("DEL"), |cmd, k| cmd.key(k));
        let reply = self.query(&command).await?;
        reply.as_integer().ok_or_else(|| unexpected("DEL", &reply))
    }

    /// PING every master.
    pub async fn ping(&self) -> Result<RespValue> {
        self.query(&Command::new("PING")).await
    }

    /// Total key count over all masters.
    pub async fn dbsize(&self) -> Result<i64> {
        let reply = self
            .broadcast_aggregate(&Command::new("DBSIZE"), ResponsePolicy::AggSum)
            .await?;
        reply.as_integer().ok_or_else(|| unexpected("DBSIZE", &reply))
    }

    /// Flush every master.
    pub async fn flushall(&self) -> Result<()> {
        self.broadcast_unanimous(&Command::new("FLUSHALL")).await?;
        Ok(())
    }

    /// The topology currently used for routing.
    pub fn topology(&self) -> Arc<TopologyView> {
        self.executor().provider().current_view()
    }

    /// Reload the slot table now.
    pub async fn refresh_topology(&self) -> Result<Arc<TopologyView>> {
        self.executor().provider().refresh().await
    }

    /// Counters since startup.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Stop the background refresh and close every connection. Later calls
    /// fail; dropping the last clone closes as well.
    pub fn close(&self) {
        self.executor().provider().shutdown();
    }
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("provider", self.executor().provider())
            .finish()
    }
}

fn unexpected(command: &str, reply: &RespValue) -> ClusterError {
    ClusterError::Protocol(format!("unexpected {} reply: {:?}", command, reply))
}
