//! Fan-out of cluster-wide commands to every master.

use super::aggregate::{aggregate_all, ResponsePolicy};
use super::executor::ClusterExecutor;
use super::types::NodeEndpoint;
use crate::command::Command;
use crate::config::RetryPolicy;
use crate::error::{ClusterError, Result};
use crate::protocol::RespValue;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use tracing::debug;

/// Result of a broadcast on one master
#[derive(Debug)]
pub struct NodeReply {
    pub endpoint: NodeEndpoint,
    pub result: Result<RespValue>,
}

impl NodeReply {
    /// The node answered without an error.
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

impl ClusterExecutor {
    /// Masters to broadcast to, in `host:port` order. Discovers the cluster
    /// first when nothing is known yet.
    async fn broadcast_targets(&self) -> Result<Vec<NodeEndpoint>> {
        let mut view = self.provider().current_view();
        if view.is_empty() {
            view = self.provider().refresh().await?;
        }
        Ok(view.masters())
    }

    fn dispatch_all<'a>(
        &'a self,
        masters: Vec<NodeEndpoint>,
        command: &'a Command,
        policy: RetryPolicy,
    ) -> impl Iterator<Item = impl Future<Output = NodeReply> + 'a> + 'a {
        masters.into_iter().map(move |endpoint| async move {
            let result = self.execute_on(&endpoint, command, policy).await;
            NodeReply { endpoint, result }
        })
    }

    /// Send `command` to every master concurrently. One entry per master,
    /// in node order; each node retries under its own budget.
    pub async fn broadcast(&self, command: &Command, policy: RetryPolicy) -> Result<Vec<NodeReply>> {
        let masters = self.broadcast_targets().await?;
        debug!("Broadcasting {} to {} masters", command.name(), masters.len());
        Ok(futures::future::join_all(self.dispatch_all(masters, command, policy)).await)
    }

    /// First successful reply. The other dispatches are dropped as soon as
    /// one succeeds.
    pub async fn broadcast_any(&self, command: &Command, policy: RetryPolicy) -> Result<NodeReply> {
        let masters = self.broadcast_targets().await?;
        let mut pending: FuturesUnordered<_> = self.dispatch_all(masters, command, policy).collect();

        let mut failures = Vec::new();
        while let Some(reply) = pending.next().await {
            if reply.is_ok() {
                return Ok(reply);
            }
            failures.push(reply);
        }
        Err(broadcast_error(failures))
    }

    /// The common reply when every master succeeded with the same reply.
    pub async fn broadcast_unanimous(&self, command: &Command, policy: RetryPolicy) -> Result<RespValue> {
        self.broadcast_aggregate(command, ResponsePolicy::AllSucceeded, policy)
            .await
    }

    /// Every master's reply folded with `response_policy`. Fails when any
    /// master failed.
    pub async fn broadcast_aggregate(
        &self,
        command: &Command,
        response_policy: ResponsePolicy,
        policy: RetryPolicy,
    ) -> Result<RespValue> {
        let replies = self.broadcast(command, policy).await?;
        if replies.iter().any(|r| !r.is_ok()) {
            return Err(broadcast_error(replies));
        }

        let values = replies.into_iter().filter_map(|r| r.result.ok());
        Ok(aggregate_all(values, response_policy)?.unwrap_or(RespValue::Null))
    }
}

fn broadcast_error(mut replies: Vec<NodeReply>) -> ClusterError {
    replies.sort_by_key(|r| r.endpoint.addr());
    ClusterError::Broadcast(
        replies
            .into_iter()
            .map(|r| (r.endpoint, r.result.map_err(|e| e.to_string())))
            .collect(),
    )
}
