//! Slot routing and the retry loop.
//!
//! Every call runs resolve → dispatch → classify until it succeeds, hits a
//! terminal error or spends its [`RetryPolicy`]. Redirections are followed,
//! transient cluster states are retried after a randomized delay and
//! connection failures force a topology refresh.

use super::pool::NodePool;
use super::provider::TopologyProvider;
use super::slot::slot_for_keys;
use super::types::{NodeEndpoint, ReadFrom};
use super::topology::TopologyView;
use crate::command::Command;
use crate::config::RetryPolicy;
use crate::error::{ClusterError, Result};
use crate::observability::ClusterMetrics;
use crate::protocol::RespValue;
use bytes::Bytes;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Reply of a successful call and the number of dispatches it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub reply: RespValue,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
struct Redirect {
    endpoint: NodeEndpoint,
    /// ASK: prime the connection with ASKING and leave the topology alone
    asking: bool,
}

/// Per-call bookkeeping
#[derive(Debug)]
struct RetryState {
    attempts: u32,
    deadline: Instant,
    last: Option<ClusterError>,
    redirect: Option<Redirect>,
    refresh_scheduled: bool,
}

impl RetryState {
    fn new(policy: RetryPolicy) -> Self {
        Self {
            attempts: 0,
            deadline: Instant::now() + policy.max_total_duration,
            last: None,
            redirect: None,
            refresh_scheduled: false,
        }
    }

    fn exhausted(&mut self, policy: RetryPolicy) -> Option<ClusterError> {
        if self.attempts < policy.max_attempts && Instant::now() < self.deadline {
            return None;
        }
        let last = self
            .last
            .take()
            .unwrap_or(ClusterError::Timeout("cluster retry deadline"));
        Some(ClusterError::RetriesExhausted {
            attempts: self.attempts,
            last: Box::new(last),
        })
    }
}

struct Target {
    endpoint: NodeEndpoint,
    pool: Arc<NodePool>,
    asking: bool,
    /// Replica read: the connection must have sent READONLY
    read_only: bool,
}

pub struct ClusterExecutor {
    provider: Arc<TopologyProvider>,
    read_from: ReadFrom,
    retry_delay_cap: Duration,
    round_robin: AtomicUsize,
    metrics: Arc<ClusterMetrics>,
}

impl ClusterExecutor {
    /// Executor routing through `provider`.
    pub fn new(provider: Arc<TopologyProvider>, metrics: Arc<ClusterMetrics>) -> Self {
        let read_from = provider.config().read_from;
        let retry_delay_cap = provider.config().retry_delay_cap;
        Self {
            provider,
            read_from,
            retry_delay_cap,
            round_robin: AtomicUsize::new(0),
            metrics,
        }
    }

    /// Provider this executor routes through.
    pub fn provider(&self) -> &Arc<TopologyProvider> {
        &self.provider
    }

    /// Run `command` against the node owning its keys.
    pub async fn execute(&self, command: &Command, policy: RetryPolicy) -> Result<Outcome> {
        if command.name().is_empty() {
            return Err(ClusterError::EmptyCommand);
        }
        let slot = slot_for_keys(command.keys())?;
        let mut state = RetryState::new(policy);

        loop {
            if state.attempts > 0 {
                if let Some(err) = state.exhausted(policy) {
                    self.metrics.retries_exhausted.inc();
                    warn!("Giving up on {} after {} attempt(s)", command.name(), state.attempts);
                    return Err(err);
                }
            }

            let target = self.resolve(slot, command, &state).await?;
            state.attempts += 1;
            self.metrics.attempts.inc();

            match self.dispatch(&target, command).await {
                Ok(reply) => {
                    return Ok(Outcome {
                        reply,
                        attempts: state.attempts,
                    })
                }
                Err(e) => self.classify(e, &target, &mut state, policy).await?,
            }
        }
    }

    async fn resolve(&self, slot: Option<u16>, command: &Command, state: &RetryState) -> Result<Target> {
        if let Some(redirect) = &state.redirect {
            return Ok(Target {
                pool: self.provider.pool_for(&redirect.endpoint),
                endpoint: redirect.endpoint.clone(),
                asking: redirect.asking,
                read_only: false,
            });
        }

        let mut view = self.provider.current_view();
        if view.is_empty() {
            view = self.provider.refresh().await?;
        }

        let (endpoint, read_only) = match slot.and_then(|s| view.master_for_slot(s).map(|m| (s, m))) {
            Some((slot, master)) => self.pick_node(&view, slot, master, command),
            None => (self.next_master(&view)?, false),
        };
        let pool = match view.pool(&endpoint) {
            Some(pool) => pool,
            None => self.provider.pool_for(&endpoint),
        };

        Ok(Target {
            endpoint,
            pool,
            asking: false,
            read_only,
        })
    }

    /// The master, or one of its replicas for read-only commands when
    /// reading from replicas. The flag is set when a replica was picked.
    fn pick_node(
        &self,
        view: &TopologyView,
        slot: u16,
        master: &NodeEndpoint,
        command: &Command,
    ) -> (NodeEndpoint, bool) {
        if self.read_from == ReadFrom::Replica && command.is_read_only() {
            let replicas: Vec<&NodeEndpoint> = view
                .replicas_for_slot(slot)
                .iter()
                .filter(|r| !self.provider.is_suspect(r))
                .collect();
            if !replicas.is_empty() {
                let i = self.round_robin.fetch_add(1, Ordering::Relaxed) % replicas.len();
                return (replicas[i].clone(), true);
            }
        }
        (master.clone(), false)
    }

    /// Keyless commands and unassigned slots rotate over the masters.
    fn next_master(&self, view: &TopologyView) -> Result<NodeEndpoint> {
        let masters = view.masters();
        if masters.is_empty() {
            return Err(ClusterError::TopologyUnavailable {
                tried: 0,
                last: "no master owns any slot".to_string(),
            });
        }
        let i = self.round_robin.fetch_add(1, Ordering::Relaxed) % masters.len();
        Ok(masters[i].clone())
    }

    /// One round trip. Error replies come back as classified errors; the
    /// connection is released healthy unless the transport failed.
    async fn dispatch(&self, target: &Target, command: &Command) -> Result<RespValue> {
        let mut conn = target.pool.borrow().await?;

        if target.read_only {
            if let Err(e) = conn.ensure_read_only().await {
                conn.release(!e.is_connection_error());
                return Err(e);
            }
        }

        if target.asking {
            match conn.request(&[Bytes::from_static(b"ASKING")]).await {
                Ok(reply) => {
                    if let Some(msg) = reply.as_error() {
                        conn.release(true);
                        return Err(ClusterError::from_error_reply(msg));
                    }
                }
                Err(e) => {
                    conn.release(false);
                    return Err(e);
                }
            }
        }

        match conn.request(command.args()).await {
            Ok(reply) => {
                conn.release(true);
                match reply.as_error() {
                    Some(msg) => Err(ClusterError::from_error_reply(msg)),
                    None => Ok(reply),
                }
            }
            Err(e) => {
                conn.release(false);
                Err(e)
            }
        }
    }

    /// Decide what the next attempt looks like, or return a terminal error.
    async fn classify(
        &self,
        err: ClusterError,
        target: &Target,
        state: &mut RetryState,
        policy: RetryPolicy,
    ) -> Result<()> {
        match &err {
            ClusterError::Moved { slot, endpoint } => {
                self.metrics.moved.inc();
                debug!("Slot {} moved from {} to {}", slot, target.endpoint, endpoint);
                self.provider.assign_slot(*slot, endpoint);
                if !state.refresh_scheduled {
                    state.refresh_scheduled = true;
                    self.schedule_refresh(endpoint.clone());
                }
                state.redirect = Some(Redirect {
                    endpoint: endpoint.clone(),
                    asking: false,
                });
            }
            ClusterError::Ask { slot, endpoint } => {
                self.metrics.ask.inc();
                debug!("Slot {} migrating, asking {}", slot, endpoint);
                state.redirect = Some(Redirect {
                    endpoint: endpoint.clone(),
                    asking: true,
                });
            }
            ClusterError::TryAgain(_)
            | ClusterError::ClusterDown(_)
            | ClusterError::PoolExhausted { .. } => {
                self.metrics.backoffs.inc();
                debug!("{} answered {}, backing off", target.endpoint, err);
                self.backoff(state, policy).await;
            }
            ClusterError::PoolClosed(_) if !self.provider.is_closed() => {
                // Retired by a refresh since we resolved it
                state.redirect = None;
            }
            e if e.is_connection_error() => {
                self.metrics.connection_failures.inc();
                debug!("Connection to {} failed: {}", target.endpoint, e);
                self.provider.mark_suspect(&target.endpoint);
                match tokio::time::timeout_at(state.deadline, self.provider.refresh()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(refresh_err)) => {
                        warn!("Topology refresh after connection failure failed: {}", refresh_err)
                    }
                    Err(_) => debug!("Topology refresh cut short by the call deadline"),
                }
                state.redirect = None;
                self.backoff(state, policy).await;
            }
            _ => return Err(err),
        }

        state.last = Some(err);
        Ok(())
    }

    fn schedule_refresh(&self, hint: NodeEndpoint) {
        let provider = self.provider.clone();
        tokio::spawn(async move {
            if let Err(e) = provider.refresh_from(Some(&hint)).await {
                debug!("Background refresh after MOVED failed: {}", e);
            }
        });
    }

    /// Sleep a random delay in `[0, remaining / attempts_left²]`, capped.
    async fn backoff(&self, state: &RetryState, policy: RetryPolicy) {
        let attempts_left = policy.max_attempts.saturating_sub(state.attempts);
        if attempts_left == 0 {
            return;
        }
        let remaining = state.deadline.saturating_duration_since(Instant::now());
        let max = (remaining / attempts_left.saturating_mul(attempts_left)).min(self.retry_delay_cap);
        let max_ms = max.as_millis() as u64;
        if max_ms == 0 {
            return;
        }
        let delay = rand::thread_rng().gen_range(0..=max_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    /// Run `command` on one specific node with its own budget. Redirections
    /// are returned, not followed.
    pub(crate) async fn execute_on(
        &self,
        endpoint: &NodeEndpoint,
        command: &Command,
        policy: RetryPolicy,
    ) -> Result<RespValue> {
        let mut state = RetryState::new(policy);

        loop {
            if state.attempts > 0 {
                if let Some(err) = state.exhausted(policy) {
                    self.metrics.retries_exhausted.inc();
                    return Err(err);
                }
            }

            let target = Target {
                endpoint: endpoint.clone(),
                pool: self.provider.pool_for(endpoint),
                asking: false,
                read_only: false,
            };
            state.attempts += 1;
            self.metrics.attempts.inc();

            let err = match self.dispatch(&target, command).await {
                Ok(reply) => return Ok(reply),
                Err(e) => e,
            };
            match &err {
                ClusterError::TryAgain(_)
                | ClusterError::ClusterDown(_)
                | ClusterError::PoolExhausted { .. } => {
                    self.metrics.backoffs.inc();
                    self.backoff(&state, policy).await;
                }
                ClusterError::PoolClosed(_) if !self.provider.is_closed() => {}
                e if e.is_connection_error() => {
                    self.metrics.connection_failures.inc();
                    self.provider.mark_suspect(endpoint);
                    self.backoff(&state, policy).await;
                }
                _ => return Err(err),
            }
            state.last = Some(err);
        }
    }
}
