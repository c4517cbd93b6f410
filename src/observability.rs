//! Client-side counters and logging setup
//!
//! Every executor, provider and client shares one [`ClusterMetrics`]; the
//! counters are plain relaxed atomics and can be read at any time through
//! [`ClusterMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Atomic counter for metrics
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// A counter at zero.
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Add one.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters of the routing and retry machinery
#[derive(Debug, Default)]
pub struct ClusterMetrics {
    /// Commands sent to a node, retries included
    pub attempts: Counter,
    pub moved: Counter,
    pub ask: Counter,
    /// TRYAGAIN / CLUSTERDOWN / pool exhaustion backoffs
    pub backoffs: Counter,
    pub connection_failures: Counter,
    pub refreshes: Counter,
    pub refresh_failures: Counter,
    /// Calls that ran out of attempts or time
    pub retries_exhausted: Counter,
}

/// Plain copy of [`ClusterMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub attempts: u64,
    pub moved: u64,
    pub ask: u64,
    pub backoffs: u64,
    pub connection_failures: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub retries_exhausted: u64,
}

impl ClusterMetrics {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy every counter into a plain snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            attempts: self.attempts.get(),
            moved: self.moved.get(),
            ask: self.ask.get(),
            backoffs: self.backoffs.get(),
            connection_failures: self.connection_failures.get(),
            refreshes: self.refreshes.get(),
            refresh_failures: self.refresh_failures.get(),
            retries_exhausted: self.retries_exhausted.get(),
        }
    }
}

/// Install a `tracing` subscriber filtered at `level` unless `RUST_LOG`
/// says otherwise. Returns false when a subscriber was already installed.
pub fn init_logging(level: &str) -> bool {
    let level_filter = level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    let filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}
