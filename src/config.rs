//! Client configuration.
//!
//! A [`ClientConfig`] is built in code with the `with_*` methods or loaded
//! from a TOML file:
//!
//! ```toml
//! seeds = ["127.0.0.1:7000", "127.0.0.1:7001"]
//! max_attempts = 5
//! max_total_duration_ms = 10000
//! refresh_period_ms = 30000
//! read_from = "replica"
//!
//! [pool]
//! max_size = 8
//! borrow_timeout_ms = 2000
//! ```

use crate::cluster::{NodeEndpoint, ReadFrom};
use crate::error::{ClusterError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Per-node connection pool bounds.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum live connections (idle + borrowed) per node
    pub max_size: usize,
    /// Maximum idle connections kept for reuse
    pub max_idle: usize,
    /// How long `borrow` waits when every connection is in use
    pub borrow_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_SIZE,
            max_idle: DEFAULT_POOL_SIZE,
            borrow_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Attempt and time budget of a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_total_duration: Duration,
}

impl RetryPolicy {
    /// Attempt and wall-clock limits for one call.
    pub fn new(max_attempts: u32, max_total_duration: Duration) -> Self {
        Self {
            max_attempts,
            max_total_duration,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT * DEFAULT_MAX_ATTEMPTS)
    }
}

/// Configuration of a cluster client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Initial endpoints used to discover the cluster; one reachable seed suffices
    pub seeds: Vec<NodeEndpoint>,

    pub pool: PoolConfig,

    pub connect_timeout: Duration,

    /// Bound on each socket read and write
    pub socket_timeout: Duration,

    /// Default per-call budget
    pub retry: RetryPolicy,

    /// Period of the background topology refresh; `None` refreshes reactively only
    pub refresh_period: Option<Duration>,

    /// Upper bound of the randomized delay between retries
    pub retry_delay_cap: Duration,

    pub read_from: ReadFrom,

    /// Accept discovery replies that leave slots unassigned
    pub allow_partial_coverage: bool,
}

impl ClientConfig {
    /// Create a configuration with default settings for the given seeds
    ///
    /// # Example
    ///
    /// ```
    /// use aikv_cluster_client::{ClientConfig, NodeEndpoint};
    ///
    /// let config = ClientConfig::new(vec![NodeEndpoint::new("127.0.0.1", 7000)]);
    /// assert_eq!(config.retry.max_attempts, 5);
    /// assert!(config.refresh_period.is_none());
    /// ```
    pub fn new(seeds: Vec<NodeEndpoint>) -> Self {
        Self {
            seeds,
            pool: PoolConfig::default(),
            connect_timeout: DEFAULT_TIMEOUT,
            socket_timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
            refresh_period: None,
            retry_delay_cap: Duration::from_millis(100),
            read_from: ReadFrom::Master,
            allow_partial_coverage: false,
        }
    }

    /// Parse seeds given as `host:port` strings
    pub fn from_addrs<I, S>(addrs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let seeds = addrs
            .into_iter()
            .map(|a| {
                NodeEndpoint::parse(a.as_ref()).ok_or_else(|| {
                    ClusterError::InvalidConfig(format!("invalid seed address: {}", a.as_ref()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(seeds))
    }

    /// Max connections per node.
    pub fn with_pool_size(mut self, max_size: usize) -> Self {
        self.pool.max_size = max_size;
        self.pool.max_idle = self.pool.max_idle.min(max_size);
        self
    }

    /// How long a borrow waits for a free connection.
    pub fn with_borrow_timeout(mut self, timeout: Duration) -> Self {
        self.pool.borrow_timeout = timeout;
        self
    }

    /// TCP connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the socket timeout. The default total retry duration follows it
    /// (`socket_timeout * max_attempts`) unless set explicitly afterwards.
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self.retry.max_total_duration = timeout * self.retry.max_attempts;
        self
    }

    /// Attempt limit for calls without an explicit policy.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    /// Wall-clock limit for calls without an explicit policy.
    pub fn with_max_total_duration(mut self, duration: Duration) -> Self {
        self.retry.max_total_duration = duration;
        self
    }

    /// Period of the background refresh; zero disables it.
    pub fn with_refresh_period(mut self, period: Duration) -> Self {
        self.refresh_period = Some(period);
        self
    }

    /// Upper bound of one retry backoff.
    pub fn with_retry_delay_cap(mut self, cap: Duration) -> Self {
        self.retry_delay_cap = cap;
        self
    }

    /// Route read-only commands to replicas or masters.
    pub fn with_read_from(mut self, read_from: ReadFrom) -> Self {
        self.read_from = read_from;
        self
    }

    /// Accept a slot table with holes.
    pub fn with_partial_coverage(mut self, allow: bool) -> Self {
        self.allow_partial_coverage = allow;
        self
    }

    /// Reject configurations the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.seeds.is_empty() {
            return Err(ClusterError::NoSeeds);
        }
        if self.retry.max_attempts == 0 {
            return Err(ClusterError::InvalidConfig(
                "max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.pool.max_size == 0 {
            return Err(ClusterError::InvalidConfig(
                "pool max_size must be greater than 0".to_string(),
            ));
        }
        if self.refresh_period == Some(Duration::ZERO) {
            return Err(ClusterError::InvalidConfig(
                "refresh_period must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;
        file.into_config()
    }

    /// Load a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

/// Pool section of the configuration file
#[derive(Deserialize, Default)]
struct PoolSection {
    max_size: Option<usize>,
    max_idle: Option<usize>,
    borrow_timeout_ms: Option<u64>,
}

/// Root of the configuration file
#[derive(Deserialize)]
struct ConfigFile {
    seeds: Vec<String>,
    #[serde(default)]
    pool: PoolSection,
    connect_timeout_ms: Option<u64>,
    socket_timeout_ms: Option<u64>,
    max_attempts: Option<u32>,
    max_total_duration_ms: Option<u64>,
    refresh_period_ms: Option<u64>,
    retry_delay_cap_ms: Option<u64>,
    #[serde(default)]
    read_from: ReadFrom,
    #[serde(default)]
    allow_partial_coverage: bool,
}

impl ConfigFile {
    fn into_config(self) -> Result<ClientConfig> {
        let mut config = ClientConfig::from_addrs(&self.seeds)?;

        if let Some(n) = self.max_attempts {
            config = config.with_max_attempts(n);
        }
        if let Some(ms) = self.socket_timeout_ms {
            config = config.with_socket_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.max_total_duration_ms {
            config = config.with_max_total_duration(Duration::from_millis(ms));
        }
        if let Some(ms) = self.connect_timeout_ms {
            config = config.with_connect_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.refresh_period_ms {
            config = config.with_refresh_period(Duration::from_millis(ms));
        }
        if let Some(ms) = self.retry_delay_cap_ms {
            config = config.with_retry_delay_cap(Duration::from_millis(ms));
        }
        if let Some(size) = self.pool.max_size {
            config = config.with_pool_size(size);
        }
        if let Some(idle) = self.pool.max_idle {
            config.pool.max_idle = idle;
        }
        if let Some(ms) = self.pool.borrow_timeout_ms {
            config = config.with_borrow_timeout(Duration::from_millis(ms));
        }

        config.read_from = self.read_from;
        config.allow_partial_coverage = self.allow_partial_coverage;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_addrs(["127.0.0.1:7000"]).unwrap();
        assert_eq!(config.retry.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.retry.max_total_duration, Duration::from_secs(10));
        assert_eq!(config.pool.max_size, 8);
        assert_eq!(config.read_from, ReadFrom::Master);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_socket_timeout_scales_total_duration() {
        let config = ClientConfig::from_addrs(["a:1"])
            .unwrap()
            .with_max_attempts(3)
            .with_socket_timeout(Duration::from_millis(100));
        assert_eq!(config.retry.max_total_duration, Duration::from_millis(300));
    }

    #[test]
    fn test_validate() {
        assert!(matches!(
            ClientConfig::new(vec![]).validate(),
            Err(ClusterError::NoSeeds)
        ));
        let zero = ClientConfig::from_addrs(["a:1"]).unwrap().with_max_attempts(0);
        assert!(matches!(zero.validate(), Err(ClusterError::InvalidConfig(_))));
        assert!(ClientConfig::from_addrs(["no-port"]).is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = ClientConfig::from_toml_str(
            r#"
            seeds = ["10.0.0.1:7000", "10.0.0.2:7000"]
            max_attempts = 3
            socket_timeout_ms = 500
            refresh_period_ms = 1000
            read_from = "replica"

            [pool]
            max_size = 4
            borrow_timeout_ms = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.seeds.len(), 2);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.max_total_duration, Duration::from_millis(1500));
        assert_eq!(config.refresh_period, Some(Duration::from_secs(1)));
        assert_eq!(config.read_from, ReadFrom::Replica);
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.max_idle, 4);
        assert_eq!(config.pool.borrow_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "seeds = [\"127.0.0.1:7000\"]").unwrap();
        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.seeds[0].port, 7000);
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            ClientConfig::from_toml_str("seeds = 3"),
            Err(ClusterError::Config(_))
        ));
    }
}
