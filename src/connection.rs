//! Connections to single cluster nodes.
//!
//! The executor only talks to the [`Connection`] and [`Connector`] traits;
//! [`TcpConnector`] is the production implementation speaking RESP over a
//! tokio `TcpStream`.

use crate::cluster::NodeEndpoint;
use crate::error::{ClusterError, Result};
use crate::protocol::{encode_command, RespParser, RespValue};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// A bidirectional request/reply channel to one node.
#[async_trait]
pub trait Connection: Send {
    /// Write one command (name followed by its arguments).
    async fn send(&mut self, args: &[Bytes]) -> Result<()>;

    /// Read the next reply. Error replies are returned as values, not errors.
    async fn read_reply(&mut self) -> Result<RespValue>;

    /// The node this connection talks to.
    fn endpoint(&self) -> &NodeEndpoint;

    /// Send a command and read its reply.
    async fn request(&mut self, args: &[Bytes]) -> Result<RespValue> {
        self.send(args).await?;
        self.read_reply().await
    }
}

/// Opens new connections, used by the node pools.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &NodeEndpoint) -> Result<Box<dyn Connection>>;
}

/// RESP over TCP with per-operation socket timeouts.
pub struct TcpConnection {
    stream: TcpStream,
    parser: RespParser,
    endpoint: NodeEndpoint,
    socket_timeout: Duration,
}

impl TcpConnection {
    /// Connect and enable TCP_NODELAY, bounded by `connect_timeout`.
    pub async fn connect(
        endpoint: &NodeEndpoint,
        connect_timeout: Duration,
        socket_timeout: Duration,
    ) -> Result<Self> {
        let stream = timeout(
            connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| ClusterError::Timeout("connect"))??;
        stream.set_nodelay(true)?;

        debug!("Connected to {}", endpoint);
        Ok(Self {
            stream,
            parser: RespParser::new(8192),
            endpoint: endpoint.clone(),
            socket_timeout,
        })
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&mut self, args: &[Bytes]) -> Result<()> {
        let frame = encode_command(args);
        timeout(self.socket_timeout, self.stream.write_all(&frame))
            .await
            .map_err(|_| ClusterError::Timeout("write"))??;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<RespValue> {
        loop {
            if let Some(value) = self.parser.parse()? {
                return Ok(value);
            }

            let n = timeout(
                self.socket_timeout,
                self.stream.read_buf(self.parser.buffer_mut()),
            )
            .await
            .map_err(|_| ClusterError::Timeout("read"))??;

            if n == 0 {
                return Err(ClusterError::ConnectionClosed);
            }
        }
    }

    fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }
}

/// Connector producing [`TcpConnection`]s.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
}

impl TcpConnector {
    /// Connector applying both timeouts to every connection.
    pub fn new(connect_timeout: Duration, socket_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            socket_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &NodeEndpoint) -> Result<Box<dyn Connection>> {
        let conn = TcpConnection::connect(endpoint, self.connect_timeout, self.socket_timeout).await?;
        Ok(Box::new(conn))
    }
}
