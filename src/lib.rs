pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod observability;
pub mod protocol;

#[cfg(test)]
mod test_util;

pub use client::ClusterClient;
pub use cluster::{NodeEndpoint, Outcome, ReadFrom, ResponsePolicy};
pub use command::Command;
pub use config::{ClientConfig, RetryPolicy};
pub use error::{ClusterError, Result};
pub use protocol::RespValue;
