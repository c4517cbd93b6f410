use crate::cluster::{NodeEndpoint, SLOT_COUNT};
use crate::protocol::RespValue;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("MOVED {slot} {endpoint}")]
    Moved { slot: u16, endpoint: NodeEndpoint },

    #[error("ASK {slot} {endpoint}")]
    Ask { slot: u16, endpoint: NodeEndpoint },

    #[error("Malformed redirection: {0}")]
    MalformedRedirect(String),

    #[error("TRYAGAIN {0}")]
    TryAgain(String),

    #[error("CLUSTERDOWN {0}")]
    ClusterDown(String),

    #[error("Keys in request don't hash to the same slot")]
    CrossSlot,

    #[error("Command has no arguments")]
    EmptyCommand,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No seed nodes configured")]
    NoSeeds,

    #[error("{0}")]
    Server(String),

    #[error("Pool for {endpoint} exhausted after waiting {waited:?}")]
    PoolExhausted {
        endpoint: NodeEndpoint,
        waited: Duration,
    },

    #[error("Pool for {0} is closed")]
    PoolClosed(NodeEndpoint),

    #[error("Cluster topology unavailable after trying {tried} node(s): {last}")]
    TopologyUnavailable { tried: usize, last: String },

    #[error("Invalid cluster topology: {0}")]
    InvalidTopology(String),

    #[error("No more cluster attempts left after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ClusterError>,
    },

    #[error("Broadcast failed on {} of {} node(s)", failed_count(.0), .0.len())]
    Broadcast(Vec<(NodeEndpoint, std::result::Result<RespValue, String>)>),

    #[error("Cannot aggregate replies: {0}")]
    AggregationMismatch(String),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
}

fn failed_count(outcomes: &[(NodeEndpoint, std::result::Result<RespValue, String>)]) -> usize {
    outcomes.iter().filter(|(_, r)| r.is_err()).count()
}

impl ClusterError {
    /// Classify an error reply sent by a node.
    ///
    /// Redirections and transient cluster states get their own variants,
    /// everything else is an application error returned as is.
    pub fn from_error_reply(message: &str) -> Self {
        let (keyword, rest) = match message.split_once(' ') {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (message, ""),
        };

        match keyword {
            "MOVED" | "ASK" => match parse_redirect(rest) {
                Some((slot, endpoint)) if keyword == "MOVED" => Self::Moved { slot, endpoint },
                Some((slot, endpoint)) => Self::Ask { slot, endpoint },
                None => Self::MalformedRedirect(message.to_string()),
            },
            "TRYAGAIN" => Self::TryAgain(rest.to_string()),
            "CLUSTERDOWN" => Self::ClusterDown(rest.to_string()),
            _ => Self::Server(message.to_string()),
        }
    }

    /// Failures of the connection itself, after which the socket is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Protocol(_) | Self::Timeout(_) | Self::ConnectionClosed
        )
    }

    /// Errors the executor absorbs and retries under the attempt budget.
    pub fn is_retryable(&self) -> bool {
        self.is_connection_error()
            || matches!(
                self,
                Self::Moved { .. }
                    | Self::Ask { .. }
                    | Self::TryAgain(_)
                    | Self::ClusterDown(_)
                    | Self::PoolExhausted { .. }
                    | Self::PoolClosed(_)
            )
    }
}

/// Parse `<slot> <host>:<port>`. The host may be an IPv6 literal, so the
/// port is split off at the last colon.
fn parse_redirect(rest: &str) -> Option<(u16, NodeEndpoint)> {
    let mut parts = rest.split_whitespace();
    let slot = parts
        .next()?
        .parse::<u16>()
        .ok()
        .filter(|&slot| slot < SLOT_COUNT)?;
    let addr = parts.next()?;
    let endpoint = NodeEndpoint::parse(addr)?;
    Some((slot, endpoint))
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moved_reply() {
        match ClusterError::from_error_reply("MOVED 500 10.0.0.2:7001") {
            ClusterError::Moved { slot, endpoint } => {
                assert_eq!(slot, 500);
                assert_eq!(endpoint.host, "10.0.0.2");
                assert_eq!(endpoint.port, 7001);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ask_reply_ipv6() {
        match ClusterError::from_error_reply("ASK 3999 ::1:7002") {
            ClusterError::Ask { slot, endpoint } => {
                assert_eq!(slot, 3999);
                assert_eq!(endpoint.host, "::1");
                assert_eq!(endpoint.port, 7002);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_transient_replies() {
        assert!(matches!(
            ClusterError::from_error_reply("TRYAGAIN Multiple keys request during rehashing of slot"),
            ClusterError::TryAgain(_)
        ));
        assert!(matches!(
            ClusterError::from_error_reply("CLUSTERDOWN The cluster is down"),
            ClusterError::ClusterDown(_)
        ));
        assert!(matches!(
            ClusterError::from_error_reply("TRYAGAIN"),
            ClusterError::TryAgain(_)
        ));
    }

    #[test]
    fn test_application_error_is_terminal() {
        let err = ClusterError::from_error_reply(
            "WRONGTYPE Operation against a key holding the wrong kind of value",
        );
        assert!(matches!(err, ClusterError::Server(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_malformed_redirect() {
        for reply in ["MOVED abc", "MOVED 500", "ASK 12 nohost"] {
            let err = ClusterError::from_error_reply(reply);
            assert!(matches!(err, ClusterError::MalformedRedirect(_)), "{}", reply);
            assert!(!err.is_connection_error());
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_redirect_slot_out_of_range() {
        assert!(matches!(
            ClusterError::from_error_reply("MOVED 16384 10.0.0.2:7001"),
            ClusterError::MalformedRedirect(_)
        ));
        assert!(matches!(
            ClusterError::from_error_reply("ASK 20000 10.0.0.2:7001"),
            ClusterError::MalformedRedirect(_)
        ));
        assert!(matches!(
            ClusterError::from_error_reply("MOVED 16383 10.0.0.2:7001"),
            ClusterError::Moved { slot: 16383, .. }
        ));
    }
}
