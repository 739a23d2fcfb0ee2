//! Error taxonomy for DHT operations.

use std::net::SocketAddr;

/// Errors surfaced by the DHT engine and its transport.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// No response arrived within the per-call deadline.
    #[error("request to {address} timed out")]
    Timeout { address: SocketAddr },

    /// The key is not held by the local store, or it has expired.
    #[error("key not found")]
    NotFound,

    /// A payload could not be decoded, or carried an unexpected message kind.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The remote peer answered with an `ERROR` message.
    #[error("peer at {address} rejected the request")]
    Rejected { address: SocketAddr },

    /// A store could not locate any peer to replicate to.
    #[error("no reachable nodes to store the value on")]
    NoTargetNodes,

    /// A textual identifier was malformed.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// The bootstrap node could not be reached.
    #[error("join failed: {0}")]
    JoinFailed(String),

    /// The listening socket could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Configuration was missing or could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Convenience result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_names_the_peer() {
        let address: SocketAddr = "127.0.0.1:4000".parse().expect("valid addr");
        let err = DhtError::Timeout { address };
        assert!(err.to_string().contains("127.0.0.1:4000"));

        let err = DhtError::Rejected { address };
        assert!(err.to_string().contains("rejected"));
    }
}
