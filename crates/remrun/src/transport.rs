//! # Transport Abstraction
//!
//! Moves encoded frames between a client and the host behind an address.
//!
//! The transport knows nothing about interfaces, methods or faults; it sends
//! opaque bytes and returns opaque bytes. What it must do is tell transient
//! failures (worth re-resolving and retrying) apart from permanent ones.

use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Nothing is listening at the address.
    ConnectionRefused(String),
    /// The connection dropped while a request was outstanding.
    ConnectionLost(String),
    /// The endpoint no longer serves the partition it was resolved for.
    EndpointStale(String),
    /// The connection object was closed or aborted locally.
    Closed,
    Timeout,
    /// The peer refused the message for good; retrying cannot help.
    Rejected(String),
    Io(String),
}

impl TransportError {
    /// Whether re-resolving and retrying may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionRefused(_)
            | Self::ConnectionLost(_)
            | Self::EndpointStale(_)
            | Self::Closed
            | Self::Timeout => true,
            Self::Rejected(_) | Self::Io(_) => false,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionRefused(addr) => write!(f, "Connection refused: {}", addr),
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::EndpointStale(addr) => write!(f, "Endpoint stale: {}", addr),
            Self::Closed => write!(f, "Transport closed"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Rejected(msg) => write!(f, "Rejected by peer: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A connection to one address.
///
/// Object-safe so the Partition Client can cache `Arc<dyn Transport>`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends an encoded frame and waits for the encoded reply.
    async fn request(&self, frame: &[u8]) -> Result<Vec<u8>>;

    /// Sends an encoded frame without waiting for any reply.
    async fn send_one_way(&self, frame: &[u8]) -> Result<()>;

    /// Closes the connection. Later calls fail with [`TransportError::Closed`].
    fn abort(&self);

    fn address(&self) -> &str;
}

/// Opens transports to resolved addresses.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Transport>>;
}
