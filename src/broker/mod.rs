//! Broker Client Abstraction
//!
//! Traits for the durable message broker the bridge publishes to and
//! consumes from, plus the NATS JetStream implementation. The seam exists
//! so the connection supervisor and the relays can be exercised against
//! in-memory fakes; production code only ever constructs the NATS types.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

mod nats;
mod stream;
mod token;

#[cfg(test)]
mod tests;

pub use nats::{NatsConnector, NatsSettings};
pub use stream::{ensure_stream, StreamAdmin};
pub use token::user_from_token;

/// Error type for broker operations
#[derive(Debug)]
pub enum BrokerError {
    /// No connection is currently established
    NoConnection,
    /// Connection to the broker failed or was lost
    ConnectionLost(String),
    /// Credential token is missing a usable identity
    Auth(String),
    /// Stream provisioning failed
    Provision(String),
    /// Publish/subscribe failed for a reason other than connection loss
    Request(String),
}

impl BrokerError {
    /// Whether this error indicates the shared connection is gone and a
    /// reconnect should be requested.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, BrokerError::ConnectionLost(_))
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoConnection => write!(f, "no connection to NATS JetStream"),
            Self::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            Self::Auth(msg) => write!(f, "auth token error: {}", msg),
            Self::Provision(msg) => write!(f, "stream provisioning error: {}", msg),
            Self::Request(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// A message delivered from this node's mailbox subject.
#[async_trait]
pub trait InboundMessage: Send + Sync {
    /// The raw message body.
    fn payload(&self) -> &[u8];

    /// Acknowledge the message so the work queue removes it.
    async fn ack(&self) -> Result<()>;
}

/// Stream of mailbox deliveries; the consumer yields an error item for
/// transient delivery problems rather than terminating.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Box<dyn InboundMessage>>> + Send>>;

/// One live connection to the broker.
///
/// At most one instance is published at a time, owned by the connection
/// supervisor and replaced atomically on reconnect. Dropped on detected
/// failure, never explicitly closed.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Publish a serialized event to a subject within the stream.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Register a consumer on a subject within the stream and return its
    /// delivery stream.
    async fn subscribe(&self, subject: &str) -> Result<MessageStream>;
}

/// Dial + authenticate + provision in one step.
///
/// A connection that cannot provision its stream is never published as
/// ready, so `connect` only returns fully usable connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Connection>>;
}
