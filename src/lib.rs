//! natsbridge - CloudEvents relay between a hub and edge sites
//!
//! Forwards events over NATS JetStream using per-site mailbox subjects.
//! Each instance runs as either the hub or one edge: locally received
//! events are published to the destination mailbox, and the instance's
//! own mailbox is consumed and forwarded to a local HTTP sink.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod egress;
pub mod event;
pub mod ingress;
pub mod metrics;
pub mod routing;

pub use bridge::{ConnectionSupervisor, InboundRelay, OutboundRelay};
pub use broker::{BrokerError, Connection, Connector, NatsConnector, NatsSettings};
pub use config::Config;
pub use egress::{EventSink, HttpSink};
pub use event::Event;
pub use ingress::IngressServer;
pub use metrics::Metrics;
pub use routing::{BridgeRole, EdgeDirectory, SubjectRouter};
