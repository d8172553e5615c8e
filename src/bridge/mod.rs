//! Bridge Core
//!
//! The connection/routing engine: a supervisor that owns the single shared
//! broker connection and recovers it in the background, an inbound relay
//! that republishes locally received events onto mailbox subjects, and an
//! outbound relay that consumes this node's own mailbox and forwards
//! deliveries to the local sink with per-message acknowledgment.
//!
//! Relays never retry or buffer on their own: a publish failure is
//! surfaced to the ingress caller (whose sender retries upstream), and an
//! undeliverable mailbox message is simply left un-acknowledged so the
//! work queue redelivers it.

use std::time::Duration;

mod inbound;
mod outbound;
mod supervisor;

#[cfg(test)]
mod tests;

pub use inbound::InboundRelay;
pub use outbound::OutboundRelay;
pub use supervisor::ConnectionSupervisor;

/// Maximum number of outstanding reconnect requests; further signals are
/// dropped because an attempt is already pending or in flight.
pub const MAX_RECONNECT_REQUESTS: usize = 10;

/// Delay between attempts in the reconnect retry loop.
pub const RECONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
