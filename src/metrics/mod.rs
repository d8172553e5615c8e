//! Prometheus metrics for the bridge
//!
//! Served from the ingress HTTP endpoint at /metrics. Counters only; the
//! interesting state (connected or not) is visible through /readyz.

use prometheus::{IntCounter, Opts, Registry};

/// All bridge metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    /// Events accepted from ingress and published to the broker
    pub events_published: IntCounter,
    /// Publish attempts that failed
    pub publish_failures: IntCounter,
    /// Hub routing lookups that fell back to the inbox prefix
    pub routing_fallbacks: IntCounter,

    /// Mailbox messages forwarded to the sink and acknowledged
    pub events_delivered: IntCounter,
    /// Sink deliveries that failed (message left for redelivery)
    pub delivery_failures: IntCounter,
    /// Mailbox messages that could not be deserialized
    pub malformed_messages: IntCounter,

    /// Successful (re)connects to the broker
    pub reconnects: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_published = IntCounter::with_opts(Opts::new(
            "natsbridge_events_published_total",
            "Events accepted from ingress and published to the broker",
        ))
        .unwrap();

        let publish_failures = IntCounter::with_opts(Opts::new(
            "natsbridge_publish_failures_total",
            "Broker publish attempts that failed",
        ))
        .unwrap();

        let routing_fallbacks = IntCounter::with_opts(Opts::new(
            "natsbridge_routing_fallbacks_total",
            "Hub routing lookups that fell back to the inbox prefix",
        ))
        .unwrap();

        let events_delivered = IntCounter::with_opts(Opts::new(
            "natsbridge_events_delivered_total",
            "Mailbox messages forwarded to the sink and acknowledged",
        ))
        .unwrap();

        let delivery_failures = IntCounter::with_opts(Opts::new(
            "natsbridge_delivery_failures_total",
            "Sink deliveries that failed",
        ))
        .unwrap();

        let malformed_messages = IntCounter::with_opts(Opts::new(
            "natsbridge_malformed_messages_total",
            "Mailbox messages that could not be deserialized",
        ))
        .unwrap();

        let reconnects = IntCounter::with_opts(Opts::new(
            "natsbridge_reconnects_total",
            "Successful (re)connects to the broker",
        ))
        .unwrap();

        registry.register(Box::new(events_published.clone())).unwrap();
        registry.register(Box::new(publish_failures.clone())).unwrap();
        registry.register(Box::new(routing_fallbacks.clone())).unwrap();
        registry.register(Box::new(events_delivered.clone())).unwrap();
        registry.register(Box::new(delivery_failures.clone())).unwrap();
        registry.register(Box::new(malformed_messages.clone())).unwrap();
        registry.register(Box::new(reconnects.clone())).unwrap();

        Self {
            registry,
            events_published,
            publish_failures,
            routing_fallbacks,
            events_delivered,
            delivery_failures,
            malformed_messages,
            reconnects,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
