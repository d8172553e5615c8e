//! Outbound Relay
//!
//! Consumes this node's own mailbox subject and forwards each delivery to
//! the local sink, acknowledging only after a successful forward. Handling
//! is isolated per message: a malformed payload or a rejected delivery is
//! logged and the message is left un-acknowledged for the work queue to
//! redeliver; nothing in here can take down the consumer loop or the
//! process.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, InboundMessage};
use crate::egress::EventSink;
use crate::event::Event;
use crate::metrics::Metrics;
use crate::routing::SubjectRouter;

use super::ConnectionSupervisor;

pub struct OutboundRelay {
    supervisor: Arc<ConnectionSupervisor>,
    router: Arc<SubjectRouter>,
    sink: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
    shutdown: broadcast::Sender<()>,
}

impl OutboundRelay {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        router: Arc<SubjectRouter>,
        sink: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            supervisor,
            router,
            sink,
            metrics,
            shutdown,
        }
    }

    /// Register the mailbox consumer and spawn its delivery loop.
    ///
    /// Errors when no connection is published or the consumer cannot be
    /// created; a connection-loss failure additionally signals a
    /// reconnect. The caller decides whether to retry.
    pub async fn subscribe(&self) -> Result<(), BrokerError> {
        let Some(conn) = self.supervisor.connection() else {
            return Err(BrokerError::NoConnection);
        };

        let subject = self.router.subscribe_subject();
        let mut messages = match conn.subscribe(&subject).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("creating mailbox subscription failed: {}", e);
                if e.is_connection_lost() {
                    warn!("connection to NATS JetStream has been lost, attempting to reconnect");
                    self.supervisor.request_reconnect();
                }
                return Err(e);
            }
        };
        info!(subject, "subscribed to mailbox");

        let sink = self.sink.clone();
        let metrics = self.metrics.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = messages.next() => {
                        match item {
                            Some(Ok(msg)) => {
                                Self::handle_message(msg.as_ref(), sink.as_ref(), &metrics).await;
                            }
                            Some(Err(e)) => {
                                warn!("mailbox delivery error: {}", e);
                            }
                            None => {
                                warn!("mailbox consumer stream ended");
                                return;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("outbound relay shutting down");
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    /// Handle one mailbox delivery. Every failure path returns without
    /// acknowledging, leaving the message for redelivery.
    async fn handle_message(msg: &dyn InboundMessage, sink: &dyn EventSink, metrics: &Metrics) {
        let event: Event = match serde_json::from_slice(msg.payload()) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    payload = %String::from_utf8_lossy(msg.payload()),
                    "failed to deserialize event: {}", e
                );
                metrics.malformed_messages.inc();
                return;
            }
        };

        if let Err(e) = sink.send(&event).await {
            error!(event_id = %event.id, "failed to send event to sink: {}", e);
            metrics.delivery_failures.inc();
            return;
        }

        if let Err(e) = msg.ack().await {
            // The forward already happened; redelivery after a lost ack is
            // accepted as idempotent at the sink.
            error!(event_id = %event.id, "failed to acknowledge message: {}", e);
            return;
        }

        metrics.events_delivered.inc();
        debug!(event_id = %event.id, "message sent to sink");
    }
}
