//! Inbound Relay
//!
//! Accepts one locally received event and republishes it to the broker on
//! the subject the routing policy picks. Fails fast when no connection is
//! published; the ingress caller surfaces that as a delivery failure so
//! the original sender retries.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, warn};

use crate::broker::BrokerError;
use crate::event::Event;
use crate::metrics::Metrics;
use crate::routing::SubjectRouter;

use super::ConnectionSupervisor;

pub struct InboundRelay {
    supervisor: Arc<ConnectionSupervisor>,
    router: Arc<SubjectRouter>,
    metrics: Arc<Metrics>,
}

impl InboundRelay {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        router: Arc<SubjectRouter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            supervisor,
            router,
            metrics,
        }
    }

    /// Publish one event to its destination mailbox subject.
    ///
    /// No internal retry or buffering; one broker publish per call, and at
    /// most one reconnect signal on failure.
    pub async fn forward(&self, event: &Event) -> Result<(), BrokerError> {
        let Some(conn) = self.supervisor.connection() else {
            warn!("no connection to NATS JetStream");
            return Err(BrokerError::NoConnection);
        };

        let subject = self.router.publish_subject(event);
        if subject == self.router.inbox_prefix() {
            self.metrics.routing_fallbacks.inc();
        }

        let bytes = serde_json::to_vec(event)
            .map_err(|e| BrokerError::Request(format!("could not serialize event: {}", e)))?;

        match conn.publish(&subject, Bytes::from(bytes)).await {
            Ok(()) => {
                self.metrics.events_published.inc();
                info!(subject, event_id = %event.id, "event published");
                Ok(())
            }
            Err(e) => {
                if e.is_connection_lost() {
                    warn!("connection to NATS JetStream has been lost, attempting to reconnect");
                    self.supervisor.request_reconnect();
                }
                self.metrics.publish_failures.inc();
                Err(e)
            }
        }
    }
}
