//! Bridge Core Tests
//!
//! The supervisor and relays are exercised against in-memory fakes of the
//! broker seam. Time-dependent tests run with a paused tokio clock so the
//! 1 s retry interval elapses instantly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use crate::broker::{
    BrokerError, Connection, Connector, InboundMessage, MessageStream, Result,
};
use crate::egress::{EventSink, SinkError};
use crate::event::Event;
use crate::metrics::Metrics;
use crate::routing::{BridgeRole, EdgeDirectory, SubjectRouter, DEFAULT_SUBJECT_ROOT};

use super::{ConnectionSupervisor, InboundRelay, OutboundRelay, MAX_RECONNECT_REQUESTS};

// =============================================================================
// Fakes
// =============================================================================

#[derive(Default)]
struct MockConnection {
    published: Mutex<Vec<(String, Bytes)>>,
    subscribed: Mutex<Vec<String>>,
    /// Next publish fails as a lost connection
    fail_publish_lost: AtomicBool,
    /// Handed out by `subscribe`, at most once
    incoming: Mutex<Option<mpsc::Receiver<Result<Box<dyn InboundMessage>>>>>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        if self.fail_publish_lost.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionLost("broken pipe".to_string()));
        }
        self.published.lock().push((subject.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<MessageStream> {
        self.subscribed.lock().push(subject.to_string());
        let rx = self
            .incoming
            .lock()
            .take()
            .ok_or_else(|| BrokerError::Request("no subscription source".to_string()))?;
        Ok(Box::pin(futures_util::stream::unfold(
            rx,
            |mut rx| async move { rx.recv().await.map(|item| (item, rx)) },
        )))
    }
}

#[derive(Default)]
struct MockConnector {
    /// Number of initial attempts that fail before connects succeed
    fail_first: usize,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    connect_delay: Option<Duration>,
    handed_out: Mutex<Vec<Arc<MockConnection>>>,
    /// Receiver installed on the next connection handed out
    next_incoming: Mutex<Option<mpsc::Receiver<Result<Box<dyn InboundMessage>>>>>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if attempt < self.fail_first {
            return Err(BrokerError::ConnectionLost("connection refused".to_string()));
        }

        let conn = Arc::new(MockConnection {
            incoming: Mutex::new(self.next_incoming.lock().take()),
            ..Default::default()
        });
        self.handed_out.lock().push(conn.clone());
        Ok(conn)
    }
}

struct MockMessage {
    payload: Vec<u8>,
    acks: Arc<AtomicUsize>,
    fail_ack: bool,
}

impl MockMessage {
    fn new(payload: impl Into<Vec<u8>>, acks: Arc<AtomicUsize>) -> Box<dyn InboundMessage> {
        Box::new(Self {
            payload: payload.into(),
            acks,
            fail_ack: false,
        })
    }

    fn with_failing_ack(
        payload: impl Into<Vec<u8>>,
        acks: Arc<AtomicUsize>,
    ) -> Box<dyn InboundMessage> {
        Box::new(Self {
            payload: payload.into(),
            acks,
            fail_ack: true,
        })
    }
}

#[async_trait]
impl InboundMessage for MockMessage {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<()> {
        if self.fail_ack {
            return Err(BrokerError::Request("ack timeout".to_string()));
        }
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<Event>>,
    reject: AtomicBool,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn send(&self, event: &Event) -> std::result::Result<(), SinkError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(SinkError::Rejected(500));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn hub_router(entries: &[(&str, &str)]) -> Arc<SubjectRouter> {
    let directory = EdgeDirectory::from_map(
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
    );
    Arc::new(SubjectRouter::new(
        BridgeRole::Hub,
        "",
        directory,
        DEFAULT_SUBJECT_ROOT,
    ))
}

fn edge_router(mailbox: &str) -> Arc<SubjectRouter> {
    Arc::new(SubjectRouter::new(
        BridgeRole::Edge,
        mailbox,
        EdgeDirectory::default(),
        DEFAULT_SUBJECT_ROOT,
    ))
}

fn supervisor(
    connector: Arc<MockConnector>,
) -> (Arc<ConnectionSupervisor>, mpsc::Receiver<()>, broadcast::Sender<()>) {
    let (shutdown, _) = broadcast::channel(1);
    let (supervisor, rx) =
        ConnectionSupervisor::new(connector, Arc::new(Metrics::new()), shutdown.clone());
    (supervisor, rx, shutdown)
}

/// Spawn the supervisor loop, trigger the first connect and wait for it.
async fn connect_supervisor(
    connector: Arc<MockConnector>,
) -> (Arc<ConnectionSupervisor>, broadcast::Sender<()>) {
    let (supervisor, rx, shutdown) = self::supervisor(connector);
    tokio::spawn(supervisor.clone().run(rx));
    supervisor.request_reconnect();
    wait_until(|| supervisor.is_connected()).await;
    (supervisor, shutdown)
}

async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

// =============================================================================
// Connection Supervisor
// =============================================================================

#[test]
fn test_reconnect_signals_coalesce() {
    let (supervisor, mut rx, _shutdown) = supervisor(Arc::new(MockConnector::default()));

    // Nothing drains the queue; extra signals must be dropped, not block.
    for _ in 0..25 {
        supervisor.request_reconnect();
    }

    let mut pending = 0;
    while rx.try_recv().is_ok() {
        pending += 1;
    }
    assert_eq!(pending, MAX_RECONNECT_REQUESTS);
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_retries_until_connected() {
    let connector = Arc::new(MockConnector {
        fail_first: 3,
        ..Default::default()
    });
    let (supervisor, rx, _shutdown) = self::supervisor(connector.clone());

    assert!(!supervisor.is_connected());
    tokio::spawn(supervisor.clone().run(rx));
    supervisor.request_reconnect();

    wait_until(|| supervisor.is_connected()).await;
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(connector.handed_out.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_concurrent_retry_loops() {
    let connector = Arc::new(MockConnector {
        connect_delay: Some(Duration::from_millis(200)),
        ..Default::default()
    });
    let (supervisor, rx, _shutdown) = self::supervisor(connector.clone());
    tokio::spawn(supervisor.clone().run(rx));

    for _ in 0..10 {
        supervisor.request_reconnect();
    }

    wait_until(|| supervisor.is_connected()).await;
    assert_eq!(connector.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_replaces_connection_handle() {
    let connector = Arc::new(MockConnector::default());
    let (supervisor, _shutdown) = connect_supervisor(connector.clone()).await;

    let first = supervisor.connection().unwrap();

    // Simulated loss: a relay signals reconnect; the supervisor publishes
    // a fresh handle and the old one is never handed out again.
    supervisor.request_reconnect();
    wait_until(|| connector.handed_out.lock().len() == 2).await;
    wait_until(|| {
        let current = supervisor.connection().unwrap();
        !Arc::ptr_eq(&current, &first)
    })
    .await;
}

// =============================================================================
// Inbound Relay
// =============================================================================

#[tokio::test]
async fn test_forward_without_connection_fails_fast() {
    let (supervisor, _rx, _shutdown) = supervisor(Arc::new(MockConnector::default()));
    let relay = InboundRelay::new(
        supervisor,
        edge_router("mb-1"),
        Arc::new(Metrics::new()),
    );

    let event = Event::new("1", "Foo", "/s");
    let err = relay.forward(&event).await.unwrap_err();
    assert!(matches!(err, BrokerError::NoConnection));
}

#[tokio::test(start_paused = true)]
async fn test_forward_publishes_to_routed_subject() {
    let connector = Arc::new(MockConnector::default());
    let (supervisor, _shutdown) = connect_supervisor(connector.clone()).await;

    let relay = InboundRelay::new(
        supervisor,
        hub_router(&[("edge1", "mb-edge1")]),
        Arc::new(Metrics::new()),
    );

    let event = Event::new("1", "Foo", "/hub").with_data(json!({"target": "edge1"}));
    relay.forward(&event).await.unwrap();

    let conn = connector.handed_out.lock()[0].clone();
    let published = conn.published.lock();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "events.wheel.mb-edge1.mailbox");

    let on_wire: Event = serde_json::from_slice(&published[0].1).unwrap();
    assert_eq!(on_wire, event);
}

#[tokio::test(start_paused = true)]
async fn test_forward_unresolved_target_uses_fallback_subject() {
    let connector = Arc::new(MockConnector::default());
    let (supervisor, _shutdown) = connect_supervisor(connector.clone()).await;

    let metrics = Arc::new(Metrics::new());
    let relay = InboundRelay::new(
        supervisor,
        hub_router(&[("edge1", "mb-edge1")]),
        metrics.clone(),
    );

    let event = Event::new("1", "Foo", "/hub").with_data(json!({"target": "edge2"}));
    relay.forward(&event).await.unwrap();

    let conn = connector.handed_out.lock()[0].clone();
    assert_eq!(conn.published.lock()[0].0, "events._INBOX");
    assert_eq!(metrics.routing_fallbacks.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_forward_connection_lost_signals_reconnect() {
    let connector = Arc::new(MockConnector::default());
    let (supervisor, _shutdown) = connect_supervisor(connector.clone()).await;

    let conn = connector.handed_out.lock()[0].clone();
    conn.fail_publish_lost.store(true, Ordering::SeqCst);

    let metrics = Arc::new(Metrics::new());
    let relay = InboundRelay::new(supervisor.clone(), edge_router("mb-1"), metrics.clone());

    let before = connector.attempts.load(Ordering::SeqCst);
    let err = relay.forward(&Event::new("1", "Foo", "/s")).await.unwrap_err();
    assert!(err.is_connection_lost());
    assert_eq!(metrics.publish_failures.get(), 1);

    // The loss signal reaches the supervisor loop and a fresh connection
    // replaces the broken one.
    wait_until(|| connector.attempts.load(Ordering::SeqCst) > before).await;
    wait_until(|| {
        let current = supervisor.connection().unwrap();
        Arc::as_ptr(&current) as *const () != Arc::as_ptr(&conn) as *const ()
    })
    .await;
}

// =============================================================================
// Outbound Relay
// =============================================================================

fn event_bytes(event: &Event) -> Vec<u8> {
    serde_json::to_vec(event).unwrap()
}

#[tokio::test]
async fn test_subscribe_without_connection_errors() {
    let (supervisor, _rx, shutdown) = supervisor(Arc::new(MockConnector::default()));
    let relay = OutboundRelay::new(
        supervisor,
        edge_router("mb-1"),
        Arc::new(RecordingSink::default()),
        Arc::new(Metrics::new()),
        shutdown,
    );

    let err = relay.subscribe().await.unwrap_err();
    assert!(matches!(err, BrokerError::NoConnection));
}

#[tokio::test(start_paused = true)]
async fn test_delivered_message_is_forwarded_and_acked_once() {
    let (tx, rx) = mpsc::channel(8);
    let connector = Arc::new(MockConnector {
        next_incoming: Mutex::new(Some(rx)),
        ..Default::default()
    });
    let (supervisor, shutdown) = connect_supervisor(connector.clone()).await;

    let sink = Arc::new(RecordingSink::default());
    let relay = OutboundRelay::new(
        supervisor,
        edge_router("mb-edge1"),
        sink.clone(),
        Arc::new(Metrics::new()),
        shutdown,
    );
    relay.subscribe().await.unwrap();

    // The consumer was registered on this node's own mailbox subject.
    let conn = connector.handed_out.lock()[0].clone();
    assert_eq!(conn.subscribed.lock()[0], "events.wheel.mb-edge1.mailbox");

    let event = Event::new("1", "Foo", "/hub").with_data(json!({"target": "edge1"}));
    let acks = Arc::new(AtomicUsize::new(0));
    tx.send(Ok(MockMessage::new(event_bytes(&event), acks.clone())))
        .await
        .unwrap();

    wait_until(|| !sink.events.lock().is_empty()).await;
    assert_eq!(sink.events.lock()[0], event);
    wait_until(|| acks.load(Ordering::SeqCst) == 1).await;
    assert_eq!(acks.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_message_left_unacked_and_loop_survives() {
    let (tx, rx) = mpsc::channel(8);
    let connector = Arc::new(MockConnector {
        next_incoming: Mutex::new(Some(rx)),
        ..Default::default()
    });
    let (supervisor, shutdown) = connect_supervisor(connector.clone()).await;

    let sink = Arc::new(RecordingSink::default());
    let metrics = Arc::new(Metrics::new());
    let relay = OutboundRelay::new(
        supervisor,
        edge_router("mb-edge1"),
        sink.clone(),
        metrics.clone(),
        shutdown,
    );
    relay.subscribe().await.unwrap();

    let acks = Arc::new(AtomicUsize::new(0));
    // Same poison bytes twice: both deliveries are handled without error.
    tx.send(Ok(MockMessage::new(&b"{not json"[..], acks.clone())))
        .await
        .unwrap();
    tx.send(Ok(MockMessage::new(&b"{not json"[..], acks.clone())))
        .await
        .unwrap();

    wait_until(|| metrics.malformed_messages.get() == 2).await;
    assert_eq!(acks.load(Ordering::SeqCst), 0);
    assert!(sink.events.lock().is_empty());

    // A good message afterwards still goes through.
    let event = Event::new("2", "Foo", "/hub");
    tx.send(Ok(MockMessage::new(event_bytes(&event), acks.clone())))
        .await
        .unwrap();
    wait_until(|| !sink.events.lock().is_empty()).await;
    assert_eq!(acks.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_delivery_is_never_acked() {
    let (tx, rx) = mpsc::channel(8);
    let connector = Arc::new(MockConnector {
        next_incoming: Mutex::new(Some(rx)),
        ..Default::default()
    });
    let (supervisor, shutdown) = connect_supervisor(connector.clone()).await;

    let sink = Arc::new(RecordingSink::default());
    sink.reject.store(true, Ordering::SeqCst);
    let metrics = Arc::new(Metrics::new());
    let relay = OutboundRelay::new(
        supervisor,
        edge_router("mb-edge1"),
        sink.clone(),
        metrics.clone(),
        shutdown,
    );
    relay.subscribe().await.unwrap();

    let acks = Arc::new(AtomicUsize::new(0));
    tx.send(Ok(MockMessage::new(
        event_bytes(&Event::new("1", "Foo", "/hub")),
        acks.clone(),
    )))
    .await
    .unwrap();

    wait_until(|| metrics.delivery_failures.get() == 1).await;
    assert_eq!(acks.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_ack_does_not_repeat_forward() {
    let (tx, rx) = mpsc::channel(8);
    let connector = Arc::new(MockConnector {
        next_incoming: Mutex::new(Some(rx)),
        ..Default::default()
    });
    let (supervisor, shutdown) = connect_supervisor(connector.clone()).await;

    let sink = Arc::new(RecordingSink::default());
    let metrics = Arc::new(Metrics::new());
    let relay = OutboundRelay::new(
        supervisor,
        edge_router("mb-edge1"),
        sink.clone(),
        metrics.clone(),
        shutdown,
    );
    relay.subscribe().await.unwrap();

    let acks = Arc::new(AtomicUsize::new(0));
    let event = Event::new("1", "Foo", "/hub");
    tx.send(Ok(MockMessage::with_failing_ack(
        event_bytes(&event),
        acks.clone(),
    )))
    .await
    .unwrap();

    // The sink got the event exactly once; the lost ack does not trigger
    // a second forward and the delivery does not count as completed.
    wait_until(|| sink.events.lock().len() == 1).await;
    assert_eq!(acks.load(Ordering::SeqCst), 0);
    assert_eq!(metrics.events_delivered.get(), 0);

    // The loop keeps processing after the ack failure.
    let next = Event::new("2", "Foo", "/hub");
    tx.send(Ok(MockMessage::new(event_bytes(&next), acks.clone())))
        .await
        .unwrap();
    wait_until(|| sink.events.lock().len() == 2).await;
    assert_eq!(sink.events.lock()[0], event);
    assert_eq!(sink.events.lock()[1], next);
    wait_until(|| acks.load(Ordering::SeqCst) == 1).await;
    assert_eq!(metrics.events_delivered.get(), 1);
}

// =============================================================================
// End To End
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_hub_to_edge_round_trip() {
    // Hub side: inbound event targeting edge1 lands on that edge's
    // mailbox subject.
    let hub_connector = Arc::new(MockConnector::default());
    let (hub_supervisor, _hub_shutdown) = connect_supervisor(hub_connector.clone()).await;
    let hub_relay = InboundRelay::new(
        hub_supervisor,
        hub_router(&[("edge1", "mb-edge1")]),
        Arc::new(Metrics::new()),
    );

    let event = Event::new("e-1", "Foo", "/hub").with_data(json!({"target": "edge1"}));
    hub_relay.forward(&event).await.unwrap();

    let hub_conn = hub_connector.handed_out.lock()[0].clone();
    let (subject, wire_bytes) = hub_conn.published.lock()[0].clone();
    assert_eq!(subject, "events.wheel.mb-edge1.mailbox");

    // Edge side: the same bytes arrive on the edge's mailbox, reach the
    // sink and are acknowledged.
    let (tx, rx) = mpsc::channel(8);
    let edge_connector = Arc::new(MockConnector {
        next_incoming: Mutex::new(Some(rx)),
        ..Default::default()
    });
    let (edge_supervisor, edge_shutdown) = connect_supervisor(edge_connector.clone()).await;
    let sink = Arc::new(RecordingSink::default());
    let edge_relay = OutboundRelay::new(
        edge_supervisor,
        edge_router("mb-edge1"),
        sink.clone(),
        Arc::new(Metrics::new()),
        edge_shutdown,
    );
    edge_relay.subscribe().await.unwrap();

    let edge_conn = edge_connector.handed_out.lock()[0].clone();
    assert_eq!(edge_conn.subscribed.lock()[0], "events.wheel.mb-edge1.mailbox");

    let acks = Arc::new(AtomicUsize::new(0));
    tx.send(Ok(MockMessage::new(wire_bytes.to_vec(), acks.clone())))
        .await
        .unwrap();

    wait_until(|| !sink.events.lock().is_empty()).await;
    assert_eq!(sink.events.lock()[0], event);
    wait_until(|| acks.load(Ordering::SeqCst) == 1).await;
}
