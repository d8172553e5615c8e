//! Connection Supervisor
//!
//! Maintains at most one live broker connection and transparently recovers
//! from loss. Failure detections from any task coalesce into a bounded
//! signal queue; the supervisor drains one signal at a time and runs at
//! most one retry loop, guarded by an in-progress flag kept under the same
//! lock as the connection itself.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

use crate::broker::{Connection, Connector};
use crate::metrics::Metrics;

use super::{MAX_RECONNECT_REQUESTS, RECONNECT_RETRY_INTERVAL};

/// Shared mutable state; the lock is held only for pointer/flag
/// manipulation, never across a network call.
struct ConnState {
    conn: Option<Arc<dyn Connection>>,
    in_progress: bool,
}

/// Owns the single shared broker connection.
pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    state: Mutex<ConnState>,
    reconnect_tx: mpsc::Sender<()>,
    shutdown: broadcast::Sender<()>,
    metrics: Arc<Metrics>,
}

impl ConnectionSupervisor {
    /// Create the supervisor and the receiving end of its reconnect-signal
    /// queue; the caller spawns `run` with the receiver.
    pub fn new(
        connector: Arc<dyn Connector>,
        metrics: Arc<Metrics>,
        shutdown: broadcast::Sender<()>,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (reconnect_tx, reconnect_rx) = mpsc::channel(MAX_RECONNECT_REQUESTS);
        let supervisor = Arc::new(Self {
            connector,
            state: Mutex::new(ConnState {
                conn: None,
                in_progress: false,
            }),
            reconnect_tx,
            shutdown,
            metrics,
        });
        (supervisor, reconnect_rx)
    }

    /// Request a reconnect. Never blocks; when the queue is full an
    /// attempt is already pending or in flight and the signal is dropped.
    pub fn request_reconnect(&self) {
        let _ = self.reconnect_tx.try_send(());
    }

    /// Whether a connection is currently published.
    pub fn is_connected(&self) -> bool {
        self.state.lock().conn.is_some()
    }

    /// The currently published connection, if any.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.state.lock().conn.clone()
    }

    /// Background loop draining reconnect signals. Runs until shutdown.
    pub async fn run(self: Arc<Self>, mut reconnect_rx: mpsc::Receiver<()>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                signal = reconnect_rx.recv() => {
                    if signal.is_none() {
                        return;
                    }
                    let start = {
                        let mut state = self.state.lock();
                        if state.in_progress {
                            false
                        } else {
                            // Set under the lock so no second retry loop can
                            // start between the check and the spawn.
                            state.in_progress = true;
                            true
                        }
                    };
                    if start {
                        tokio::spawn(self.clone().connect_with_retry());
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("connection supervisor shutting down");
                    return;
                }
            }
        }
    }

    /// Retry loop: attempt to connect every `RECONNECT_RETRY_INTERVAL`
    /// until success or shutdown. Every transport or provisioning error is
    /// retried; none are fatal.
    async fn connect_with_retry(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            match self.connector.connect().await {
                Ok(conn) => {
                    let mut state = self.state.lock();
                    state.conn = Some(conn);
                    state.in_progress = false;
                    drop(state);
                    self.metrics.reconnects.inc();
                    info!("broker connection established");
                    return;
                }
                Err(e) => {
                    error!(
                        "connect failed: {}, retrying in {:?}",
                        e, RECONNECT_RETRY_INTERVAL
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_RETRY_INTERVAL) => {}
                _ = shutdown_rx.recv() => return,
            }
        }
    }
}
