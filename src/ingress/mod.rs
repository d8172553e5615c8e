//! Ingress HTTP Server
//!
//! Receives CloudEvents over HTTP and hands them to the inbound relay.
//! Both content modes of the HTTP protocol binding are accepted:
//! structured (the body is the whole event as JSON) and binary (the
//! attributes ride in `ce-*` headers and the body is the data payload).
//!
//! The same listener serves the operational endpoints: `/healthz` is
//! liveness, `/readyz` reflects whether a broker connection is currently
//! published, and `/metrics` is the Prometheus exposition.
//!
//! Response mapping for event posts:
//!
//! - 202 published to the broker
//! - 400 the request is not a well-formed event
//! - 503 no broker connection (sender should retry)
//! - 500 the publish failed for another reason

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::bridge::{ConnectionSupervisor, InboundRelay};
use crate::broker::BrokerError;
use crate::event::Event;
use crate::metrics::Metrics;


/// HTTP front door of the bridge.
pub struct IngressServer {
    state: Arc<IngressState>,
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
}

struct IngressState {
    relay: InboundRelay,
    supervisor: Arc<ConnectionSupervisor>,
    metrics: Arc<Metrics>,
}

impl IngressServer {
    pub fn new(
        relay: InboundRelay,
        supervisor: Arc<ConnectionSupervisor>,
        metrics: Arc<Metrics>,
        addr: SocketAddr,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            state: Arc::new(IngressState {
                relay,
                supervisor,
                metrics,
            }),
            addr,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("ingress listening on http://{}", self.addr);

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown_rx.recv() => {
                    info!("ingress shutting down");
                    return Ok(());
                }
            };
            let io = TokioIo::new(stream);
            let state = self.state.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let state = state.clone();
                    async move { handle_request(req, state).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving ingress connection: {:?}", err);
                }
            });
        }
    }
}

async fn handle_request<B>(
    req: Request<B>,
    state: Arc<IngressState>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/") => handle_event(req, &state).await,
        (&Method::GET, "/health") | (&Method::GET, "/healthz") => plain(StatusCode::OK, "OK"),
        (&Method::GET, "/ready") | (&Method::GET, "/readyz") => {
            if state.supervisor.is_connected() {
                plain(StatusCode::OK, "OK")
            } else {
                plain(StatusCode::SERVICE_UNAVAILABLE, "no broker connection")
            }
        }
        (&Method::GET, "/metrics") => encode_metrics(&state.metrics),
        _ => plain(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

async fn handle_event<B>(req: Request<B>, state: &IngressState) -> Response<Full<Bytes>>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("failed to read request body: {}", e);
            return plain(StatusCode::BAD_REQUEST, "could not read body");
        }
    };

    let event = match parse_event(&parts.headers, &bytes) {
        Ok(event) => event,
        Err(reason) => {
            debug!("rejecting malformed event: {}", reason);
            return plain(StatusCode::BAD_REQUEST, "malformed event");
        }
    };

    match state.relay.forward(&event).await {
        Ok(()) => plain(StatusCode::ACCEPTED, ""),
        Err(BrokerError::NoConnection) => {
            plain(StatusCode::SERVICE_UNAVAILABLE, "no broker connection")
        }
        Err(e) => {
            error!(event_id = %event.id, "publish failed: {}", e);
            plain(StatusCode::INTERNAL_SERVER_ERROR, "publish failed")
        }
    }
}

/// Parse an incoming request into an event, picking the content mode from
/// the headers. A `ce-id` header selects binary mode; everything else is
/// treated as structured.
fn parse_event(headers: &HeaderMap, body: &[u8]) -> Result<Event, String> {
    if headers.contains_key("ce-id") {
        parse_binary(headers, body)
    } else {
        parse_structured(body)
    }
}

/// Structured mode: the body is the entire event serialized as JSON.
fn parse_structured(body: &[u8]) -> Result<Event, String> {
    if body.is_empty() {
        return Err("empty body".to_string());
    }
    let event: Event =
        serde_json::from_slice(body).map_err(|e| format!("invalid event JSON: {}", e))?;
    if event.id.is_empty() || event.ty.is_empty() || event.source.is_empty() {
        return Err("missing required attribute".to_string());
    }
    Ok(event)
}

/// Binary mode: context attributes in `ce-*` headers, data in the body.
fn parse_binary(headers: &HeaderMap, body: &[u8]) -> Result<Event, String> {
    let header = |name: &str| -> Option<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let required = |name: &str| -> Result<String, String> {
        header(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| format!("missing {} header", name))
    };

    let mut event = Event::new(
        required("ce-id")?,
        required("ce-type")?,
        required("ce-source")?,
    );
    if let Some(version) = header("ce-specversion") {
        event.specversion = version;
    }
    event.subject = header("ce-subject");
    event.time = header("ce-time");

    for (name, value) in headers {
        let name = name.as_str();
        let Some(ext) = name.strip_prefix("ce-") else {
            continue;
        };
        if matches!(
            ext,
            "id" | "type" | "source" | "specversion" | "subject" | "time"
        ) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            event
                .extensions
                .insert(ext.to_string(), Value::String(value.to_string()));
        }
    }

    if !body.is_empty() {
        event.datacontenttype = header("content-type");
        // JSON payloads are carried structurally, anything else as a string.
        event.data = match serde_json::from_slice(body) {
            Ok(value) => Some(value),
            Err(_) => Some(Value::String(String::from_utf8_lossy(body).into_owned())),
        };
    }

    Ok(event)
}

fn encode_metrics(metrics: &Metrics) -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", encoder.format_type())
            .body(Full::new(Bytes::from(buffer)))
            .unwrap(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            plain(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
        }
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
