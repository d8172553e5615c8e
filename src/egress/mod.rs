//! Event Egress
//!
//! Delivery of translated mailbox messages to the local downstream
//! receiver. The sink is a trait so the outbound relay can be tested
//! without a live endpoint; production uses the HTTP sink, which posts
//! CloudEvents in binary content mode to the configured sink URL.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::event::Event;


/// Error type for sink deliveries
#[derive(Debug)]
pub enum SinkError {
    /// Request could not be sent
    Http(String),
    /// Receiver answered with a non-success status
    Rejected(u16),
    /// Event could not be serialized for delivery
    Serialize(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(msg) => write!(f, "sink request failed: {}", msg),
            Self::Rejected(status) => write!(f, "sink rejected event with status {}", status),
            Self::Serialize(msg) => write!(f, "could not serialize event: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {}

/// Local downstream receiver of translated events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event; an error means the event was not accepted and
    /// the broker message must not be acknowledged.
    async fn send(&self, event: &Event) -> Result<(), SinkError>;
}

/// HTTP sink posting CloudEvents binary mode to a fixed URL.
pub struct HttpSink {
    client: Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: impl Into<String>) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SinkError::Http(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EventSink for HttpSink {
    async fn send(&self, event: &Event) -> Result<(), SinkError> {
        let mut req = self
            .client
            .post(&self.url)
            .header("ce-id", &event.id)
            .header("ce-specversion", &event.specversion)
            .header("ce-type", &event.ty)
            .header("ce-source", &event.source);

        if let Some(subject) = &event.subject {
            req = req.header("ce-subject", subject);
        }
        if let Some(time) = &event.time {
            req = req.header("ce-time", time);
        }
        for (name, value) in &event.extensions {
            if let Some(s) = value.as_str() {
                req = req.header(format!("ce-{}", name), s);
            } else {
                req = req.header(format!("ce-{}", name), value.to_string());
            }
        }

        if let Some(data) = &event.data {
            let body = serde_json::to_vec(data).map_err(|e| SinkError::Serialize(e.to_string()))?;
            let content_type = event
                .datacontenttype
                .as_deref()
                .unwrap_or("application/json");
            req = req.header("content-type", content_type).body(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SinkError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(SinkError::Rejected(resp.status().as_u16()));
        }

        debug!(url = %self.url, event_id = %event.id, "event delivered to sink");
        Ok(())
    }
}
