//! Stream Provisioning
//!
//! Get-or-create for the durable work-queue stream. An existing stream is
//! accepted as-is, even if its subject set no longer matches the computed
//! one: if an operator changes role or topology, the stream they already
//! have wins and no reconciliation is attempted.

use async_nats::jetstream;
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{BrokerError, Result};

/// Stream administration surface of the broker.
#[async_trait]
pub trait StreamAdmin: Send + Sync {
    /// Whether a stream with this name already exists.
    async fn stream_exists(&self, name: &str) -> bool;

    /// Create a stream covering the given subjects with work-queue
    /// retention (each message consumed at most once, removed after ack).
    async fn add_stream(&self, name: &str, subjects: Vec<String>) -> Result<()>;
}

/// Idempotently ensure the stream exists.
pub async fn ensure_stream<A>(admin: &A, name: &str, subjects: Vec<String>) -> Result<()>
where
    A: StreamAdmin + ?Sized,
{
    if admin.stream_exists(name).await {
        debug!(stream = name, "stream already exists");
        return Ok(());
    }

    admin.add_stream(name, subjects.clone()).await?;
    info!(stream = name, ?subjects, "stream created");
    Ok(())
}

#[async_trait]
impl StreamAdmin for jetstream::Context {
    async fn stream_exists(&self, name: &str) -> bool {
        // Lookup errors are treated as "not found"; a create that then
        // collides surfaces the real problem.
        self.get_stream(name).await.is_ok()
    }

    async fn add_stream(&self, name: &str, subjects: Vec<String>) -> Result<()> {
        self.create_stream(StreamConfig {
            name: name.to_string(),
            subjects,
            retention: RetentionPolicy::WorkQueue,
            ..Default::default()
        })
        .await
        .map_err(|e| BrokerError::Provision(e.to_string()))?;
        Ok(())
    }
}
