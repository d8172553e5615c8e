//! NATS JetStream Implementation
//!
//! Connects to the broker with optional TLS and token auth, provisions the
//! work-queue stream inline, and exposes publish/consume through the
//! broker seam traits. The inbox prefix is derived from the subject root
//! so multiple bridge tenants can share one NATS deployment without
//! colliding on `_INBOX` replies.

use std::sync::Arc;

use async_nats::connection::State;
use async_nats::jetstream;
use async_nats::jetstream::consumer::pull;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_rustls::rustls::client::danger;
use tokio_rustls::rustls::{self, crypto, pki_types, DigitallySignedStruct, SignatureScheme};
use tracing::{info, warn};

use crate::routing::SubjectRouter;

use super::stream::ensure_stream;
use super::token::user_from_token;
use super::{BrokerError, Connection, Connector, InboundMessage, MessageStream, Result};

/// Broker-side settings, consumed read-only.
#[derive(Debug, Clone)]
pub struct NatsSettings {
    pub url: String,
    pub tls_enabled: bool,
    pub insecure_skip_verify: bool,
    pub auth_token: Option<String>,
}

/// Connector that dials NATS, authenticates and provisions the stream.
pub struct NatsConnector {
    settings: NatsSettings,
    router: SubjectRouter,
}

impl NatsConnector {
    pub fn new(settings: NatsSettings, router: SubjectRouter) -> Self {
        Self { settings, router }
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>> {
        let mut opts = async_nats::ConnectOptions::new();

        if self.settings.tls_enabled {
            opts = opts.require_tls(true);
            if self.settings.insecure_skip_verify {
                warn!("TLS certificate verification is disabled");
                opts = opts.tls_client_config(insecure_tls_config()?);
            }
        }

        if let Some(token) = &self.settings.auth_token {
            let user = user_from_token(token)?;
            opts = opts.user_and_password(user, token.clone());
        }

        opts = opts.custom_inbox_prefix(self.router.inbox_prefix());

        let client = opts
            .connect(&self.settings.url)
            .await
            .map_err(|e| BrokerError::ConnectionLost(e.to_string()))?;
        info!(url = %self.settings.url, "connection to NATS JetStream established");

        let jetstream = jetstream::new(client.clone());

        // A connection whose stream cannot be provisioned is never
        // published as ready.
        ensure_stream(
            &jetstream,
            self.router.stream_name(),
            self.router.stream_subjects(),
        )
        .await?;

        Ok(Arc::new(NatsConnection {
            client,
            jetstream,
            stream_name: self.router.stream_name().to_string(),
            consumer_name: format!("{}-mailbox-worker", self.router.role()),
        }))
    }
}

/// One live JetStream connection.
struct NatsConnection {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    stream_name: String,
    consumer_name: String,
}

impl NatsConnection {
    /// Classify a failed call: if the underlying transport is no longer
    /// connected, the error warrants a reconnect request.
    fn classify(&self, err: String) -> BrokerError {
        if self.client.connection_state() == State::Connected {
            BrokerError::Request(err)
        } else {
            BrokerError::ConnectionLost(err)
        }
    }
}

#[async_trait]
impl Connection for NatsConnection {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| self.classify(e.to_string()))?;

        // Wait for the stream-level ack so delivery failures surface here.
        ack.await.map_err(|e| self.classify(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<MessageStream> {
        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| self.classify(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                &self.consumer_name,
                pull::Config {
                    durable_name: Some(self.consumer_name.clone()),
                    filter_subject: subject.to_string(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| self.classify(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| self.classify(e.to_string()))?;

        let stream: MessageStream = Box::pin(messages.map(|item| match item {
            Ok(msg) => Ok(Box::new(NatsMessage { msg }) as Box<dyn InboundMessage>),
            Err(e) => Err(BrokerError::Request(e.to_string())),
        }));
        Ok(stream)
    }
}

struct NatsMessage {
    msg: jetstream::Message,
}

#[async_trait]
impl InboundMessage for NatsMessage {
    fn payload(&self) -> &[u8] {
        &self.msg.payload
    }

    async fn ack(&self) -> Result<()> {
        self.msg
            .ack()
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))
    }
}

/// Client config that accepts any server certificate. Only reachable via
/// the explicit `insecure_skip_verify` setting.
fn insecure_tls_config() -> Result<rustls::ClientConfig> {
    let provider = Arc::new(crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| BrokerError::ConnectionLost(format!("tls config error: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
        .with_no_client_auth();
    Ok(config)
}

#[derive(Debug)]
struct NoVerification {
    provider: Arc<crypto::CryptoProvider>,
}

impl danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &pki_types::CertificateDer<'_>,
        _intermediates: &[pki_types::CertificateDer<'_>],
        _server_name: &pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: pki_types::UnixTime,
    ) -> std::result::Result<danger::ServerCertVerified, rustls::Error> {
        Ok(danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &pki_types::CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<danger::HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &pki_types::CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<danger::HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
