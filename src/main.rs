//! natsbridge - CloudEvents relay between a hub and edge sites
//!
//! Usage:
//!   natsbridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      Ingress bind address (default: 0.0.0.0:8080)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use natsbridge::bridge::{ConnectionSupervisor, InboundRelay, OutboundRelay};
use natsbridge::broker::{NatsConnector, NatsSettings};
use natsbridge::config::Config;
use natsbridge::egress::HttpSink;
use natsbridge::ingress::IngressServer;
use natsbridge::metrics::Metrics;
use natsbridge::routing::{BridgeRole, EdgeDirectory, SubjectRouter};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// natsbridge - CloudEvents relay between a hub and edge sites
#[derive(Parser, Debug)]
#[command(name = "natsbridge")]
#[command(version = "0.1.0")]
#[command(about = "CloudEvents relay between a hub and edge sites over NATS JetStream")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Ingress HTTP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration: from file if specified, otherwise env vars only
    let config = match &args.config {
        Some(config_path) => Config::load(config_path),
        None => Config::from_env(),
    };
    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        // Parse from config string
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // Validation in Config::load guarantees the role parses and the
    // role-specific settings below are present.
    let role = config.bridge_role()?;
    let directory = match role {
        BridgeRole::Hub => {
            let path = config
                .hub
                .edge_location_config
                .as_ref()
                .expect("validated hub config");
            let directory = EdgeDirectory::load(path)?;
            info!("  Edge directory: {} entries from {:?}", directory.len(), path);
            directory
        }
        BridgeRole::Edge => EdgeDirectory::default(),
    };
    let mailbox_id = config.edge.mailbox_id.clone().unwrap_or_default();

    let router = Arc::new(SubjectRouter::new(
        role,
        mailbox_id,
        directory,
        config.nats.subject_root.clone(),
    ));

    let bind_addr = args.bind.unwrap_or(config.ingress.bind);

    info!("Starting natsbridge");
    info!("  Role: {}", role);
    info!("  NATS URL: {}", config.nats.url);
    info!("  Subject root: {}", config.nats.subject_root);
    info!("  Mailbox subject: {}", router.subscribe_subject());
    info!("  Sink: {}", config.sink.url);
    info!("  Ingress: http://{}", bind_addr);
    if config.nats.tls_enabled {
        info!("  TLS: enabled");
    }

    let connector = Arc::new(NatsConnector::new(
        NatsSettings {
            url: config.nats.url.clone(),
            tls_enabled: config.nats.tls_enabled,
            insecure_skip_verify: config.nats.insecure_skip_verify,
            auth_token: config.nats.auth_token.clone(),
        },
        router.as_ref().clone(),
    ));

    let metrics = Arc::new(Metrics::new());
    let (shutdown, _) = broadcast::channel(1);

    let (supervisor, reconnect_rx) =
        ConnectionSupervisor::new(connector, metrics.clone(), shutdown.clone());
    tokio::spawn(supervisor.clone().run(reconnect_rx));
    supervisor.request_reconnect();

    let inbound = InboundRelay::new(supervisor.clone(), router.clone(), metrics.clone());
    let sink = Arc::new(HttpSink::new(config.sink.url.clone())?);
    let outbound = OutboundRelay::new(
        supervisor.clone(),
        router.clone(),
        sink,
        metrics.clone(),
        shutdown.clone(),
    );

    let ingress = IngressServer::new(
        inbound,
        supervisor.clone(),
        metrics.clone(),
        bind_addr,
        shutdown.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = ingress.run().await {
            error!("Ingress server error: {}", e);
        }
    });

    // The mailbox consumer needs a live connection; wait for the
    // supervisor to publish one. A failed initial subscribe is fatal and
    // the process supervisor restarts the bridge; later connection loss
    // is handled by the reconnect loop.
    while !supervisor.is_connected() {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                let _ = shutdown.send(());
                return Ok(());
            }
        }
    }
    outbound.subscribe().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown.send(());

    Ok(())
}
