//! Configuration Module
//!
//! Provides TOML-based configuration for the bridge with support for:
//! - Bridge role (hub or edge)
//! - Broker connection settings (URL, TLS, auth token)
//! - Role-specific settings (edge mailbox id, hub edge directory)
//! - Sink and ingress settings
//! - Environment variable overrides (BRIDGE_* prefix)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::routing::{BridgeRole, DEFAULT_SUBJECT_ROOT};

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Bridge role: "hub" or "edge"
    pub role: String,
    /// Logging configuration
    pub log: LogConfig,
    /// Broker connection configuration
    pub nats: NatsConfig,
    /// Edge-role settings
    pub edge: EdgeConfig,
    /// Hub-role settings
    pub hub: HubConfig,
    /// Event sink configuration
    pub sink: SinkConfig,
    /// Ingress HTTP server configuration
    pub ingress: IngressConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Broker URL, e.g. "nats://nats.example:4222"
    pub url: String,
    /// Subject root, doubles as the JetStream stream name
    #[serde(default = "default_subject_root")]
    pub subject_root: String,
    /// Connect over TLS
    #[serde(default)]
    pub tls_enabled: bool,
    /// Skip server certificate verification (TLS only)
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// JWT used both to derive the NATS user and as the password
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_subject_root() -> String {
    DEFAULT_SUBJECT_ROOT.to_string()
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            subject_root: default_subject_root(),
            tls_enabled: false,
            insecure_skip_verify: false,
            auth_token: None,
        }
    }
}

/// Edge-role settings
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EdgeConfig {
    /// This edge's mailbox identifier
    pub mailbox_id: Option<String>,
}

/// Hub-role settings
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HubConfig {
    /// Path to the JSON edge location directory (target name -> mailbox id)
    pub edge_location_config: Option<PathBuf>,
}

/// Event sink configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SinkConfig {
    /// HTTP endpoint mailbox deliveries are forwarded to
    pub url: String,
}

/// Ingress HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// HTTP bind address
    #[serde(default = "default_ingress_bind")]
    pub bind: SocketAddr,
}

fn default_ingress_bind() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            bind: default_ingress_bind(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `BRIDGE__` prefix with double underscores for nesting:
    ///    - `BRIDGE__ROLE=edge` overrides `role`
    ///    - `BRIDGE__NATS__URL=nats://broker:4222` overrides `nats.url`
    ///    - `BRIDGE__EDGE__MAILBOX_ID=mb-site-1` overrides `edge.mailbox_id`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("role", "")?
            .set_default("log.level", "info")?
            .set_default("nats.url", "")?
            .set_default("nats.subject_root", DEFAULT_SUBJECT_ROOT)?
            .set_default("nats.tls_enabled", false)?
            .set_default("nats.insecure_skip_verify", false)?
            .set_default("sink.url", "")?
            .set_default("ingress.bind", "0.0.0.0:8080")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (BRIDGE__NATS__URL, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("BRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    ///
    /// Useful for containerized deployments where all config comes from env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let role = self.bridge_role()?;

        if self.nats.url.is_empty() {
            return Err(ConfigError::Validation("nats.url is required".to_string()));
        }
        if self.nats.subject_root.is_empty() {
            return Err(ConfigError::Validation(
                "nats.subject_root cannot be empty".to_string(),
            ));
        }
        if self.nats.insecure_skip_verify && !self.nats.tls_enabled {
            return Err(ConfigError::Validation(
                "nats.insecure_skip_verify requires nats.tls_enabled".to_string(),
            ));
        }

        match role {
            BridgeRole::Edge => {
                if self
                    .edge
                    .mailbox_id
                    .as_deref()
                    .unwrap_or_default()
                    .is_empty()
                {
                    return Err(ConfigError::Validation(
                        "edge.mailbox_id is required for the edge role".to_string(),
                    ));
                }
            }
            BridgeRole::Hub => {
                if self.hub.edge_location_config.is_none() {
                    return Err(ConfigError::Validation(
                        "hub.edge_location_config is required for the hub role".to_string(),
                    ));
                }
            }
        }

        if self.sink.url.is_empty() {
            return Err(ConfigError::Validation("sink.url is required".to_string()));
        }

        Ok(())
    }

    /// The parsed bridge role.
    pub fn bridge_role(&self) -> Result<BridgeRole, ConfigError> {
        BridgeRole::parse(&self.role).ok_or_else(|| {
            ConfigError::Validation(format!(
                "role must be \"hub\" or \"edge\", got \"{}\"",
                self.role
            ))
        })
    }
}
