//! Subject Routing
//!
//! Hub/edge addressing policy: which JetStream subject an event is
//! published to and which subject this node consumes. All naming is a pure
//! function of the bridge role, the mailbox identifier and the configured
//! subject root, so the whole policy is testable without a broker.
//!
//! Subject layout (root defaults to "events"):
//!
//! ```text
//! <root>.wheel.hub.mailbox          hub's own mailbox
//! <root>.wheel.<mailbox>.mailbox    one per edge site
//! <root>._INBOX                     fallback / inbox prefix
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use tracing::error;

use crate::event::Event;


/// Default JetStream stream name and subject root.
pub const DEFAULT_SUBJECT_ROOT: &str = "events";

/// The role a bridge instance runs as, fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeRole {
    /// Central site; routes outbound events per edge directory.
    Hub,
    /// Disconnected site; only ever addresses the hub.
    Edge,
}

impl BridgeRole {
    /// Parse a role from its configuration string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hub" => Some(BridgeRole::Hub),
            "edge" => Some(BridgeRole::Edge),
            _ => None,
        }
    }
}

impl fmt::Display for BridgeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeRole::Hub => write!(f, "hub"),
            BridgeRole::Edge => write!(f, "edge"),
        }
    }
}

/// Error loading the edge location directory file.
#[derive(Debug)]
pub enum DirectoryError {
    /// IO error reading the file
    Io(std::io::Error),
    /// File is not a JSON object of string -> string
    Parse(serde_json::Error),
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "error reading edge location config: {}", e),
            Self::Parse(e) => write!(f, "error parsing edge location config: {}", e),
        }
    }
}

impl std::error::Error for DirectoryError {}

/// Static map from logical target name to mailbox identifier.
///
/// Loaded once at startup for the hub role; read-only thereafter. A lookup
/// miss is a routing error handled by the caller, never a crash.
#[derive(Debug, Clone, Default)]
pub struct EdgeDirectory {
    locations: HashMap<String, String>,
}

impl EdgeDirectory {
    /// Load the directory from a JSON object file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let bytes = std::fs::read(path).map_err(DirectoryError::Io)?;
        let locations: HashMap<String, String> =
            serde_json::from_slice(&bytes).map_err(DirectoryError::Parse)?;
        Ok(Self { locations })
    }

    /// Build a directory from an in-memory map.
    pub fn from_map(locations: HashMap<String, String>) -> Self {
        Self { locations }
    }

    /// Resolve a logical target name to its mailbox identifier.
    pub fn mailbox(&self, target: &str) -> Option<&str> {
        self.locations.get(target).map(String::as_str)
    }

    /// Iterate over all mailbox identifiers.
    pub fn mailboxes(&self) -> impl Iterator<Item = &str> {
        self.locations.values().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

/// Pure subject-naming policy for one bridge instance.
#[derive(Debug, Clone)]
pub struct SubjectRouter {
    role: BridgeRole,
    /// This node's own mailbox id (edge role only).
    mailbox_id: String,
    /// Target name -> mailbox id (hub role only).
    directory: EdgeDirectory,
    subject_root: String,
}

impl SubjectRouter {
    pub fn new(
        role: BridgeRole,
        mailbox_id: impl Into<String>,
        directory: EdgeDirectory,
        subject_root: impl Into<String>,
    ) -> Self {
        Self {
            role,
            mailbox_id: mailbox_id.into(),
            directory,
            subject_root: subject_root.into(),
        }
    }

    pub fn role(&self) -> BridgeRole {
        self.role
    }

    /// The stream name doubles as the subject root.
    pub fn stream_name(&self) -> &str {
        &self.subject_root
    }

    /// Inbox prefix for this tenant, also the fail-soft fallback subject
    /// when hub routing cannot resolve a target.
    pub fn inbox_prefix(&self) -> String {
        format!("{}._INBOX", self.subject_root)
    }

    fn mailbox_subject(&self, mailbox_id: &str) -> String {
        format!("{}.wheel.{}.mailbox", self.subject_root, mailbox_id)
    }

    fn hub_subject(&self) -> String {
        self.mailbox_subject("hub")
    }

    /// The subject this node consumes: its own mailbox.
    pub fn subscribe_subject(&self) -> String {
        match self.role {
            BridgeRole::Edge => self.mailbox_subject(&self.mailbox_id),
            BridgeRole::Hub => self.hub_subject(),
        }
    }

    /// The subject an inbound event is published to.
    ///
    /// Edges always address the hub. The hub parses the event data as a
    /// flat string-keyed map, reads its `target` field and resolves it
    /// through the edge directory; a
    /// missing, unparseable or unresolved target falls back to the inbox
    /// prefix. That subject has no live subscriber, so the publish is
    /// best-effort only; the condition is logged as a routing failure.
    pub fn publish_subject(&self, event: &Event) -> String {
        match self.role {
            BridgeRole::Edge => self.hub_subject(),
            BridgeRole::Hub => match event.data_field("target") {
                Some(target) => match self.directory.mailbox(target) {
                    Some(mailbox) => self.mailbox_subject(mailbox),
                    None => {
                        error!(
                            target,
                            "target not present in edge directory, using fallback subject"
                        );
                        self.inbox_prefix()
                    }
                },
                None => {
                    error!(event_id = %event.id, "no target field in event data, using fallback subject");
                    self.inbox_prefix()
                }
            },
        }
    }

    /// The full subject set the stream must cover for this node's role.
    ///
    /// Hub: its own mailbox plus one subject per directory entry.
    /// Edge: its own mailbox plus the hub mailbox.
    pub fn stream_subjects(&self) -> Vec<String> {
        let mut subjects = vec![self.subscribe_subject()];
        match self.role {
            BridgeRole::Edge => subjects.push(self.hub_subject()),
            BridgeRole::Hub => {
                subjects.extend(self.directory.mailboxes().map(|mb| self.mailbox_subject(mb)))
            }
        }
        subjects
    }
}
