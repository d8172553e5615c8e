//! CloudEvents Envelope
//!
//! Minimal CloudEvents v1.0 envelope used on both sides of the bridge:
//! events arrive over HTTP, are serialized to JSON for the JetStream wire,
//! and are deserialized back before delivery to the local sink. Unknown
//! attributes (extensions) are preserved through the round trip.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;


/// A structured notification event as relayed by the bridge.
///
/// Only `id`, `type` and `source` are required by CloudEvents; everything
/// else is carried opaquely. `data` holds the JSON payload as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    #[serde(default = "default_specversion")]
    pub specversion: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Extension attributes not known to the bridge.
    #[serde(flatten)]
    pub extensions: HashMap<String, Value>,
}

fn default_specversion() -> String {
    "1.0".to_string()
}

impl Event {
    /// Create an event with the required attributes.
    pub fn new(id: impl Into<String>, ty: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            specversion: default_specversion(),
            ty: ty.into(),
            source: source.into(),
            subject: None,
            time: None,
            datacontenttype: None,
            data: None,
            extensions: HashMap::new(),
        }
    }

    /// Set the JSON data payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.datacontenttype = Some("application/json".to_string());
        self.data = Some(data);
        self
    }

    /// Read a field out of the data payload, which must be a flat
    /// string-keyed mapping.
    ///
    /// The hub routing policy reads the `target` field this way; returns
    /// `None` when data is absent, not an object, or any value in the
    /// object is not a string. A payload with one non-string value does
    /// not parse as a string map at all, so no field is readable.
    pub fn data_field(&self, key: &str) -> Option<&str> {
        let fields = self.data.as_ref()?.as_object()?;
        if !fields.values().all(Value::is_string) {
            return None;
        }
        fields.get(key)?.as_str()
    }
}
