//! Request model and wire packing
//!
//! In memory a request is an envelope (channel, timestamp) around a typed
//! body. On the wire it is a flat JSON object: the rich representation is
//! packed into scalar/array fields immediately before transmission and
//! unpacked immediately after receipt. Timestamp 0 means "timestamp
//! checking disabled for this message".

use serde::{Deserialize, Serialize};
use serde_json::Value;

use weave_core::{SyncError, SyncResult};

/// Channel a peer sends on when none is configured
pub const DEFAULT_CHANNEL: &str = "default";

/// One encoded module inside a component update
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModulePayload {
    /// Codec type tag, e.g. `Transform`
    pub tag: String,
    /// JSON payload string produced by the codec
    pub payload: String,
}

/// Typed request body; one variant per `kind+action` discriminator
#[derive(Clone, Debug, PartialEq)]
pub enum RequestBody {
    /// `ou` - entity exists with the given parent reference
    ObjectUpdate { name: String, parent: String },
    /// `od` - entity removed
    ObjectDelete { name: String },
    /// `ru` - shared resource created or changed
    ResourceUpdate {
        name: String,
        kind: String,
        payload: String,
    },
    /// `rd` - shared resource removed
    ResourceDelete { name: String },
    /// `cu` - batched module updates for one entity
    ComponentUpdate {
        name: String,
        modules: Vec<ModulePayload>,
    },
    /// `cd` - batched module removals for one entity
    ComponentDelete { name: String, tags: Vec<String> },
    /// `cs` - subscribe to the envelope channel
    Subscribe,
    /// `cl` - leave the envelope channel
    Unsubscribe,
}

impl RequestBody {
    /// Wire discriminator for this body
    pub fn discriminator(&self) -> &'static str {
        match self {
            RequestBody::ObjectUpdate { .. } => "ou",
            RequestBody::ObjectDelete { .. } => "od",
            RequestBody::ResourceUpdate { .. } => "ru",
            RequestBody::ResourceDelete { .. } => "rd",
            RequestBody::ComponentUpdate { .. } => "cu",
            RequestBody::ComponentDelete { .. } => "cd",
            RequestBody::Subscribe => "cs",
            RequestBody::Unsubscribe => "cl",
        }
    }

    /// Target reference name, if the body addresses one
    pub fn name(&self) -> Option<&str> {
        match self {
            RequestBody::ObjectUpdate { name, .. }
            | RequestBody::ObjectDelete { name }
            | RequestBody::ResourceUpdate { name, .. }
            | RequestBody::ResourceDelete { name }
            | RequestBody::ComponentUpdate { name, .. }
            | RequestBody::ComponentDelete { name, .. } => Some(name),
            RequestBody::Subscribe | RequestBody::Unsubscribe => None,
        }
    }

    /// Whether this is a subscribe/leave control body
    pub fn is_control(&self) -> bool {
        matches!(self, RequestBody::Subscribe | RequestBody::Unsubscribe)
    }
}

/// An immutable wire message
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub channel: String,
    pub timestamp: i64,
    pub body: RequestBody,
}

impl Request {
    pub fn new(channel: impl Into<String>, timestamp: i64, body: RequestBody) -> Self {
        Request {
            channel: channel.into(),
            timestamp,
            body,
        }
    }

    pub fn subscribe(channel: impl Into<String>) -> Self {
        Request::new(channel, 0, RequestBody::Subscribe)
    }

    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Request::new(channel, 0, RequestBody::Unsubscribe)
    }

    /// Pack and serialize to one JSON line
    pub fn encode(&self) -> SyncResult<String> {
        let wire = self.pack();
        serde_json::to_string(&wire).map_err(|e| SyncError::Malformed(e.to_string()))
    }

    /// Parse one JSON line and unpack
    pub fn decode(line: &str) -> SyncResult<Request> {
        let wire: WireMessage =
            serde_json::from_str(line).map_err(|e| SyncError::Malformed(e.to_string()))?;
        Request::unpack(wire)
    }

    fn pack(&self) -> WireMessage {
        let mut wire = WireMessage {
            kind: self.body.discriminator().to_string(),
            channel: self.channel.clone(),
            name: self.body.name().map(str::to_string),
            timestamp: self.timestamp,
            string1: None,
            string2: None,
        };
        match &self.body {
            RequestBody::ObjectUpdate { parent, .. } => {
                wire.string1 = Some(Value::String(parent.clone()));
            }
            RequestBody::ResourceUpdate { kind, payload, .. } => {
                wire.string1 = Some(Value::String(kind.clone()));
                wire.string2 = Some(Value::String(payload.clone()));
            }
            RequestBody::ComponentUpdate { modules, .. } => {
                wire.string1 = Some(string_array(modules.iter().map(|m| m.tag.as_str())));
                wire.string2 = Some(string_array(modules.iter().map(|m| m.payload.as_str())));
            }
            RequestBody::ComponentDelete { tags, .. } => {
                wire.string1 = Some(string_array(tags.iter().map(String::as_str)));
            }
            RequestBody::ObjectDelete { .. }
            | RequestBody::ResourceDelete { .. }
            | RequestBody::Subscribe
            | RequestBody::Unsubscribe => {}
        }
        wire
    }

    fn unpack(wire: WireMessage) -> SyncResult<Request> {
        let body = match wire.kind.as_str() {
            "ou" => RequestBody::ObjectUpdate {
                name: required_name(&wire)?,
                parent: take_string(wire.string1)?,
            },
            "od" => RequestBody::ObjectDelete {
                name: required_name(&wire)?,
            },
            "ru" => RequestBody::ResourceUpdate {
                name: required_name(&wire)?,
                kind: take_string(wire.string1)?,
                payload: take_string(wire.string2)?,
            },
            "rd" => RequestBody::ResourceDelete {
                name: required_name(&wire)?,
            },
            "cu" => {
                let name = required_name(&wire)?;
                let tags = take_string_array(wire.string1)?;
                let payloads = take_string_array(wire.string2)?;
                if tags.len() != payloads.len() {
                    return Err(SyncError::Malformed(format!(
                        "component update for {}: {} tags, {} payloads",
                        name,
                        tags.len(),
                        payloads.len()
                    )));
                }
                RequestBody::ComponentUpdate {
                    name,
                    modules: tags
                        .into_iter()
                        .zip(payloads)
                        .map(|(tag, payload)| ModulePayload { tag, payload })
                        .collect(),
                }
            }
            "cd" => RequestBody::ComponentDelete {
                name: required_name(&wire)?,
                tags: take_string_array(wire.string1)?,
            },
            "cs" => RequestBody::Subscribe,
            "cl" => RequestBody::Unsubscribe,
            other => return Err(SyncError::UnknownDiscriminator(other.to_string())),
        };
        Ok(Request {
            channel: wire.channel,
            timestamp: wire.timestamp,
            body,
        })
    }
}

/// Flat transport-safe representation
#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "timestamp_is_zero")]
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    string1: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    string2: Option<Value>,
}

fn timestamp_is_zero(t: &i64) -> bool {
    *t == 0
}

fn string_array<'a>(items: impl Iterator<Item = &'a str>) -> Value {
    Value::Array(items.map(|s| Value::String(s.to_string())).collect())
}

fn required_name(wire: &WireMessage) -> SyncResult<String> {
    wire.name
        .clone()
        .ok_or_else(|| SyncError::Malformed(format!("{} without name", wire.kind)))
}

fn take_string(v: Option<Value>) -> SyncResult<String> {
    match v {
        Some(Value::String(s)) => Ok(s),
        other => Err(SyncError::Malformed(format!(
            "expected string field, got {:?}",
            other
        ))),
    }
}

fn take_string_array(v: Option<Value>) -> SyncResult<Vec<String>> {
    match v {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(SyncError::Malformed(format!(
                    "expected string element, got {:?}",
                    other
                ))),
            })
            .collect(),
        None => Ok(Vec::new()),
        other => Err(SyncError::Malformed(format!(
            "expected string array, got {:?}",
            other
        ))),
    }
}
