//! Network protocol message types
//!
//! One envelope is JSON-serialized per connection. There is no length
//! prefix: the receiver reads until the sender closes the stream.

use serde::{Deserialize, Serialize};
use tether_core::Device;

/// Discriminant of an envelope's body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Application,
    Registration,
    Disconnection,
    RosterSync,
}

/// How application bytes should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Binary,
}

/// Opaque application content
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Text,
            bytes: text.into().into_bytes(),
        }
    }

    pub fn binary(bytes: Vec<u8>) -> Self {
        Self {
            content_type: ContentType::Binary,
            bytes,
        }
    }

    /// The content as UTF-8, for text payloads
    pub fn as_text(&self) -> Option<&str> {
        match self.content_type {
            ContentType::Text => std::str::from_utf8(&self.bytes).ok(),
            ContentType::Binary => None,
        }
    }
}

/// Kind-specific content of an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Body {
    /// Application data, never interpreted by the sessions
    Application(Payload),

    /// A device joining, or an announcement of one
    Registration(Device),

    /// A device leaving, or an announcement of one
    Disconnection(Device),

    /// Full roster sent by the owner to a newly registered member
    RosterSync(Vec<Device>),
}

/// Unit of exchange between devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Origin device. Overwritten by the sending session.
    #[serde(default)]
    pub sender: Option<Device>,
    pub body: Body,
}

impl Envelope {
    pub fn new(body: Body) -> Self {
        Self { sender: None, body }
    }

    pub fn application(payload: Payload) -> Self {
        Self::new(Body::Application(payload))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::application(Payload::text(text))
    }

    pub fn registration(device: Device) -> Self {
        Self::new(Body::Registration(device))
    }

    pub fn disconnection(device: Device) -> Self {
        Self::new(Body::Disconnection(device))
    }

    pub fn roster_sync(devices: Vec<Device>) -> Self {
        Self::new(Body::RosterSync(devices))
    }

    pub fn kind(&self) -> MessageKind {
        match self.body {
            Body::Application(_) => MessageKind::Application,
            Body::Registration(_) => MessageKind::Registration,
            Body::Disconnection(_) => MessageKind::Disconnection,
            Body::RosterSync(_) => MessageKind::RosterSync,
        }
    }

    /// Application payload, if this is application data
    pub fn payload(&self) -> Option<&Payload> {
        match &self.body {
            Body::Application(payload) => Some(payload),
            _ => None,
        }
    }

    /// Serialize envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
