use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Scalar value attached to a message as an application property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(value) => write!(f, "{value}"),
            PropertyValue::Int(value) => write!(f, "{value}"),
            PropertyValue::Float(value) => write!(f, "{value}"),
            PropertyValue::String(value) => f.write_str(value),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

/// Immutable identity and payload of a received message.
///
/// The body is opaque; handlers decide how to decode it. The correlation id is
/// always present: when the producer did not supply one a UUID is generated at
/// construction and then carried unchanged for the lifetime of the message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    message_id: String,
    correlation_id: String,
    subject: Option<String>,
    body: Bytes,
    properties: HashMap<String, PropertyValue>,
}

impl MessageEnvelope {
    pub fn new(
        message_id: impl Into<String>,
        correlation_id: Option<String>,
        subject: Option<String>,
        body: impl Into<Bytes>,
        properties: HashMap<String, PropertyValue>,
    ) -> Self {
        let correlation_id = correlation_id
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(generate_correlation_id);

        Self {
            message_id: message_id.into(),
            correlation_id,
            subject,
            body: body.into(),
            properties,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body interpreted as UTF-8, if valid.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn properties(&self) -> &HashMap<String, PropertyValue> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }
}

pub(crate) fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}
