//! Push-notification ingestion.
//!
//! A notification batch is a JSON array of events. When the first event is a
//! subscription-validation event the handshake is answered by echoing its
//! validation code; otherwise the batch is acknowledged. Event ids seen within
//! a bounded window are counted as duplicates and acknowledged again, never
//! rejected.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

pub const SUBSCRIPTION_VALIDATION_EVENT: &str = "SubscriptionValidationEvent";
const DEFAULT_DEDUPE_WINDOW: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("no events received")]
    EmptyBatch,

    #[error("malformed notification batch: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("subscription validation event {event_id} carries no validation code")]
    MissingValidationCode { event_id: String },
}

/// One event of a notification batch. Field names are matched
/// case-insensitively.
///
/// Descriptive fields never fail a batch: `null` reads as empty, non-string
/// scalars keep their JSON text and an unreadable `eventTime` reads as `None`.
/// A timestamp without an offset is taken as UTC.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub struct NotificationEvent {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default, rename = "eventtype", deserialize_with = "lenient_string")]
    pub event_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub subject: String,
    #[serde(default, rename = "eventtime", deserialize_with = "lenient_time")]
    pub event_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, rename = "dataversion", deserialize_with = "lenient_string")]
    pub data_version: String,
    #[serde(default, rename = "metadataversion", deserialize_with = "lenient_string")]
    pub metadata_version: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub topic: String,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(text) => text,
        other => other.to_string(),
    })
}

fn lenient_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Value::String(text) = Value::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let Ok(time) = DateTime::parse_from_rfc3339(&text) {
        return Ok(Some(time.with_timezone(&Utc)));
    }
    Ok(text
        .parse::<NaiveDateTime>()
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    SubscriptionValidation,
    OrderCreated,
    OrderStatusUpdate,
    OrderCompleted,
    Other(String),
}

impl NotificationEvent {
    pub fn kind(&self) -> EventKind {
        match self.event_type.as_str() {
            "OrderCreated" => EventKind::OrderCreated,
            "OrderStatusUpdate" => EventKind::OrderStatusUpdate,
            "OrderCompleted" => EventKind::OrderCompleted,
            other if other.ends_with(SUBSCRIPTION_VALIDATION_EVENT) => {
                EventKind::SubscriptionValidation
            }
            other => EventKind::Other(other.to_owned()),
        }
    }

    fn validation_code(&self) -> Option<String> {
        self.data
            .as_object()?
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("validationCode"))
            .and_then(|(_, value)| value.as_str())
            .map(str::to_owned)
    }
}

/// Body returned to the notification sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum NotificationResponse {
    Validation {
        #[serde(rename = "validationResponse")]
        validation_response: String,
    },
    Acknowledged {
        accepted: usize,
        duplicates: usize,
    },
}

impl NotificationResponse {
    pub fn to_json(&self) -> Value {
        match self {
            NotificationResponse::Validation {
                validation_response,
            } => serde_json::json!({ "validationResponse": validation_response }),
            NotificationResponse::Acknowledged {
                accepted,
                duplicates,
            } => serde_json::json!({ "accepted": accepted, "duplicates": duplicates }),
        }
    }
}

/// Parses notification batches and remembers recently seen event ids.
#[derive(Debug)]
pub struct NotificationIngestor {
    window: usize,
    seen: Mutex<SeenIds>,
}

#[derive(Debug, Default)]
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenIds {
    /// Records `id`, returning false when it is already inside the window.
    fn insert(&mut self, id: &str, window: usize) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.insert(id.to_owned());
        self.order.push_back(id.to_owned());
        while self.order.len() > window {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }
}

impl Default for NotificationIngestor {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUPE_WINDOW)
    }
}

impl NotificationIngestor {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            seen: Mutex::new(SeenIds::default()),
        }
    }

    pub fn ingest(&self, body: &[u8]) -> Result<NotificationResponse, NotificationError> {
        let events = parse_batch(body)?;
        let Some(first) = events.first() else {
            warn!("notification batch contained no events");
            return Err(NotificationError::EmptyBatch);
        };

        if first.kind() == EventKind::SubscriptionValidation {
            let code = first.validation_code().ok_or_else(|| {
                NotificationError::MissingValidationCode {
                    event_id: first.id.clone(),
                }
            })?;
            info!(event_id = %first.id, "answering subscription validation handshake");
            return Ok(NotificationResponse::Validation {
                validation_response: code,
            });
        }

        let mut accepted = 0;
        let mut duplicates = 0;
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);

        for event in &events {
            if !event.id.is_empty() && !seen.insert(&event.id, self.window) {
                duplicates += 1;
                info!(event_id = %event.id, event_type = %event.event_type, "duplicate notification acknowledged");
                continue;
            }
            accepted += 1;

            match event.kind() {
                EventKind::OrderCreated => {
                    info!(event_id = %event.id, subject = %event.subject, "order created notification")
                }
                EventKind::OrderStatusUpdate => {
                    info!(event_id = %event.id, subject = %event.subject, "order status notification")
                }
                EventKind::OrderCompleted => {
                    info!(event_id = %event.id, subject = %event.subject, "order completed notification")
                }
                EventKind::SubscriptionValidation | EventKind::Other(_) => {
                    info!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        subject = %event.subject,
                        "notification received"
                    )
                }
            }
        }

        Ok(NotificationResponse::Acknowledged {
            accepted,
            duplicates,
        })
    }
}

fn parse_batch(body: &[u8]) -> Result<Vec<NotificationEvent>, NotificationError> {
    let raw: Vec<Value> = serde_json::from_slice(body)?;
    raw.into_iter()
        .map(|event| serde_json::from_value(lowercase_keys(event)).map_err(NotificationError::from))
        .collect()
}

fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key.to_ascii_lowercase(), value))
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}
