//! Notification entries and their wire representation
//!
//! The same event reaches the client twice: once over the push channel and
//! once inside the authoritative pull list. Both carry the backend's id, which
//! is the join key for deduplication. Parsing is lenient about field spelling
//! (the REST API is camelCase, older documents use `_id` and `createdAt`) but
//! never invents an id.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MalformedPayload;

/// Backend-issued notification identifier, stable across push and pull
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(String);

impl NotificationId {
    /// Wrap a backend id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NotificationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for NotificationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Domain event that produced a notification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceEvent {
    /// A freelancer applied to one of the user's jobs
    ApplicationCreated,
    /// One of the user's applications was accepted, rejected or updated
    ApplicationStatusChanged,
    /// The payload did not say
    #[default]
    Unknown,
    /// A kind this client does not know yet, kept verbatim
    Other(String),
}

impl SourceEvent {
    /// Parse the backend's spelling of an event kind
    pub fn from_wire(raw: &str) -> Self {
        let folded: String = raw
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();

        match folded.as_str() {
            "" => SourceEvent::Unknown,
            "applicationcreated" | "newapplication" | "applicationsubmitted" => {
                SourceEvent::ApplicationCreated
            }
            "applicationstatuschanged" | "statuschanged" | "applicationstatus"
            | "statusupdate" => SourceEvent::ApplicationStatusChanged,
            _ => SourceEvent::Other(raw.to_string()),
        }
    }

    /// Canonical wire spelling
    pub fn as_wire(&self) -> &str {
        match self {
            SourceEvent::ApplicationCreated => "application_created",
            SourceEvent::ApplicationStatusChanged => "application_status_changed",
            SourceEvent::Unknown => "unknown",
            SourceEvent::Other(raw) => raw,
        }
    }
}

impl From<String> for SourceEvent {
    fn from(value: String) -> Self {
        SourceEvent::from_wire(&value)
    }
}

impl From<SourceEvent> for String {
    fn from(value: SourceEvent) -> Self {
        value.as_wire().to_string()
    }
}

impl fmt::Display for SourceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// One notification record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEntry {
    pub id: NotificationId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    #[serde(default)]
    pub source_event: SourceEvent,
}

impl NotificationEntry {
    /// Create an unread entry
    pub fn new(
        id: impl Into<NotificationId>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            timestamp,
            is_read: false,
            source_event: SourceEvent::Unknown,
        }
    }

    /// Set the read flag
    pub fn read(mut self, is_read: bool) -> Self {
        self.is_read = is_read;
        self
    }

    /// Set the source event
    pub fn with_source(mut self, source_event: SourceEvent) -> Self {
        self.source_event = source_event;
        self
    }

    /// Parse one entry from a push or pull payload.
    ///
    /// Fails when the id cannot be determined; such entries are dropped by the
    /// caller, never given a synthetic id.
    pub fn from_payload(value: &Value) -> Result<Self, MalformedPayload> {
        let obj = value.as_object().ok_or(MalformedPayload::NotAnObject)?;

        let id = field(obj, &["id", "_id"])
            .and_then(id_from_value)
            .ok_or(MalformedPayload::MissingId)?;

        let timestamp = field(obj, &["timestamp", "createdAt", "created_at"])
            .and_then(timestamp_from_value)
            .ok_or_else(|| MalformedPayload::InvalidTimestamp {
                id: id.to_string(),
            })?;

        let message = match field(obj, &["message", "text"]) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                return Err(MalformedPayload::InvalidField {
                    id: id.to_string(),
                    field: "message",
                })
            }
        };

        let is_read = match field(obj, &["isRead", "is_read", "read"]) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(MalformedPayload::InvalidField {
                    id: id.to_string(),
                    field: "isRead",
                })
            }
        };

        let source_event = match field(obj, &["sourceEvent", "source_event", "type"]) {
            Some(Value::String(s)) => SourceEvent::from_wire(s),
            _ => SourceEvent::Unknown,
        };

        Ok(Self {
            id,
            message,
            timestamp,
            is_read,
            source_event,
        })
    }

    /// Serialize in the backend's camelCase shape
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "id": self.id.as_str(),
            "message": self.message,
            "timestamp": self.timestamp.to_rfc3339(),
            "isRead": self.is_read,
            "sourceEvent": self.source_event.as_wire(),
        })
    }
}

fn field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| obj.get(*name))
}

fn id_from_value(value: &Value) -> Option<NotificationId> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(NotificationId::new(s.trim())),
        Value::Number(n) if n.is_u64() || n.is_i64() => Some(NotificationId::new(n.to_string())),
        // Extended-JSON object ids
        Value::Object(obj) => obj.get("$oid").and_then(id_from_value),
        _ => None,
    }
}

fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        // Epoch milliseconds
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::Object(obj) => obj.get("$date").and_then(timestamp_from_value),
        _ => None,
    }
}

/// Result of parsing a pull response item by item
#[derive(Debug, Default)]
pub struct ParsedBatch {
    /// Entries that parsed cleanly, in response order
    pub entries: Vec<NotificationEntry>,
    /// One error per dropped item
    pub rejected: Vec<MalformedPayload>,
}

impl ParsedBatch {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Parse every item of a pull response, dropping malformed ones individually
pub fn parse_batch(items: &[Value]) -> ParsedBatch {
    let mut batch = ParsedBatch::default();
    for item in items {
        match NotificationEntry::from_payload(item) {
            Ok(entry) => batch.entries.push(entry),
            Err(err) => {
                tracing::warn!("Dropping malformed notification: {}", err);
                batch.rejected.push(err);
            }
        }
    }
    batch
}

/// Pull the item list out of a response body.
///
/// The list endpoint answers with a bare array; some deployments wrap it as
/// `{ "notifications": [...] }` or `{ "data": [...] }`.
pub fn extract_items(body: Value) -> Result<Vec<Value>, MalformedPayload> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => {
            for key in ["notifications", "data"] {
                if let Some(Value::Array(items)) = obj.remove(key) {
                    return Ok(items);
                }
            }
            Err(MalformedPayload::Frame(
                "response has no notification list".to_string(),
            ))
        }
        _ => Err(MalformedPayload::Frame(
            "response is not a list".to_string(),
        )),
    }
}
