//! Event vocabulary and wire payload shapes
//!
//! Internal names are Rust-idiomatic; everything serialized for a backend is
//! snake_case. The per-batch envelope ([`WirePayload`]) carries the identity
//! fields, so individual events only serialize their type, timestamp,
//! page_url, and type-specific payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Hard bound on the outgoing event queue; oldest events evicted beyond it
pub const MAX_EVENTS_QUEUE_LENGTH: usize = 100;

/// Queue length that triggers an immediate flush
pub const BATCH_SIZE_THRESHOLD: usize = 10;

/// Defensive cap on the pre-session pending buffer
pub const MAX_PENDING_BUFFER_LENGTH: usize = 500;

/// Maximum number of entries custom-event metadata may carry
pub const MAX_METADATA_ENTRIES: usize = 50;

/// Maximum length of a metadata string value
pub const MAX_METADATA_STRING_LENGTH: usize = 1_000;

/// Scroll direction for scroll-depth events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
}

/// Web vital metrics reported by the host page
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebVitalMetric {
    Lcp,
    Cls,
    Fcp,
    Ttfb,
    Inp,
}

/// Why a session ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    /// Inactivity timeout elapsed
    Inactivity,
    /// Host app called `stop_tracking`
    ManualStop,
    /// SDK destroyed
    Destroy,
}

/// Type-specific event payload - the vocabulary of trackable activity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A pointer click
    Click {
        x: i32,
        y: i32,
        /// CSS-selector-ish description of the click target
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Scroll depth milestone
    Scroll {
        /// Percent of the page scrolled, 0..=100
        depth: u8,
        direction: ScrollDirection,
    },
    /// A page was viewed
    PageView {
        #[serde(skip_serializing_if = "Option::is_none")]
        referrer: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    /// Host-defined custom event
    Custom {
        name: String,
        #[serde(skip_serializing_if = "Map::is_empty", default)]
        metadata: Map<String, Value>,
    },
    /// Performance measurement
    WebVital { metric: WebVitalMetric, value: f64 },
    /// An error observed on the host page
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// A session began
    SessionStart { recovered: bool },
    /// A session ended
    SessionEnd { reason: SessionEndReason },
}

impl EventPayload {
    /// Wire name of this event type
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::Scroll { .. } => "scroll",
            Self::PageView { .. } => "page_view",
            Self::Custom { .. } => "custom",
            Self::WebVital { .. } => "web_vital",
            Self::Error { .. } => "error",
            Self::SessionStart { .. } => "session_start",
            Self::SessionEnd { .. } => "session_end",
        }
    }

    /// Session lifecycle events bypass sampling and consent gating
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::SessionStart { .. } | Self::SessionEnd { .. })
    }
}

/// A tracked event, enriched and ready for delivery
///
/// Immutable once queued. Identity fields are carried for internal use but
/// stay off the per-event wire form; the batch envelope owns them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub payload: EventPayload,
    /// Unix epoch milliseconds at track time
    pub timestamp: i64,
    pub page_url: String,
    #[serde(skip)]
    pub session_id: String,
    #[serde(skip)]
    pub user_id: Option<String>,
    #[serde(skip)]
    pub device: Option<String>,
}

/// Batch envelope sent to each backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WirePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub events: Vec<Event>,
}

/// Problems with custom-event metadata
#[derive(Debug, Error, PartialEq)]
pub enum MetadataError {
    /// Objects and arrays-of-objects are not accepted as metadata values
    #[error("metadata key {key:?} holds a nested value; only primitives and arrays of primitives are allowed")]
    NestedValue { key: String },

    /// String value exceeds [`MAX_METADATA_STRING_LENGTH`]
    #[error("metadata key {key:?} exceeds {MAX_METADATA_STRING_LENGTH} characters")]
    OversizedString { key: String },

    /// More entries than [`MAX_METADATA_ENTRIES`]
    #[error("metadata has {count} entries; the maximum is {MAX_METADATA_ENTRIES}")]
    TooManyEntries { count: usize },
}

fn is_allowed_scalar(value: &Value) -> bool {
    matches!(value, Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_))
}

fn value_violation(key: &str, value: &Value) -> Option<MetadataError> {
    match value {
        Value::String(s) if s.len() > MAX_METADATA_STRING_LENGTH => Some(MetadataError::OversizedString {
            key: key.to_string(),
        }),
        Value::Array(items) => {
            if items.iter().all(is_allowed_scalar) {
                items
                    .iter()
                    .any(|v| matches!(v, Value::String(s) if s.len() > MAX_METADATA_STRING_LENGTH))
                    .then(|| MetadataError::OversizedString { key: key.to_string() })
            } else {
                Some(MetadataError::NestedValue { key: key.to_string() })
            }
        }
        Value::Object(_) => Some(MetadataError::NestedValue { key: key.to_string() }),
        _ => None,
    }
}

/// Strict metadata validation, used in QA mode
///
/// Returns the first violation found.
pub fn validate_metadata(metadata: &Map<String, Value>) -> Result<(), MetadataError> {
    if metadata.len() > MAX_METADATA_ENTRIES {
        return Err(MetadataError::TooManyEntries { count: metadata.len() });
    }
    for (key, value) in metadata {
        if let Some(violation) = value_violation(key, value) {
            return Err(violation);
        }
    }
    Ok(())
}

/// Lenient metadata sanitization, used in production mode
///
/// Drops offending entries (and everything past the entry cap) rather than
/// rejecting the whole event; returns the dropped keys for logging.
pub fn sanitize_metadata(metadata: Map<String, Value>) -> (Map<String, Value>, Vec<String>) {
    let mut kept = Map::new();
    let mut dropped = Vec::new();
    for (key, value) in metadata {
        if kept.len() >= MAX_METADATA_ENTRIES || value_violation(&key, &value).is_some() {
            dropped.push(key);
        } else {
            kept.insert(key, value);
        }
    }
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_event_type_names_are_snake_case() {
        assert_eq!(
            EventPayload::PageView {
                referrer: None,
                title: None
            }
            .event_type(),
            "page_view"
        );
        assert_eq!(
            EventPayload::WebVital {
                metric: WebVitalMetric::Lcp,
                value: 1.2
            }
            .event_type(),
            "web_vital"
        );
    }

    #[test]
    fn test_wire_event_shape() {
        let event = Event {
            payload: EventPayload::Click {
                x: 10,
                y: 20,
                target: Some("button#buy".to_string()),
            },
            timestamp: 1_700_000_000_000,
            page_url: "/checkout".to_string(),
            session_id: "123-456".to_string(),
            user_id: Some("u-1".to_string()),
            device: Some("desktop".to_string()),
        };

        let wire = serde_json::to_value(&event).expect("serialize");
        assert_eq!(wire["type"], "click");
        assert_eq!(wire["page_url"], "/checkout");
        assert_eq!(wire["timestamp"], 1_700_000_000_000_i64);
        // Identity fields live on the envelope, not the event.
        assert!(wire.get("session_id").is_none());
        assert!(wire.get("user_id").is_none());
    }

    #[test]
    fn test_wire_payload_envelope() {
        let payload = WirePayload {
            user_id: Some("u-1".to_string()),
            session_id: "123-456".to_string(),
            device: None,
            events: vec![],
        };
        let wire = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(wire["user_id"], "u-1");
        assert_eq!(wire["session_id"], "123-456");
        assert!(wire.get("device").is_none());
        assert_eq!(wire["events"], json!([]));
    }

    #[test]
    fn test_wire_payload_roundtrip_for_persistence() {
        let payload = WirePayload {
            user_id: None,
            session_id: "123-456".to_string(),
            device: Some("mobile".to_string()),
            events: vec![Event {
                payload: EventPayload::Custom {
                    name: "signup".to_string(),
                    metadata: map(&[("plan", json!("pro"))]),
                },
                timestamp: 1,
                page_url: "/pricing".to_string(),
                session_id: String::new(),
                user_id: None,
                device: None,
            }],
        };

        let encoded = serde_json::to_string(&payload).expect("encode");
        let decoded: WirePayload = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.session_id, payload.session_id);
        assert_eq!(decoded.events.len(), 1);
        assert_eq!(decoded.events[0].payload.event_type(), "custom");
    }

    #[test]
    fn test_validate_metadata_accepts_primitives() {
        let metadata = map(&[
            ("plan", json!("pro")),
            ("seats", json!(5)),
            ("trial", json!(true)),
            ("tags", json!(["a", "b"])),
        ]);
        assert!(validate_metadata(&metadata).is_ok());
    }

    #[test]
    fn test_validate_metadata_rejects_nested() {
        let metadata = map(&[("nested", json!({"a": 1}))]);
        assert_eq!(
            validate_metadata(&metadata),
            Err(MetadataError::NestedValue {
                key: "nested".to_string()
            })
        );

        let array_of_objects = map(&[("items", json!([{"a": 1}]))]);
        assert!(matches!(
            validate_metadata(&array_of_objects),
            Err(MetadataError::NestedValue { .. })
        ));
    }

    #[test]
    fn test_validate_metadata_rejects_oversized_string() {
        let metadata = map(&[("blob", json!("x".repeat(MAX_METADATA_STRING_LENGTH + 1)))]);
        assert!(matches!(
            validate_metadata(&metadata),
            Err(MetadataError::OversizedString { .. })
        ));
    }

    #[test]
    fn test_sanitize_keeps_good_drops_bad() {
        let metadata = map(&[("ok", json!("fine")), ("bad", json!({"nested": true}))]);
        let (kept, dropped) = sanitize_metadata(metadata);
        assert_eq!(kept.len(), 1);
        assert!(kept.contains_key("ok"));
        assert_eq!(dropped, vec!["bad".to_string()]);
    }

    #[test]
    fn test_sanitize_enforces_entry_cap() {
        let metadata: Map<String, Value> = (0..MAX_METADATA_ENTRIES + 5)
            .map(|i| (format!("k{i:03}"), json!(i)))
            .collect();
        let (kept, dropped) = sanitize_metadata(metadata);
        assert_eq!(kept.len(), MAX_METADATA_ENTRIES);
        assert_eq!(dropped.len(), 5);
    }
}
