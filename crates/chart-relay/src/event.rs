//! Relay event types and identity

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Delivery partition for an event or a subscriber.
///
/// Absence of a caller-supplied session id is its own partition, never merged
/// with any literal session string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    /// The "no session id supplied" partition
    Global,
    /// A caller-supplied session id
    Named(String),
}

impl SessionKey {
    /// Build a key from the wire-level optional session id
    pub fn from_option(session: Option<String>) -> Self {
        match session {
            Some(s) if !s.is_empty() => SessionKey::Named(s),
            _ => SessionKey::Global,
        }
    }

    /// Wire form: `None` for the global partition
    pub fn as_option(&self) -> Option<&str> {
        match self {
            SessionKey::Global => None,
            SessionKey::Named(s) => Some(s),
        }
    }

    /// Storage key segment. The `s:` prefix keeps a caller-supplied literal
    /// `"global"` distinct from the absent-session partition.
    pub fn storage_segment(&self) -> String {
        match self {
            SessionKey::Global => "global".to_string(),
            SessionKey::Named(s) => format!("s:{}", s),
        }
    }
}

impl Serialize for SessionKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_option().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SessionKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(SessionKey::from_option(Option::<String>::deserialize(
            deserializer,
        )?))
    }
}

/// Which durable log an event belongs to. Message and chart traffic share the
/// transport but are retained separately with different caps and TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogFamily {
    Message,
    Chart,
}

impl LogFamily {
    pub fn key_prefix(&self) -> &'static str {
        match self {
            LogFamily::Message => "msg",
            LogFamily::Chart => "chart",
        }
    }
}

/// Event payload. Chart configs are opaque to the relay and round-trip
/// untouched; only `chart_id` is read for routing and projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Message {
        content: String,
    },
    ChartUpsert {
        chart_id: String,
        config: serde_json::Value,
    },
    ChartRemove {
        chart_id: String,
    },
}

/// One unit of relay traffic. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique id, `{timestamp_ms}-{hex suffix}`; dedup key across the
    /// history/live boundary
    pub id: String,
    #[serde(flatten)]
    pub kind: EventKind,
    /// Delivery partition (`null` on the wire for global)
    pub session: SessionKey,
    /// Publish-time wall clock, milliseconds, non-decreasing in-process
    pub timestamp_ms: i64,
}

impl Event {
    pub fn new(kind: EventKind, session: SessionKey) -> Self {
        let timestamp_ms = next_timestamp_ms();
        Self {
            id: generate_id(timestamp_ms),
            kind,
            session,
            timestamp_ms,
        }
    }

    /// The chart id this event targets, if it is a chart event
    pub fn chart_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Message { .. } => None,
            EventKind::ChartUpsert { chart_id, .. } | EventKind::ChartRemove { chart_id } => {
                Some(chart_id)
            }
        }
    }

    pub fn family(&self) -> LogFamily {
        match self.kind {
            EventKind::Message { .. } => LogFamily::Message,
            EventKind::ChartUpsert { .. } | EventKind::ChartRemove { .. } => LogFamily::Chart,
        }
    }

    pub fn is_chart_remove(&self) -> bool {
        matches!(self.kind, EventKind::ChartRemove { .. })
    }
}

/// Parse the millisecond component out of an event id. Used as a fallback
/// replay cursor when the id itself has been evicted from the log.
pub fn id_timestamp_ms(id: &str) -> Option<i64> {
    id.split('-').next()?.parse().ok()
}

fn generate_id(timestamp_ms: i64) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", timestamp_ms, &suffix[..8])
}

// Wall clock clamped to be non-decreasing within the process.
static LAST_TS: AtomicI64 = AtomicI64::new(0);

fn next_timestamp_ms() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let prev = LAST_TS.fetch_max(now, Ordering::SeqCst);
    now.max(prev)
}
