use chrono::{DateTime, Utc};
use serde_json::Value;
use strum::{Display, EnumString};

/// The event kinds the core routes. External handler registrations declare
/// their kind as a string; parsing it through `EnumString` is the validation
/// gate that rejects unknown kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    ProjectChange,
    FlowcellReady,
    DeliveryReady,
}

/// A lightweight container for events that watchers produce and the core
/// consumes. The payload schema is per-kind.
#[derive(Debug, Clone)]
pub struct YggdrasilEvent {
    pub event_type: EventType,
    pub payload: Value,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl YggdrasilEvent {
    pub fn new(event_type: EventType, payload: Value, source: impl Into<String>) -> Self {
        Self {
            event_type,
            payload,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }
}
