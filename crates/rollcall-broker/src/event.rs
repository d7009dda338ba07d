//! Outbound domain events.

use chrono::{DateTime, Utc};
use lapin::BasicProperties;
use rollcall_core::error::{Result, RollcallError};
use serde::{Deserialize, Serialize};

/// An event published to the primary exchange.
///
/// Wire form: `{"event_type": "...", "payload": {...}, "timestamp": "..."}`.
/// The routing key is the event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.event_type
    }

    /// JSON body bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| RollcallError::Event(format!("Serialize {}: {e}", self.event_type)))
    }

    /// Persistent JSON message properties with a fresh message id.
    pub fn properties(&self) -> BasicProperties {
        BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_message_id(uuid::Uuid::new_v4().to_string().into())
            .with_timestamp(self.timestamp.timestamp().max(0) as u64)
            .with_type(self.event_type.as_str().into())
    }
}
