//! Schedule item and wake signal definitions, the core data model.

use chrono::{DateTime, Utc};
use rollcall_core::error::{Result, RollcallError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One "do X at time T" row, independent of schedule kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduleItem {
    /// Unique row ID.
    pub id: Uuid,
    /// Entity this row concerns (a game session). Opaque here.
    pub subject_id: Uuid,
    /// When the item becomes actionable.
    pub due_at: DateTime<Utc>,
    /// Set once, by a committed claim + publish.
    pub processed: bool,
    /// Kind-specific column rendered as text (reminder minutes, target status).
    pub detail: Option<String>,
}

impl ScheduleItem {
    /// Create a new unprocessed item.
    pub fn new(subject_id: Uuid, due_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id,
            due_at,
            processed: false,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Check if this item should be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.processed && self.due_at <= now
    }
}

/// Row change reported by the table trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeOperation {
    Insert,
    Update,
    Delete,
}

/// Notification payload: `{"operation", "subject_id", "due_at"}`.
/// A hint that the table changed; the daemon re-queries instead of trusting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WakeSignal {
    pub operation: WakeOperation,
    pub subject_id: String,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
}

impl WakeSignal {
    pub fn parse(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| RollcallError::MalformedSignal(format!("{e}: {payload:.120}")))
    }

    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
