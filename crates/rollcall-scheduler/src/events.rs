//! Event builders: turn a due row into the event published for it.

use rollcall_broker::Event;
use rollcall_core::error::{Result, RollcallError};
use serde_json::json;

use crate::tasks::ScheduleItem;

pub const GAME_REMINDER_DUE: &str = "game.reminder_due";
pub const GAME_STATUS_TRANSITION_DUE: &str = "game.status_transition_due";

/// Pure function from a claimed row to its event.
pub trait EventBuilder: Send + Sync {
    fn build(&self, item: &ScheduleItem) -> Result<Event>;
}

impl<F> EventBuilder for F
where
    F: Fn(&ScheduleItem) -> Result<Event> + Send + Sync,
{
    fn build(&self, item: &ScheduleItem) -> Result<Event> {
        self(item)
    }
}

fn require_detail<'a>(item: &'a ScheduleItem, what: &str) -> Result<&'a str> {
    item.detail
        .as_deref()
        .filter(|d| !d.is_empty())
        .ok_or_else(|| RollcallError::Event(format!("Schedule row {} has no {what}", item.id)))
}

/// `game.reminder_due` for `notification_schedule` rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReminderEventBuilder;

impl EventBuilder for ReminderEventBuilder {
    fn build(&self, item: &ScheduleItem) -> Result<Event> {
        let minutes: i32 = require_detail(item, "reminder_minutes")?
            .parse()
            .map_err(|e| RollcallError::Event(format!("Row {}: reminder_minutes: {e}", item.id)))?;
        Ok(Event::new(
            GAME_REMINDER_DUE,
            json!({
                "game_id": item.subject_id,
                "reminder_minutes": minutes,
                "notification_time": item.due_at,
                "schedule_id": item.id,
            }),
        ))
    }
}

/// `game.status_transition_due` for `game_status_schedule` rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusTransitionEventBuilder;

impl EventBuilder for StatusTransitionEventBuilder {
    fn build(&self, item: &ScheduleItem) -> Result<Event> {
        let target_status = require_detail(item, "target_status")?;
        Ok(Event::new(
            GAME_STATUS_TRANSITION_DUE,
            json!({
                "game_id": item.subject_id,
                "target_status": target_status,
                "transition_time": item.due_at,
                "schedule_id": item.id,
            }),
        ))
    }
}
