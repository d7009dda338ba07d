//! # Rollcall Scheduler
//!
//! Event-driven scheduling daemon for "do X at time T" rows.
//!
//! ## Design Principles
//! - The due-item table is the only source of truth
//! - Wake signals (LISTEN/NOTIFY) are hints that cut latency, never data
//! - `max_wait` bounds every sleep, so a lost notification only delays work
//! - `FOR UPDATE SKIP LOCKED` lets replicas share a table without coordination
//! - One algorithm, many schedule kinds: kinds plug in as `ScheduleTable` types
//!
//! ## Architecture
//! ```text
//! SchedulerDaemon<Store, Wake>
//!   IDLE       next_due()            → wait = clamp(due_at - now - lead, 0, max_wait)
//!   WAITING    wake.receive(wait)    → timeout | WakeSignal | (startup)
//!   CLAIMING   claim_due(now, limit) → rows locked, skip-locked
//!   PUBLISHING build(row) → publish → mark_processed → commit
//!                 publish failure: row left unprocessed, retried next cycle
//! ```

pub mod engine;
pub mod events;
pub mod memory;
pub mod notify;
pub mod persistence;
pub mod store;
pub mod tasks;

pub use engine::{CycleReport, DaemonSettings, DaemonStats, SchedulerDaemon};
pub use events::{EventBuilder, ReminderEventBuilder, StatusTransitionEventBuilder};
pub use memory::InMemoryDueStore;
pub use notify::{LocalWakeChannel, LocalWakeHub, PgWakeChannel, WakeChannel};
pub use persistence::{GameReminders, GameStatusTransitions, PgDueStore, ScheduleTable};
pub use store::{DueClaim, DueStore};
pub use tasks::{ScheduleItem, WakeOperation, WakeSignal};
