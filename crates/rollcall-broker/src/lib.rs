//! # Rollcall Broker
//!
//! Everything that touches the message broker.
//!
//! ## Architecture
//! ```text
//! Scheduler daemon ──publish_event──▶ game_scheduler (topic exchange)
//!                                        ├── bot_events ──reject──▶ game_scheduler.dlx ──▶ bot_events.dlq
//!                                        └── api_events ──reject──▶ game_scheduler.dlx ──▶ api_events.dlq
//!
//! RetryDaemon (sole owner of *.dlq)
//!   └── every retry_interval: fetch → read x-death → republish with the
//!       original routing key → ack (or requeue on failure)
//! ```
//!
//! Scheduling daemons only publish. Draining dead-letter queues from more
//! than one place redelivers the same message twice per cycle, so the
//! [`RetryDaemon`] is the only consumer of `*.dlq`.

pub mod amqp;
pub mod dead_letter;
pub mod event;
pub mod memory;
pub mod publisher;
pub mod retry;
pub mod topology;

pub use amqp::AmqpBroker;
pub use dead_letter::{DeadLetter, DeadLetterBroker, DeathRecord};
pub use event::Event;
pub use memory::InMemoryBroker;
pub use publisher::Publisher;
pub use retry::{RetryDaemon, RetryStats};
pub use topology::Topology;

// Re-exported so callers can build message properties without a direct lapin dependency.
pub use lapin::BasicProperties;
