//! Exchange and queue layout.
//!
//! Each primary queue dead-letters into the shared dead-letter exchange with
//! its own name as routing key, so `bot_events` rejects land in
//! `bot_events.dlq` regardless of the message's original routing key.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use rollcall_core::config::{BrokerConfig, QueueConfig};

/// A primary queue with its dead-letter twin.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSpec {
    pub name: String,
    pub dead_letter_queue: String,
    /// Topic patterns bound on the primary exchange.
    pub bindings: Vec<String>,
}

/// Full broker layout for one deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub queues: Vec<QueueSpec>,
}

impl Topology {
    pub fn from_config(broker: &BrokerConfig, queues: &[QueueConfig]) -> Self {
        Self {
            exchange: broker.exchange.clone(),
            dead_letter_exchange: broker.dead_letter_exchange.clone(),
            queues: queues
                .iter()
                .map(|q| QueueSpec {
                    name: q.name.clone(),
                    dead_letter_queue: broker.dead_letter_queue(&q.name),
                    bindings: q.bindings.clone(),
                })
                .collect(),
        }
    }

    /// Names of every dead-letter queue, in declaration order.
    pub fn dead_letter_queues(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.dead_letter_queue.clone()).collect()
    }

    /// `x-dead-letter-*` arguments for a primary queue.
    pub fn primary_queue_arguments(&self, queue: &QueueSpec) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(self.dead_letter_exchange.as_str())),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(queue.name.as_str())),
        );
        args
    }
}
