//! Dead-letter envelopes and the `x-death` header.
//!
//! When RabbitMQ dead-letters a message it prepends (or updates) an entry in
//! the `x-death` header array. The first entry is the most recent death and
//! its `routing-keys` field holds the keys the message was originally
//! published with. The delivery routing key on the dead-letter queue is
//! whatever the dead-letter exchange used and must not be used for redrive.

use async_trait::async_trait;
use lapin::BasicProperties;
use lapin::types::{AMQPValue, FieldTable};
use rollcall_core::error::Result;

use crate::publisher::Publisher;

/// One entry of the `x-death` header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeathRecord {
    pub queue: String,
    pub exchange: String,
    /// `rejected`, `expired`, `maxlen` or `delivery_limit`.
    pub reason: String,
    /// How many times the message died in this queue for this reason.
    pub count: i64,
    pub routing_keys: Vec<String>,
}

impl DeathRecord {
    fn from_table(table: &FieldTable) -> Self {
        Self {
            queue: field(table, "queue").and_then(as_string).unwrap_or_default(),
            exchange: field(table, "exchange").and_then(as_string).unwrap_or_default(),
            reason: field(table, "reason").and_then(as_string).unwrap_or_default(),
            count: field(table, "count").and_then(as_integer).unwrap_or(0),
            routing_keys: match field(table, "routing-keys") {
                Some(AMQPValue::FieldArray(keys)) => {
                    keys.as_slice().iter().filter_map(as_string).collect()
                }
                Some(other) => as_string(other).into_iter().collect(),
                None => Vec::new(),
            },
        }
    }
}

/// Parse every `x-death` entry, most recent first.
pub fn death_records(headers: Option<&FieldTable>) -> Vec<DeathRecord> {
    let Some(headers) = headers else {
        return Vec::new();
    };
    match field(headers, "x-death") {
        Some(AMQPValue::FieldArray(entries)) => entries
            .as_slice()
            .iter()
            .filter_map(|entry| match entry {
                AMQPValue::FieldTable(table) => Some(DeathRecord::from_table(table)),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn field<'a>(table: &'a FieldTable, name: &str) -> Option<&'a AMQPValue> {
    table
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value)
}

fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        _ => None,
    }
}

fn as_integer(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        _ => None,
    }
}

/// A message fetched from a dead-letter queue and not yet acknowledged.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Channel-scoped tag used to ack or requeue.
    pub delivery_tag: u64,
    /// Dead-letter queue it was fetched from.
    pub queue: String,
    /// Routing key of this delivery (set by the dead-letter exchange).
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
}

impl DeadLetter {
    pub fn deaths(&self) -> Vec<DeathRecord> {
        death_records(self.properties.headers().as_ref())
    }

    /// Routing key the message carried before it was dead-lettered.
    ///
    /// Taken from the most recent `x-death` entry. Without an `x-death`
    /// header the message was placed here directly and its delivery
    /// routing key is the only one there is.
    pub fn original_routing_key(&self) -> Option<String> {
        let deaths = self.deaths();
        if deaths.is_empty() {
            return (!self.routing_key.is_empty()).then(|| self.routing_key.clone());
        }
        deaths
            .into_iter()
            .next()
            .and_then(|death| death.routing_keys.into_iter().next())
            .filter(|key| !key.is_empty())
    }

    /// Total recorded deaths across all queues and reasons.
    pub fn death_count(&self) -> i64 {
        self.deaths().iter().map(|d| d.count).sum()
    }
}

/// Broker operations the retry daemon needs on top of publishing.
#[async_trait]
pub trait DeadLetterBroker: Publisher {
    /// Take one message off `queue` without acknowledging it.
    /// `Ok(None)` means the queue is currently empty.
    async fn fetch(&self, queue: &str) -> Result<Option<DeadLetter>>;

    /// Remove a fetched message for good.
    async fn ack(&self, letter: &DeadLetter) -> Result<()>;

    /// Return a fetched message to its queue.
    async fn requeue(&self, letter: &DeadLetter) -> Result<()>;
}
