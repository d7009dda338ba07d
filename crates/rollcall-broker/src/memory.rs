//! In-process broker with RabbitMQ-like routing and dead-lettering.
//!
//! Topic bindings on a single primary exchange, per-queue dead-letter
//! queues, `x-death` bookkeeping, and unacknowledged-delivery tracking.
//! Publishing with no matching binding fails the way a mandatory publish
//! does on RabbitMQ.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lapin::BasicProperties;
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use rollcall_core::error::{Result, RollcallError};

use crate::dead_letter::{DeadLetter, DeadLetterBroker};
use crate::publisher::Publisher;

/// A message sitting in a queue.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
}

#[derive(Default)]
struct BrokerState {
    bindings: Vec<(String, String)>,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    unacked: HashMap<u64, (String, StoredMessage)>,
    next_tag: u64,
    fail_next_publishes: u32,
    published: Vec<StoredMessage>,
}

/// Shared in-memory broker.
pub struct InMemoryBroker {
    exchange: String,
    dead_letter_suffix: String,
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    pub fn new(exchange: &str, dead_letter_suffix: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            dead_letter_suffix: dead_letter_suffix.to_string(),
            state: Mutex::new(BrokerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `queue` to a topic pattern, creating the queue and its
    /// dead-letter queue.
    pub fn bind(&self, queue: &str, pattern: &str) {
        let dlq = self.dead_letter_queue(queue);
        let mut state = self.state();
        state.queues.entry(queue.to_string()).or_default();
        state.queues.entry(dlq).or_default();
        state.bindings.push((queue.to_string(), pattern.to_string()));
    }

    /// Drop every binding of `queue`; its messages stay put.
    pub fn unbind(&self, queue: &str) {
        self.state().bindings.retain(|(q, _)| q != queue);
    }

    pub fn dead_letter_queue(&self, queue: &str) -> String {
        format!("{queue}{}", self.dead_letter_suffix)
    }

    /// Make the next `n` publishes fail with a transient broker error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.state().fail_next_publishes = n;
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Deliveries fetched but neither acked nor requeued.
    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    /// Every message accepted by the exchange, in order.
    pub fn published(&self) -> Vec<StoredMessage> {
        self.state().published.clone()
    }

    /// Consume and acknowledge the head of `queue`.
    pub fn consume(&self, queue: &str) -> Option<StoredMessage> {
        self.state().queues.get_mut(queue)?.pop_front()
    }

    /// Reject the head of `queue` without requeue, moving it to the
    /// queue's dead-letter queue the way RabbitMQ does.
    pub fn dead_letter_head(&self, queue: &str, reason: &str) -> bool {
        let dlq = self.dead_letter_queue(queue);
        let mut state = self.state();
        let Some(message) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return false;
        };
        let properties = record_death(&message, queue, &self.exchange, reason);
        state.queues.entry(dlq).or_default().push_back(StoredMessage {
            routing_key: queue.to_string(),
            body: message.body,
            properties,
        });
        true
    }
}

/// Prepend or bump the `x-death` entry for (queue, reason).
fn record_death(message: &StoredMessage, queue: &str, exchange: &str, reason: &str) -> BasicProperties {
    let mut headers = message.properties.headers().clone().unwrap_or_default();
    let mut deaths: Vec<AMQPValue> = headers
        .inner()
        .iter()
        .find(|(k, _)| k.as_str() == "x-death")
        .and_then(|(_, v)| match v {
            AMQPValue::FieldArray(entries) => Some(entries.as_slice().to_vec()),
            _ => None,
        })
        .unwrap_or_default();

    let matches = |entry: &AMQPValue| match entry {
        AMQPValue::FieldTable(t) => {
            let get = |name: &str| {
                t.inner()
                    .iter()
                    .find(|(k, _)| k.as_str() == name)
                    .map(|(_, v)| v.clone())
            };
            get("queue") == Some(AMQPValue::LongString(LongString::from(queue)))
                && get("reason") == Some(AMQPValue::LongString(LongString::from(reason)))
        }
        _ => false,
    };

    let previous_count = deaths
        .iter()
        .position(matches)
        .map(|idx| deaths.remove(idx))
        .and_then(|entry| match entry {
            AMQPValue::FieldTable(t) => t
                .inner()
                .iter()
                .find(|(k, _)| k.as_str() == "count")
                .and_then(|(_, v)| match v {
                    AMQPValue::LongLongInt(c) => Some(*c),
                    _ => None,
                }),
            _ => None,
        })
        .unwrap_or(0);

    let mut entry = FieldTable::default();
    entry.insert(ShortString::from("queue"), AMQPValue::LongString(LongString::from(queue)));
    entry.insert(ShortString::from("reason"), AMQPValue::LongString(LongString::from(reason)));
    entry.insert(ShortString::from("exchange"), AMQPValue::LongString(LongString::from(exchange)));
    entry.insert(ShortString::from("count"), AMQPValue::LongLongInt(previous_count + 1));
    entry.insert(
        ShortString::from("routing-keys"),
        AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::LongString(
            LongString::from(message.routing_key.as_str()),
        )])),
    );
    deaths.insert(0, AMQPValue::FieldTable(entry));

    headers.insert(ShortString::from("x-death"), AMQPValue::FieldArray(FieldArray::from(deaths)));
    message.properties.clone().with_headers(headers)
}

/// AMQP topic match: `*` is one word, `#` is zero or more words.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| go(rest, &key[skip..])),
            Some((&word, rest)) => match key.split_first() {
                Some((&k, key_rest)) => (word == "*" || word == k) && go(rest, key_rest),
                None => false,
            },
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    go(&pattern, &key)
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        let mut state = self.state();
        if state.fail_next_publishes > 0 {
            state.fail_next_publishes -= 1;
            return Err(RollcallError::Broker(format!(
                "Injected publish failure for '{routing_key}'"
            )));
        }

        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|(_, pattern)| topic_matches(pattern, routing_key))
            .map(|(queue, _)| queue.clone())
            .collect();
        // One copy per queue, however many of its bindings match.
        targets.sort();
        targets.dedup();
        if targets.is_empty() {
            return Err(RollcallError::Republish(format!(
                "No queue bound for routing key '{routing_key}'"
            )));
        }

        let message = StoredMessage {
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties,
        };
        for queue in targets {
            state.queues.entry(queue).or_default().push_back(message.clone());
        }
        state.published.push(message);
        Ok(())
    }
}

#[async_trait]
impl DeadLetterBroker for InMemoryBroker {
    async fn fetch(&self, queue: &str) -> Result<Option<DeadLetter>> {
        let mut state = self.state();
        let Some(message) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        state.next_tag += 1;
        let tag = state.next_tag;
        let letter = DeadLetter {
            delivery_tag: tag,
            queue: queue.to_string(),
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
            properties: message.properties.clone(),
        };
        state.unacked.insert(tag, (queue.to_string(), message));
        Ok(Some(letter))
    }

    async fn ack(&self, letter: &DeadLetter) -> Result<()> {
        self.state()
            .unacked
            .remove(&letter.delivery_tag)
            .map(|_| ())
            .ok_or_else(|| RollcallError::Broker(format!("Unknown delivery tag {}", letter.delivery_tag)))
    }

    async fn requeue(&self, letter: &DeadLetter) -> Result<()> {
        let mut state = self.state();
        let (queue, message) = state
            .unacked
            .remove(&letter.delivery_tag)
            .ok_or_else(|| RollcallError::Broker(format!("Unknown delivery tag {}", letter.delivery_tag)))?;
        state.queues.entry(queue).or_default().push_front(message);
        Ok(())
    }
}
