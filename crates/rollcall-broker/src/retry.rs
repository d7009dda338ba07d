//! Dead-letter retry daemon: periodically redrives every registered
//! dead-letter queue back to the primary exchange.
//!
//! This is the only component that consumes `*.dlq`. Messages are held
//! unacknowledged while a queue is drained so a failing message is not
//! fetched twice in one cycle; failures go back to the dead-letter queue
//! once the drain of that queue finishes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rollcall_core::backoff::Backoff;
use rollcall_core::error::{Result, RollcallError};
use tokio_util::sync::CancellationToken;

use crate::dead_letter::{DeadLetter, DeadLetterBroker};

/// Per-cycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub fetched: u64,
    pub republished: u64,
    pub requeued: u64,
    /// Queues whose drain stopped on a broker error.
    pub failed_queues: u64,
}

impl RetryStats {
    fn absorb(&mut self, other: RetryStats) {
        self.fetched += other.fetched;
        self.republished += other.republished;
        self.requeued += other.requeued;
        self.failed_queues += other.failed_queues;
    }
}

/// Lifetime counters, readable while the daemon runs.
#[derive(Debug, Default)]
pub struct RetryTotals {
    pub cycles: AtomicU64,
    pub republished: AtomicU64,
    pub requeued: AtomicU64,
}

/// Drains dead-letter queues on a fixed interval.
pub struct RetryDaemon<B: DeadLetterBroker> {
    broker: Arc<B>,
    dead_letter_queues: Vec<String>,
    max_messages_per_queue: u32,
    totals: Arc<RetryTotals>,
}

impl<B: DeadLetterBroker> RetryDaemon<B> {
    pub fn new(broker: Arc<B>, dead_letter_queues: Vec<String>) -> Self {
        Self {
            broker,
            dead_letter_queues,
            max_messages_per_queue: 1000,
            totals: Arc::new(RetryTotals::default()),
        }
    }

    pub fn with_max_messages_per_queue(mut self, max: u32) -> Self {
        self.max_messages_per_queue = max.max(1);
        self
    }

    pub fn totals(&self) -> Arc<RetryTotals> {
        self.totals.clone()
    }

    /// Loop until cancelled, draining every queue each `retry_interval`.
    /// A cycle that hit broker errors is retried sooner, with backoff.
    pub async fn run(&self, retry_interval: Duration, cancel: CancellationToken) {
        tracing::info!(
            "♻️ Dead-letter retry daemon started ({} queue(s), every {}s)",
            self.dead_letter_queues.len(),
            retry_interval.as_secs()
        );
        let mut backoff = Backoff::default();

        loop {
            let stats = self.run_once_until(&cancel).await;
            let wait = if stats.failed_queues > 0 {
                backoff.next_delay().min(retry_interval)
            } else {
                backoff.reset();
                retry_interval
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::info!("♻️ Dead-letter retry daemon stopped");
    }

    /// One full pass over every dead-letter queue.
    pub async fn run_once(&self) -> RetryStats {
        self.run_once_until(&CancellationToken::new()).await
    }

    async fn run_once_until(&self, cancel: &CancellationToken) -> RetryStats {
        let mut cycle = RetryStats::default();
        for queue in &self.dead_letter_queues {
            if cancel.is_cancelled() {
                break;
            }
            match self.drain_queue(queue).await {
                Ok(stats) => cycle.absorb(stats),
                Err((stats, e)) => {
                    tracing::warn!("⚠️ Draining {queue} stopped: {e}");
                    cycle.absorb(stats);
                    cycle.failed_queues += 1;
                }
            }
        }

        self.totals.cycles.fetch_add(1, Ordering::Relaxed);
        self.totals.republished.fetch_add(cycle.republished, Ordering::Relaxed);
        self.totals.requeued.fetch_add(cycle.requeued, Ordering::Relaxed);
        if cycle.fetched > 0 || cycle.failed_queues > 0 {
            tracing::info!(
                "♻️ Retry cycle: fetched={} republished={} requeued={} failed_queues={}",
                cycle.fetched,
                cycle.republished,
                cycle.requeued,
                cycle.failed_queues
            );
        } else {
            tracing::debug!("♻️ Retry cycle: all dead-letter queues empty");
        }
        cycle
    }

    /// Drain one queue. On a fetch error the messages already held are
    /// still requeued before the error is returned.
    async fn drain_queue(&self, queue: &str) -> std::result::Result<RetryStats, (RetryStats, RollcallError)> {
        let mut stats = RetryStats::default();
        let mut failed: Vec<DeadLetter> = Vec::new();
        let mut fetch_error = None;

        for _ in 0..self.max_messages_per_queue {
            let letter = match self.broker.fetch(queue).await {
                Ok(Some(letter)) => letter,
                Ok(None) => break,
                Err(e) => {
                    fetch_error = Some(e);
                    break;
                }
            };
            stats.fetched += 1;

            match self.redrive(&letter).await {
                Ok(()) => match self.broker.ack(&letter).await {
                    Ok(()) => stats.republished += 1,
                    // Already republished; the broker will hand it back
                    // once the channel closes, producing one duplicate.
                    Err(e) => tracing::warn!("⚠️ Ack after redrive failed on {queue}: {e}"),
                },
                Err(e) => {
                    tracing::warn!(
                        "⚠️ Redrive from {queue} failed (deaths={}): {e}",
                        letter.death_count()
                    );
                    failed.push(letter);
                }
            }
        }

        for letter in &failed {
            match self.broker.requeue(letter).await {
                Ok(()) => stats.requeued += 1,
                Err(e) => tracing::error!("❌ Requeue to {queue} failed: {e}"),
            }
        }

        match fetch_error {
            Some(e) => Err((stats, e)),
            None => Ok(stats),
        }
    }

    async fn redrive(&self, letter: &DeadLetter) -> Result<()> {
        let routing_key = letter.original_routing_key().ok_or_else(|| {
            RollcallError::Republish(format!(
                "No original routing key recorded for message from {}",
                letter.queue
            ))
        })?;
        self.broker
            .publish(&routing_key, &letter.body, letter.properties.clone())
            .await?;
        tracing::debug!("↪️ Redrove message from {} to '{routing_key}'", letter.queue);
        Ok(())
    }
}
