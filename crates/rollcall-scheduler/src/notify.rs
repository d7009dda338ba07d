//! Wake channels: block until a change notification arrives or a timeout
//! elapses.
//!
//! A signal only tells the daemon to re-query. Malformed payloads are logged
//! and ignored, and a lost listener connection is re-established with
//! backoff, so `receive` never fails; the worst case is a timeout.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rollcall_core::backoff::Backoff;
use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};

use crate::tasks::WakeSignal;

#[async_trait]
pub trait WakeChannel: Send {
    /// Channel name subscribed to.
    fn channel(&self) -> &str;

    /// Wait up to `timeout` for the next valid signal. `None` on timeout.
    async fn receive(&mut self, timeout: Duration) -> Option<WakeSignal>;
}

fn decode(channel: &str, payload: &str) -> Option<WakeSignal> {
    match WakeSignal::parse(payload) {
        Ok(signal) => Some(signal),
        Err(e) => {
            tracing::warn!("⚠️ Ignoring malformed wake signal on {channel}: {e}");
            None
        }
    }
}

/// PostgreSQL LISTEN/NOTIFY subscriber.
pub struct PgWakeChannel {
    pool: PgPool,
    channel: String,
    listener: Option<PgListener>,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

impl PgWakeChannel {
    /// Subscribe to `channel`. A failed first connection is logged and
    /// retried from `receive`.
    pub async fn subscribe(pool: PgPool, channel: &str) -> Self {
        let mut wake = Self {
            pool,
            channel: channel.to_string(),
            listener: None,
            backoff: Backoff::default(),
            retry_at: None,
        };
        wake.reconnect().await;
        wake
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    async fn reconnect(&mut self) {
        let attempt = async {
            let mut listener = PgListener::connect_with(&self.pool).await?;
            listener.listen(&self.channel).await?;
            Ok::<_, sqlx::Error>(listener)
        };
        match attempt.await {
            Ok(listener) => {
                if self.backoff.failures() > 0 {
                    tracing::info!("👂 Re-subscribed to {}", self.channel);
                } else {
                    tracing::info!("👂 Listening on {}", self.channel);
                }
                self.listener = Some(listener);
                self.backoff.reset();
                self.retry_at = None;
            }
            Err(e) => self.schedule_retry(&e.to_string()),
        }
    }

    fn schedule_retry(&mut self, reason: &str) {
        self.listener = None;
        let delay = self.backoff.next_delay();
        tracing::warn!(
            "🔌 Wake channel {} unavailable ({reason}), retrying in {:?}",
            self.channel,
            delay
        );
        self.retry_at = Some(Instant::now() + delay);
    }
}

#[async_trait]
impl WakeChannel for PgWakeChannel {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn receive(&mut self, timeout: Duration) -> Option<WakeSignal> {
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() >= deadline {
                return None;
            }

            let Some(listener) = self.listener.as_mut() else {
                if let Some(at) = self.retry_at
                    && at > Instant::now()
                {
                    sleep_until(at.min(deadline)).await;
                    continue;
                }
                let bounded = tokio::time::timeout_at(deadline, self.reconnect()).await;
                if bounded.is_err() {
                    self.schedule_retry("connect still pending at receive deadline");
                    return None;
                }
                continue;
            };

            let received = tokio::select! {
                r = listener.recv() => Some(r),
                _ = sleep_until(deadline) => None,
            };
            match received {
                None => return None,
                Some(Ok(notification)) => {
                    if let Some(signal) = decode(&self.channel, notification.payload()) {
                        return Some(signal);
                    }
                }
                Some(Err(e)) => self.schedule_retry(&e.to_string()),
            }
        }
    }
}

/// In-process fan-out hub: every subscribed channel sees every signal,
/// like every LISTEN session sees every NOTIFY.
#[derive(Clone, Default)]
pub struct LocalWakeHub {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<String>>>>,
}

impl LocalWakeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, channel: &str) -> LocalWakeChannel {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        LocalWakeChannel {
            channel: channel.to_string(),
            rx,
        }
    }

    pub fn notify(&self, signal: &WakeSignal) {
        self.notify_raw(&signal.to_payload());
    }

    /// Deliver an arbitrary payload, valid or not.
    pub fn notify_raw(&self, payload: &str) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(payload.to_string()).is_ok());
    }
}

/// Receiving side of a [`LocalWakeHub`] subscription.
pub struct LocalWakeChannel {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl WakeChannel for LocalWakeChannel {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn receive(&mut self, timeout: Duration) -> Option<WakeSignal> {
        let deadline = Instant::now() + timeout;
        loop {
            let payload = tokio::select! {
                p = self.rx.recv() => p,
                _ = sleep_until(deadline) => return None,
            };
            match payload {
                Some(payload) => {
                    if let Some(signal) = decode(&self.channel, &payload) {
                        return Some(signal);
                    }
                }
                // Hub gone: nothing more can arrive.
                None => {
                    sleep_until(deadline).await;
                    return None;
                }
            }
        }
    }
}
