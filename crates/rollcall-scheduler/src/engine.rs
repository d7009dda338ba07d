//! Scheduler daemon: the IDLE → WAITING → CLAIMING → PUBLISHING loop.
//!
//! Every sleep is bounded by `max_wait`, so missed wake signals cost latency
//! and never correctness. A row is only marked processed after its event
//! was confirmed by the broker, inside the same claim that locked it.
//!
//! A row whose event cannot be built or published is held back with its own
//! backoff, so a run of bad rows at the head of the table never keeps the
//! rows behind them from being claimed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rollcall_broker::Publisher;
use rollcall_core::backoff::Backoff;
use rollcall_core::config::SchedulerConfig;
use rollcall_core::error::{Result, RollcallError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::events::EventBuilder;
use crate::notify::WakeChannel;
use crate::store::{DueClaim, DueStore};
use crate::tasks::ScheduleItem;

/// Poll delay when the earliest row is overdue yet nothing could be
/// claimed, i.e. another replica holds it.
const CONTENDED_POLL: Duration = Duration::from_millis(250);

/// First hold-back after a row fails; doubles up to `max_wait`.
const ROW_RETRY_INITIAL: Duration = Duration::from_secs(1);

/// Loop tuning.
#[derive(Debug, Clone, Copy)]
pub struct DaemonSettings {
    pub max_wait: Duration,
    pub batch_limit: u32,
    /// Claim rows this long before they are due.
    pub lead_buffer: Duration,
    pub publish_timeout: Duration,
    /// Bound on each store call: claim, mark, commit, next_due.
    pub store_timeout: Duration,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(900),
            batch_limit: 100,
            lead_buffer: Duration::ZERO,
            publish_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&SchedulerConfig> for DaemonSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_wait: config.max_wait(),
            batch_limit: config.batch_limit,
            lead_buffer: config.lead_buffer(),
            publish_timeout: config.publish_timeout(),
            store_timeout: config.store_timeout(),
        }
    }
}

/// Lifetime counters, readable while the daemon runs.
#[derive(Debug, Default)]
pub struct DaemonStats {
    pub cycles: AtomicU64,
    pub claimed: AtomicU64,
    pub published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub store_errors: AtomicU64,
    pub wakes_by_signal: AtomicU64,
    pub wakes_by_timeout: AtomicU64,
}

impl DaemonStats {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Outcome of one claim-and-publish pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    /// Published, marked, and committed.
    pub published: usize,
    /// Build or publish failed; row left unprocessed and held back.
    pub failed: usize,
    pub store_error: bool,
}

#[derive(Debug, Clone, Copy)]
enum WakeCause {
    Startup,
    Signal,
    Timeout,
}

/// How long to sleep before the next claim.
///
/// `max_wait` with no pending rows, zero for overdue rows, otherwise the
/// time until `due_at - lead_buffer`, never more than `max_wait`.
pub fn wait_bound(
    next_due: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lead_buffer: Duration,
    max_wait: Duration,
) -> Duration {
    let Some(due_at) = next_due else {
        return max_wait;
    };
    let until_due = (due_at - now).to_std().unwrap_or(Duration::ZERO);
    until_due.saturating_sub(lead_buffer).min(max_wait)
}

async fn bounded<T>(
    limit: Duration,
    kind: &str,
    op: &str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, call).await.map_err(|_| {
        RollcallError::Store(format!("{kind}: {op} timed out after {limit:?}"))
    })?
}

/// A failed row's place in its own retry sequence.
#[derive(Debug)]
struct HeldBack {
    backoff: Backoff,
    retry_at: Instant,
}

/// One schedule kind's daemon.
pub struct SchedulerDaemon<S: DueStore, W: WakeChannel> {
    store: S,
    wake: W,
    publisher: Arc<dyn Publisher>,
    builder: Box<dyn EventBuilder>,
    settings: DaemonSettings,
    stats: Arc<DaemonStats>,
    store_backoff: Backoff,
    held_back: HashMap<Uuid, HeldBack>,
}

impl<S: DueStore, W: WakeChannel> SchedulerDaemon<S, W> {
    pub fn new(
        store: S,
        wake: W,
        publisher: Arc<dyn Publisher>,
        builder: impl EventBuilder + 'static,
        settings: DaemonSettings,
    ) -> Self {
        Self {
            store,
            wake,
            publisher,
            builder: Box::new(builder),
            settings,
            stats: Arc::new(DaemonStats::default()),
            store_backoff: Backoff::default(),
            held_back: HashMap::new(),
        }
    }

    pub fn stats(&self) -> Arc<DaemonStats> {
        self.stats.clone()
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    /// Run until `cancel` fires. An in-flight batch always finishes (each
    /// store call is bounded by `store_timeout`); planning the next wait and
    /// the wait itself are interrupted.
    pub async fn run(mut self, cancel: CancellationToken) {
        let span = tracing::info_span!(
            "scheduler",
            kind = %self.store.kind(),
            channel = %self.wake.channel()
        );
        async move {
            tracing::info!(
                "⏰ Scheduler daemon started (max_wait={}s, batch_limit={}, lead={}ms)",
                self.settings.max_wait.as_secs(),
                self.settings.batch_limit,
                self.settings.lead_buffer.as_millis()
            );
            let mut cause = WakeCause::Startup;

            loop {
                tracing::debug!(?cause, "claiming due items");
                let report = self.process_due().await;
                if cancel.is_cancelled() {
                    break;
                }

                let wait = tokio::select! {
                    _ = cancel.cancelled() => break,
                    wait = self.next_wait(&report) => wait,
                };
                tracing::debug!("💤 Waiting up to {:?}", wait);
                cause = tokio::select! {
                    _ = cancel.cancelled() => break,
                    signal = self.wake.receive(wait) => match signal {
                        Some(signal) => {
                            DaemonStats::bump(&self.stats.wakes_by_signal, 1);
                            tracing::debug!(
                                "🔔 Woken by {:?} on {}",
                                signal.operation,
                                signal.subject_id
                            );
                            WakeCause::Signal
                        }
                        None => {
                            DaemonStats::bump(&self.stats.wakes_by_timeout, 1);
                            WakeCause::Timeout
                        }
                    },
                };
            }

            tracing::info!(
                "⏹️ Scheduler daemon stopped (published={}, publish_failures={}, store_errors={})",
                self.stats.published.load(Ordering::Relaxed),
                self.stats.publish_failures.load(Ordering::Relaxed),
                self.stats.store_errors.load(Ordering::Relaxed)
            );
        }
        .instrument(span)
        .await
    }

    /// Claim every row due by `now + lead_buffer` (up to `batch_limit`),
    /// publish each, mark the published ones, and commit. Rows still held
    /// back after an earlier failure are left for a later cycle.
    pub async fn process_due(&mut self) -> CycleReport {
        DaemonStats::bump(&self.stats.cycles, 1);
        let mut report = CycleReport::default();
        let lead = chrono::Duration::from_std(self.settings.lead_buffer)
            .unwrap_or(chrono::Duration::zero());
        let cutoff = Utc::now() + lead;
        let limit = self.settings.store_timeout;
        let kind = self.store.kind().to_string();
        let exclude = self.held_back_ids();

        let claim = bounded(
            limit,
            &kind,
            "claim_due",
            self.store.claim_due_excluding(cutoff, self.settings.batch_limit, &exclude),
        )
        .await;
        let mut claim = match claim {
            Ok(claim) => claim,
            Err(e) => {
                DaemonStats::bump(&self.stats.store_errors, 1);
                tracing::warn!("⚠️ Claim failed: {e}");
                report.store_error = true;
                return report;
            }
        };
        let items: Vec<ScheduleItem> = claim.items().to_vec();
        report.claimed = items.len();
        DaemonStats::bump(&self.stats.claimed, items.len() as u64);

        let mut marked = Vec::with_capacity(items.len());
        for item in &items {
            if let Err(e) = self.publish_item(item).await {
                report.failed += 1;
                DaemonStats::bump(&self.stats.publish_failures, 1);
                let delay = self.hold_back(item.id);
                tracing::warn!(
                    "⚠️ Row {} (subject {}) not published, retrying in {delay:?}: {e}",
                    item.id,
                    item.subject_id
                );
                continue;
            }
            let mark = claim.mark_processed(item.id);
            if let Err(e) = bounded(limit, &kind, "mark_processed", mark).await {
                DaemonStats::bump(&self.stats.store_errors, 1);
                tracing::error!(
                    "❌ Marking row {} failed, rolling back batch of {}: {e}",
                    item.id,
                    items.len()
                );
                report.store_error = true;
                return report;
            }
            marked.push(item.id);
        }

        if let Err(e) = bounded(limit, &kind, "commit", claim.commit()).await {
            DaemonStats::bump(&self.stats.store_errors, 1);
            tracing::error!(
                "❌ Commit failed; {} published row(s) will be published again: {e}",
                marked.len()
            );
            report.store_error = true;
            return report;
        }

        for id in &marked {
            self.held_back.remove(id);
        }
        let now = Instant::now();
        self.held_back.retain(|_, held| held.retry_at > now);

        report.published = marked.len();
        DaemonStats::bump(&self.stats.published, marked.len() as u64);
        if report.claimed > 0 {
            tracing::info!(
                "📤 Published {}/{} due item(s)",
                report.published,
                report.claimed
            );
        }
        report
    }

    /// Rows excluded from claims until their retry time.
    fn held_back_ids(&self) -> Vec<Uuid> {
        let now = Instant::now();
        self.held_back
            .iter()
            .filter(|(_, held)| held.retry_at > now)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Push a failed row's next attempt back; returns the delay.
    fn hold_back(&mut self, id: Uuid) -> Duration {
        let max_wait = self.settings.max_wait;
        let held = self.held_back.entry(id).or_insert_with(|| HeldBack {
            backoff: Backoff::new(ROW_RETRY_INITIAL, max_wait),
            retry_at: Instant::now(),
        });
        let delay = held.backoff.next_delay();
        held.retry_at = Instant::now() + delay;
        delay
    }

    async fn publish_item(&self, item: &ScheduleItem) -> Result<()> {
        let event = self.builder.build(item)?;
        tokio::time::timeout(self.settings.publish_timeout, self.publisher.publish_event(&event))
            .await
            .map_err(|_| {
                RollcallError::Broker(format!(
                    "Publishing {} timed out after {:?}",
                    event.event_type, self.settings.publish_timeout
                ))
            })?
    }

    /// Wait before the next claim, from the earliest pending row that is
    /// not held back, and never past the first held-back row's retry time.
    /// Store errors impose a backoff instead.
    async fn next_wait(&mut self, report: &CycleReport) -> Duration {
        let max_wait = self.settings.max_wait;
        if report.store_error {
            return self.store_backoff.next_delay().min(max_wait);
        }

        let exclude = self.held_back_ids();
        let next = bounded(
            self.settings.store_timeout,
            self.store.kind(),
            "next_due",
            self.store.next_due_excluding(&exclude),
        )
        .await;
        let next = match next {
            Ok(next) => {
                self.store_backoff.reset();
                next
            }
            Err(e) => {
                DaemonStats::bump(&self.stats.store_errors, 1);
                tracing::warn!("⚠️ next_due failed: {e}");
                return self.store_backoff.next_delay().min(max_wait);
            }
        };

        let mut wait = wait_bound(
            next.map(|item| item.due_at),
            Utc::now(),
            self.settings.lead_buffer,
            max_wait,
        );
        if wait.is_zero() && report.claimed == 0 {
            wait = CONTENDED_POLL.min(max_wait);
        }
        if let Some(retry_at) = self.held_back.values().map(|held| held.retry_at).min() {
            wait = wait.min(retry_at.saturating_duration_since(Instant::now()));
        }
        wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ReminderEventBuilder;
    use crate::memory::InMemoryDueStore;
    use crate::notify::{LocalWakeChannel, LocalWakeHub};
    use crate::tasks::{WakeOperation, WakeSignal};
    use crate::memory::MemoryClaim;
    use rollcall_broker::InMemoryBroker;
    use std::collections::HashSet;

    /// Shares an in-memory table but never answers the stalled calls.
    #[derive(Clone)]
    struct StallingStore {
        inner: InMemoryDueStore,
        stall_next_due: bool,
        stall_claim: bool,
    }

    #[async_trait::async_trait]
    impl DueStore for StallingStore {
        type Claim = MemoryClaim;

        fn kind(&self) -> &str {
            self.inner.kind()
        }

        async fn next_due_excluding(&self, exclude: &[Uuid]) -> Result<Option<ScheduleItem>> {
            if self.stall_next_due {
                std::future::pending::<()>().await;
            }
            self.inner.next_due_excluding(exclude).await
        }

        async fn claim_due_excluding(
            &self,
            now: DateTime<Utc>,
            batch_limit: u32,
            exclude: &[Uuid],
        ) -> Result<MemoryClaim> {
            if self.stall_claim {
                std::future::pending::<()>().await;
            }
            self.inner.claim_due_excluding(now, batch_limit, exclude).await
        }

        async fn mark_processed(&self, id: Uuid) -> Result<bool> {
            self.inner.mark_processed(id).await
        }
    }

    fn stalling_daemon(
        store: StallingStore,
        hub: &LocalWakeHub,
        broker: &Arc<InMemoryBroker>,
        settings: DaemonSettings,
    ) -> SchedulerDaemon<StallingStore, LocalWakeChannel> {
        SchedulerDaemon::new(
            store,
            hub.subscribe("notification_schedule_changed"),
            broker.clone(),
            ReminderEventBuilder,
            settings,
        )
    }

    fn settings(max_wait: Duration) -> DaemonSettings {
        DaemonSettings {
            max_wait,
            batch_limit: 100,
            lead_buffer: Duration::ZERO,
            publish_timeout: Duration::from_secs(2),
            store_timeout: Duration::from_secs(2),
        }
    }

    fn broker() -> Arc<InMemoryBroker> {
        let broker = Arc::new(InMemoryBroker::new("game_scheduler", ".dlq"));
        broker.bind("bot_events", "game.reminder_due");
        broker
    }

    fn reminder(offset_ms: i64) -> ScheduleItem {
        ScheduleItem::new(
            Uuid::new_v4(),
            Utc::now() + chrono::Duration::milliseconds(offset_ms),
        )
        .with_detail("60")
    }

    fn daemon(
        store: &InMemoryDueStore,
        hub: &LocalWakeHub,
        broker: &Arc<InMemoryBroker>,
        settings: DaemonSettings,
    ) -> SchedulerDaemon<InMemoryDueStore, LocalWakeChannel> {
        SchedulerDaemon::new(
            store.clone(),
            hub.subscribe("notification_schedule_changed"),
            broker.clone(),
            ReminderEventBuilder,
            settings,
        )
    }

    async fn eventually(within: Duration, check: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    fn published_schedule_ids(broker: &InMemoryBroker) -> Vec<String> {
        broker
            .published()
            .iter()
            .map(|m| {
                let value: serde_json::Value = serde_json::from_slice(&m.body).unwrap();
                value["payload"]["schedule_id"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[test]
    fn test_wait_bound_without_rows_is_max_wait() {
        let max = Duration::from_secs(900);
        assert_eq!(wait_bound(None, Utc::now(), Duration::ZERO, max), max);
    }

    #[test]
    fn test_wait_bound_overdue_is_zero() {
        let now = Utc::now();
        let due = now - chrono::Duration::seconds(30);
        assert_eq!(
            wait_bound(Some(due), now, Duration::ZERO, Duration::from_secs(900)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_wait_bound_is_clamped_and_lead_adjusted() {
        let now = Utc::now();
        let max = Duration::from_secs(900);
        let in_ten = now + chrono::Duration::seconds(10);
        assert_eq!(wait_bound(Some(in_ten), now, Duration::ZERO, max), Duration::from_secs(10));
        assert_eq!(
            wait_bound(Some(in_ten), now, Duration::from_secs(4), max),
            Duration::from_secs(6)
        );
        assert_eq!(
            wait_bound(Some(in_ten), now, Duration::from_secs(20), max),
            Duration::ZERO
        );
        let in_a_day = now + chrono::Duration::days(1);
        assert_eq!(wait_bound(Some(in_a_day), now, Duration::ZERO, max), max);
    }

    #[test]
    fn test_settings_from_config() {
        let config = SchedulerConfig::default();
        let settings = DaemonSettings::from(&config);
        assert_eq!(settings.max_wait, Duration::from_secs(900));
        assert_eq!(settings.batch_limit, 100);
        assert_eq!(settings.store_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_process_due_publishes_and_marks() {
        let (store, hub, broker) = (InMemoryDueStore::new("reminders"), LocalWakeHub::new(), broker());
        let due = store.insert(reminder(-1_000));
        let later = store.insert(reminder(60_000));
        let mut daemon = daemon(&store, &hub, &broker, settings(Duration::from_secs(5)));

        let report = daemon.process_due().await;
        assert_eq!(report, CycleReport { claimed: 1, published: 1, failed: 0, store_error: false });
        assert!(store.get(due).unwrap().processed);
        assert!(!store.get(later).unwrap().processed);
        assert_eq!(broker.queue_depth("bot_events"), 1);
        assert_eq!(published_schedule_ids(&broker), vec![due.to_string()]);

        assert_eq!(daemon.process_due().await.claimed, 0);
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_is_retried_after_hold_back() {
        let (store, hub, broker) = (InMemoryDueStore::new("reminders"), LocalWakeHub::new(), broker());
        let id = store.insert(reminder(-1_000));
        let mut daemon = daemon(&store, &hub, &broker, settings(Duration::from_secs(5)));
        broker.fail_next_publishes(1);

        let report = daemon.process_due().await;
        assert_eq!(report.failed, 1);
        assert!(!store.get(id).unwrap().processed);
        assert_eq!(store.locked_count(), 0);

        // Still held back.
        assert_eq!(daemon.process_due().await.claimed, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        let report = daemon.process_due().await;
        assert_eq!(report.published, 1);
        assert!(store.get(id).unwrap().processed);
        assert_eq!(broker.published().len(), 1);
        assert_eq!(daemon.stats().publish_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_row_sets_next_wait() {
        let (store, hub, broker) = (InMemoryDueStore::new("reminders"), LocalWakeHub::new(), broker());
        store.insert(reminder(-1_000));
        let mut daemon = daemon(&store, &hub, &broker, settings(Duration::from_secs(30)));
        broker.fail_next_publishes(1);

        let report = daemon.process_due().await;
        let wait = daemon.next_wait(&report).await;
        assert!(wait >= Duration::from_secs(1), "wait was {wait:?}");
        assert!(wait <= Duration::from_millis(1_100), "wait was {wait:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_rows_do_not_starve_later_rows() {
        let (store, hub, broker) = (InMemoryDueStore::new("reminders"), LocalWakeHub::new(), broker());
        // No detail: the reminder builder rejects both.
        let broken = [10, 9].map(|minutes| {
            let due_at = Utc::now() - chrono::Duration::minutes(minutes);
            store.insert(ScheduleItem::new(Uuid::new_v4(), due_at))
        });
        let good = store.insert(reminder(-1_000));
        let mut settings = settings(Duration::from_secs(30));
        settings.batch_limit = 2;
        let mut daemon = daemon(&store, &hub, &broker, settings);

        let first = daemon.process_due().await;
        assert_eq!((first.claimed, first.failed), (2, 2));

        let second = daemon.process_due().await;
        assert_eq!(second.published, 1);
        assert!(store.get(good).unwrap().processed);
        assert_eq!(published_schedule_ids(&broker), vec![good.to_string()]);

        // Only the broken rows remain, and only their retry time is waited on.
        let wait = daemon.next_wait(&second).await;
        assert!(wait <= Duration::from_millis(1_100), "wait was {wait:?}");

        tokio::time::advance(Duration::from_secs(2)).await;
        let third = daemon.process_due().await;
        assert_eq!((third.claimed, third.failed), (2, 2));
        assert!(broken.iter().all(|id| !store.get(*id).unwrap().processed));

        // Second failure doubles the hold-back.
        let wait = daemon.next_wait(&third).await;
        assert!(wait >= Duration::from_secs(2), "wait was {wait:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_claim_times_out_as_store_error() {
        let (hub, broker) = (LocalWakeHub::new(), broker());
        let store = StallingStore {
            inner: InMemoryDueStore::new("reminders"),
            stall_next_due: false,
            stall_claim: true,
        };
        store.inner.insert(reminder(-1_000));
        let mut daemon = stalling_daemon(store, &hub, &broker, settings(Duration::from_secs(30)));

        let started = Instant::now();
        let report = daemon.process_due().await;
        assert!(report.store_error);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(daemon.stats().store_errors.load(Ordering::Relaxed), 1);
        assert!(broker.published().is_empty());
        assert!(daemon.next_wait(&report).await >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_next_due_falls_back_to_store_backoff() {
        let (hub, broker) = (LocalWakeHub::new(), broker());
        let store = StallingStore {
            inner: InMemoryDueStore::new("reminders"),
            stall_next_due: true,
            stall_claim: false,
        };
        let mut daemon = stalling_daemon(store, &hub, &broker, settings(Duration::from_secs(30)));

        let report = daemon.process_due().await;
        assert!(!report.store_error);
        let wait = daemon.next_wait(&report).await;
        assert!(wait >= Duration::from_secs(1) && wait < Duration::from_secs(30));
        assert_eq!(daemon.stats().store_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_stalled_store() {
        let (hub, broker) = (LocalWakeHub::new(), broker());
        let store = StallingStore {
            inner: InMemoryDueStore::new("reminders"),
            stall_next_due: true,
            stall_claim: false,
        };
        let mut settings = settings(Duration::from_secs(1));
        settings.store_timeout = Duration::from_secs(600);
        let daemon = stalling_daemon(store, &hub, &broker, settings);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("daemon did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_bad_row_does_not_block_batch() {
        let (store, hub, broker) = (InMemoryDueStore::new("reminders"), LocalWakeHub::new(), broker());
        let broken = store.insert(ScheduleItem::new(Uuid::new_v4(), Utc::now()));
        let good = store.insert(reminder(-500));
        let mut daemon = daemon(&store, &hub, &broker, settings(Duration::from_secs(5)));

        let report = daemon.process_due().await;
        assert_eq!(report.claimed, 2);
        assert_eq!(report.published, 1);
        assert_eq!(report.failed, 1);
        assert!(store.get(good).unwrap().processed);
        assert!(!store.get(broken).unwrap().processed);
    }

    #[tokio::test]
    async fn test_store_outage_backs_off_then_recovers() {
        let (store, hub, broker) = (InMemoryDueStore::new("reminders"), LocalWakeHub::new(), broker());
        let id = store.insert(reminder(-1_000));
        let mut daemon = daemon(&store, &hub, &broker, settings(Duration::from_secs(30)));

        store.set_unavailable(true);
        let report = daemon.process_due().await;
        assert!(report.store_error);
        let first = daemon.next_wait(&report).await;
        let second = daemon.next_wait(&report).await;
        assert!(first >= Duration::from_secs(1));
        assert!(second > first);
        assert!(broker.published().is_empty());

        store.set_unavailable(false);
        assert_eq!(daemon.process_due().await.published, 1);
        assert!(store.get(id).unwrap().processed);
    }

    #[tokio::test]
    async fn test_lead_buffer_claims_early() {
        let (store, hub, broker) = (InMemoryDueStore::new("reminders"), LocalWakeHub::new(), broker());
        let id = store.insert(reminder(500));
        let mut settings = settings(Duration::from_secs(5));
        settings.lead_buffer = Duration::from_secs(2);
        let mut daemon = daemon(&store, &hub, &broker, settings);

        assert_eq!(daemon.process_due().await.published, 1);
        assert!(store.get(id).unwrap().processed);
    }

    #[tokio::test]
    async fn test_batch_limit_caps_a_cycle() {
        let (store, hub, broker) = (InMemoryDueStore::new("reminders"), LocalWakeHub::new(), broker());
        for i in 0..5 {
            store.insert(reminder(-1_000 - i));
        }
        let mut settings = settings(Duration::from_secs(5));
        settings.batch_limit = 2;
        let mut daemon = daemon(&store, &hub, &broker, settings);

        let report = daemon.process_due().await;
        assert_eq!(report.published, 2);
        assert_eq!(daemon.next_wait(&report).await, Duration::ZERO);
        assert_eq!(store.unprocessed_count(), 3);
    }

    #[tokio::test]
    async fn test_cold_start_processes_overdue_rows() {
        let (store, hub, broker) = (InMemoryDueStore::new("reminders"), LocalWakeHub::new(), broker());
        for _ in 0..3 {
            store.insert(reminder(-3_600_000));
        }
        let daemon = daemon(&store, &hub, &broker, settings(Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(cancel.clone()));

        assert!(eventually(Duration::from_secs(1), || store.unprocessed_count() == 0).await);
        assert_eq!(broker.published().len(), 3);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_signal_preempts_long_wait() {
        let (store, hub, broker) = (InMemoryDueStore::new("reminders"), LocalWakeHub::new(), broker());
        let far = store.insert(reminder(10_000));
        let daemon = daemon(&store, &hub, &broker, settings(Duration::from_secs(60)));
        let stats = daemon.stats();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(cancel.clone()));

        // Let the daemon settle into its 10s wait.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let near = reminder(300);
        let near_id = store.insert(near.clone());
        hub.notify(&WakeSignal {
            operation: WakeOperation::Insert,
            subject_id: near.subject_id.to_string(),
            due_at: Some(near.due_at),
        });

        assert!(eventually(Duration::from_secs(2), || store.get(near_id).unwrap().processed).await);
        assert!(!store.get(far).unwrap().processed);
        assert!(stats.wakes_by_signal.load(Ordering::Relaxed) >= 1);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_covers_lost_signal() {
        let (store, hub, broker) = (InMemoryDueStore::new("reminders"), LocalWakeHub::new(), broker());
        let daemon = daemon(&store, &hub, &broker, settings(Duration::from_millis(300)));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Inserted without a notification.
        let id = store.insert(reminder(100));

        assert!(eventually(Duration::from_secs(2), || store.get(id).unwrap().processed).await);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let (store, hub, broker) = (InMemoryDueStore::new("reminders"), LocalWakeHub::new(), broker());
        store.insert(reminder(3_600_000));
        let daemon = daemon(&store, &hub, &broker, settings(Duration::from_secs(900)));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("daemon did not stop")
            .unwrap();
        assert!(broker.published().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_replicas_never_double_publish() {
        const ROWS: usize = 200;
        let (store, hub, broker) = (InMemoryDueStore::new("reminders"), LocalWakeHub::new(), broker());
        for i in 0..ROWS {
            store.insert(reminder(-10_000 - i as i64));
        }

        let mut settings = settings(Duration::from_secs(5));
        settings.batch_limit = 7;
        let replicas: Vec<_> = (0..4)
            .map(|_| {
                let mut daemon = daemon(&store, &hub, &broker, settings);
                let store = store.clone();
                tokio::spawn(async move {
                    let mut published = 0;
                    while store.unprocessed_count() > 0 {
                        let report = daemon.process_due().await;
                        published += report.published;
                        if report.claimed == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                    published
                })
            })
            .collect();

        let per_replica: Vec<usize> = futures::future::join_all(replicas)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(per_replica.iter().sum::<usize>(), ROWS);
        let ids = published_schedule_ids(&broker);
        assert_eq!(ids.len(), ROWS);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), ROWS);
        assert_eq!(store.locked_count(), 0);
    }
}
