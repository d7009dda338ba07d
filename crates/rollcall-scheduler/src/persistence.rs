//! PostgreSQL-backed due-item store.
//!
//! A schedule kind is a [`ScheduleTable`]: table and column names plus the
//! wake channel and event type. `PgDueStore<T>` renders its SQL once from
//! those constants; the claim runs inside a transaction held by [`PgClaim`].

use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::error::{Result, RollcallError};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::store::{DueClaim, DueStore};
use crate::tasks::ScheduleItem;

/// Schema for `notification_schedule` and `game_status_schedule`, with their
/// change-notification triggers.
pub static MIGRATOR: Migrator = sqlx::migrate!();

/// Describes one schedule kind's table.
pub trait ScheduleTable: Send + Sync + 'static {
    const KIND: &'static str;
    const TABLE: &'static str;
    const ID_COLUMN: &'static str = "id";
    const SUBJECT_COLUMN: &'static str;
    const DUE_COLUMN: &'static str;
    const PROCESSED_COLUMN: &'static str;
    /// SQL expression for `ScheduleItem::detail`, cast to text.
    const DETAIL_EXPR: &'static str = "NULL::text";
    /// Channel the table trigger notifies on.
    const WAKE_CHANNEL: &'static str;
    /// Event type published for each due row.
    const EVENT_TYPE: &'static str;
}

/// Game reminders: one row per (game, minutes-before-start).
pub struct GameReminders;

impl ScheduleTable for GameReminders {
    const KIND: &'static str = "reminders";
    const TABLE: &'static str = "notification_schedule";
    const SUBJECT_COLUMN: &'static str = "game_id";
    const DUE_COLUMN: &'static str = "notification_time";
    const PROCESSED_COLUMN: &'static str = "sent";
    const DETAIL_EXPR: &'static str = "reminder_minutes::text";
    const WAKE_CHANNEL: &'static str = "notification_schedule_changed";
    const EVENT_TYPE: &'static str = crate::events::GAME_REMINDER_DUE;
}

/// Game status transitions: one row per (game, target status).
pub struct GameStatusTransitions;

impl ScheduleTable for GameStatusTransitions {
    const KIND: &'static str = "status";
    const TABLE: &'static str = "game_status_schedule";
    const SUBJECT_COLUMN: &'static str = "game_id";
    const DUE_COLUMN: &'static str = "transition_time";
    const PROCESSED_COLUMN: &'static str = "executed";
    const DETAIL_EXPR: &'static str = "target_status";
    const WAKE_CHANNEL: &'static str = "game_status_schedule_changed";
    const EVENT_TYPE: &'static str = crate::events::GAME_STATUS_TRANSITION_DUE;
}

#[derive(Debug)]
struct Queries {
    next_due: String,
    claim_due: String,
    mark_processed: String,
}

impl Queries {
    fn for_table<T: ScheduleTable>() -> Self {
        let columns = format!(
            "{} AS id, {} AS subject_id, {} AS due_at, {} AS processed, {} AS detail",
            T::ID_COLUMN,
            T::SUBJECT_COLUMN,
            T::DUE_COLUMN,
            T::PROCESSED_COLUMN,
            T::DETAIL_EXPR
        );
        Self {
            next_due: format!(
                "SELECT {columns} FROM {table} WHERE {processed} = false AND {id} <> ALL($1) \
                 ORDER BY {due} ASC LIMIT 1",
                table = T::TABLE,
                processed = T::PROCESSED_COLUMN,
                due = T::DUE_COLUMN,
                id = T::ID_COLUMN,
            ),
            claim_due: format!(
                "SELECT {columns} FROM {table} \
                 WHERE {due} <= $1 AND {processed} = false AND {id} <> ALL($3) \
                 ORDER BY {due} ASC LIMIT $2 FOR UPDATE SKIP LOCKED",
                table = T::TABLE,
                processed = T::PROCESSED_COLUMN,
                due = T::DUE_COLUMN,
                id = T::ID_COLUMN,
            ),
            mark_processed: format!(
                "UPDATE {table} SET {processed} = true WHERE {id} = $1 AND {processed} = false",
                table = T::TABLE,
                processed = T::PROCESSED_COLUMN,
                id = T::ID_COLUMN,
            ),
        }
    }
}

/// Build a lazily-connecting pool. Only the connection string is checked
/// here; an unreachable server surfaces as store errors on first use.
/// Every session runs with `statement_timeout` so the server also gives up
/// on a stuck query.
pub fn connect_pool(
    url: &str,
    max_connections: u32,
    statement_timeout: Duration,
) -> Result<PgPool> {
    let options = PgConnectOptions::from_str(url)
        .map_err(|e| RollcallError::Config(format!("Invalid store_connection: {e}")))?
        .application_name("rollcall-scheduler")
        .options([(
            "statement_timeout",
            format!("{}ms", statement_timeout.as_millis().max(1)),
        )]);
    Ok(PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect_lazy_with(options))
}

/// Apply pending migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| RollcallError::Store(format!("Migration failed: {e}")))
}

fn store_error(kind: &str, op: &str, e: sqlx::Error) -> RollcallError {
    RollcallError::Store(format!("{kind}: {op}: {e}"))
}

/// `DueStore` over one PostgreSQL table.
pub struct PgDueStore<T: ScheduleTable> {
    pool: PgPool,
    queries: Arc<Queries>,
    _table: PhantomData<T>,
}

impl<T: ScheduleTable> PgDueStore<T> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            queries: Arc::new(Queries::for_table::<T>()),
            _table: PhantomData,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl<T: ScheduleTable> DueStore for PgDueStore<T> {
    type Claim = PgClaim;

    fn kind(&self) -> &str {
        T::KIND
    }

    async fn next_due_excluding(&self, exclude: &[Uuid]) -> Result<Option<ScheduleItem>> {
        sqlx::query_as::<_, ScheduleItem>(&self.queries.next_due)
            .bind(exclude.to_vec())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error(T::KIND, "next_due", e))
    }

    async fn claim_due_excluding(
        &self,
        now: DateTime<Utc>,
        batch_limit: u32,
        exclude: &[Uuid],
    ) -> Result<PgClaim> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error(T::KIND, "begin", e))?;
        let items = sqlx::query_as::<_, ScheduleItem>(&self.queries.claim_due)
            .bind(now)
            .bind(i64::from(batch_limit))
            .bind(exclude.to_vec())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| store_error(T::KIND, "claim_due", e))?;

        Ok(PgClaim {
            kind: T::KIND,
            tx,
            items,
            queries: self.queries.clone(),
        })
    }

    async fn mark_processed(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(&self.queries.mark_processed)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error(T::KIND, "mark_processed", e))?;
        Ok(result.rows_affected() > 0)
    }
}

/// Rows locked by `SELECT ... FOR UPDATE SKIP LOCKED`. Dropping the
/// transaction without commit rolls it back.
pub struct PgClaim {
    kind: &'static str,
    tx: Transaction<'static, Postgres>,
    items: Vec<ScheduleItem>,
    queries: Arc<Queries>,
}

#[async_trait]
impl DueClaim for PgClaim {
    fn items(&self) -> &[ScheduleItem] {
        &self.items
    }

    async fn mark_processed(&mut self, id: Uuid) -> Result<()> {
        sqlx::query(&self.queries.mark_processed)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| store_error(self.kind, "mark_processed", e))?;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| store_error(self.kind, "commit", e))
    }
}
