//! Due-item store seam.
//!
//! One implementation per backing store, one instance per schedule kind.
//! The daemon only ever sees these three operations, in their `_excluding`
//! form so rows it is holding back after a failure do not starve the rest.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::error::Result;
use uuid::Uuid;

use crate::tasks::ScheduleItem;

/// Query triple over one schedule kind's table.
#[async_trait]
pub trait DueStore: Send + Sync {
    type Claim: DueClaim;

    /// Schedule kind name, for logs.
    fn kind(&self) -> &str;

    /// Earliest unprocessed item, due or not, ignoring `exclude`.
    async fn next_due_excluding(&self, exclude: &[Uuid]) -> Result<Option<ScheduleItem>>;

    /// Lock up to `batch_limit` unprocessed items with `due_at <= now`,
    /// skipping rows another claim already holds and any id in `exclude`.
    async fn claim_due_excluding(
        &self,
        now: DateTime<Utc>,
        batch_limit: u32,
        exclude: &[Uuid],
    ) -> Result<Self::Claim>;

    /// Earliest unprocessed item, due or not.
    async fn next_due(&self) -> Result<Option<ScheduleItem>> {
        self.next_due_excluding(&[]).await
    }

    /// Lock up to `batch_limit` unprocessed items with `due_at <= now`,
    /// skipping rows another claim already holds.
    async fn claim_due(&self, now: DateTime<Utc>, batch_limit: u32) -> Result<Self::Claim> {
        self.claim_due_excluding(now, batch_limit, &[]).await
    }

    /// Mark one item processed outside any claim. Returns `false` when it
    /// was already processed or does not exist; never an error for that.
    async fn mark_processed(&self, id: Uuid) -> Result<bool>;
}

/// Rows locked by one `claim_due` call.
///
/// Marks only take effect on [`DueClaim::commit`]. Dropping an uncommitted
/// claim releases every lock and discards its marks.
#[async_trait]
pub trait DueClaim: Send {
    fn items(&self) -> &[ScheduleItem];

    /// Mark a claimed item processed within this claim.
    async fn mark_processed(&mut self, id: Uuid) -> Result<()>;

    /// Persist marks and release the locks.
    async fn commit(self) -> Result<()>;
}
