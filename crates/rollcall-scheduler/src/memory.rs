//! In-process due-item store with skip-locked claim semantics.
//!
//! Clones share one table, so several daemons can race on the same rows the
//! way replicas race on a PostgreSQL table.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::error::{Result, RollcallError};
use uuid::Uuid;

use crate::store::{DueClaim, DueStore};
use crate::tasks::ScheduleItem;

#[derive(Default)]
struct MemoryTable {
    rows: Vec<ScheduleItem>,
    locked: HashSet<Uuid>,
    unavailable: bool,
}

/// Shared in-memory table for one schedule kind.
#[derive(Clone)]
pub struct InMemoryDueStore {
    kind: String,
    table: Arc<Mutex<MemoryTable>>,
}

impl InMemoryDueStore {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            table: Arc::new(Mutex::new(MemoryTable::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn available(&self) -> Result<MutexGuard<'_, MemoryTable>> {
        let table = self.lock();
        if table.unavailable {
            return Err(RollcallError::Store(format!("{}: store unavailable", self.kind)));
        }
        Ok(table)
    }

    pub fn insert(&self, item: ScheduleItem) -> Uuid {
        let id = item.id;
        self.lock().rows.push(item);
        id
    }

    /// Move an item's due time, as an application update would.
    pub fn reschedule(&self, id: Uuid, due_at: DateTime<Utc>) -> bool {
        let mut table = self.lock();
        match table.rows.iter_mut().find(|r| r.id == id) {
            Some(row) => {
                row.due_at = due_at;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let mut table = self.lock();
        let before = table.rows.len();
        table.rows.retain(|r| r.id != id);
        table.rows.len() != before
    }

    pub fn get(&self, id: Uuid) -> Option<ScheduleItem> {
        self.lock().rows.iter().find(|r| r.id == id).cloned()
    }

    pub fn unprocessed_count(&self) -> usize {
        self.lock().rows.iter().filter(|r| !r.processed).count()
    }

    pub fn locked_count(&self) -> usize {
        self.lock().locked.len()
    }

    /// Make every operation fail with a store error until re-enabled.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }
}

#[async_trait]
impl DueStore for InMemoryDueStore {
    type Claim = MemoryClaim;

    fn kind(&self) -> &str {
        &self.kind
    }

    async fn next_due_excluding(&self, exclude: &[Uuid]) -> Result<Option<ScheduleItem>> {
        let table = self.available()?;
        Ok(table
            .rows
            .iter()
            .filter(|r| !r.processed && !exclude.contains(&r.id))
            .min_by_key(|r| r.due_at)
            .cloned())
    }

    async fn claim_due_excluding(
        &self,
        now: DateTime<Utc>,
        batch_limit: u32,
        exclude: &[Uuid],
    ) -> Result<MemoryClaim> {
        let mut table = self.available()?;
        let mut items: Vec<ScheduleItem> = table
            .rows
            .iter()
            .filter(|r| r.is_due(now) && !table.locked.contains(&r.id) && !exclude.contains(&r.id))
            .cloned()
            .collect();
        items.sort_by_key(|r| r.due_at);
        items.truncate(batch_limit as usize);
        for item in &items {
            table.locked.insert(item.id);
        }

        Ok(MemoryClaim {
            table: self.table.clone(),
            items,
            marked: Vec::new(),
            finished: false,
        })
    }

    async fn mark_processed(&self, id: Uuid) -> Result<bool> {
        let mut table = self.available()?;
        match table.rows.iter_mut().find(|r| r.id == id && !r.processed) {
            Some(row) => {
                row.processed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Locks held in the shared table until commit or drop.
pub struct MemoryClaim {
    table: Arc<Mutex<MemoryTable>>,
    items: Vec<ScheduleItem>,
    marked: Vec<Uuid>,
    finished: bool,
}

impl MemoryClaim {
    fn release(&mut self, apply_marks: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if apply_marks {
            for row in table.rows.iter_mut().filter(|r| self.marked.contains(&r.id)) {
                row.processed = true;
            }
        }
        for item in &self.items {
            table.locked.remove(&item.id);
        }
    }
}

#[async_trait]
impl DueClaim for MemoryClaim {
    fn items(&self) -> &[ScheduleItem] {
        &self.items
    }

    async fn mark_processed(&mut self, id: Uuid) -> Result<()> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if table.unavailable {
            return Err(RollcallError::Store("store unavailable".into()));
        }
        drop(table);
        if !self.items.iter().any(|i| i.id == id) {
            return Err(RollcallError::Store(format!("Item {id} is not part of this claim")));
        }
        self.marked.push(id);
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        let unavailable = self.table.lock().unwrap_or_else(|e| e.into_inner()).unavailable;
        if unavailable {
            self.release(false);
            return Err(RollcallError::Store("store unavailable".into()));
        }
        self.release(true);
        Ok(())
    }
}

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        self.release(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn due_item(offset_secs: i64) -> ScheduleItem {
        ScheduleItem::new(Uuid::new_v4(), Utc::now() + Duration::seconds(offset_secs))
    }

    #[tokio::test]
    async fn test_next_due_is_earliest_unprocessed() {
        let store = InMemoryDueStore::new("reminders");
        assert!(store.next_due().await.unwrap().is_none());

        store.insert(due_item(30));
        let early = store.insert(due_item(5));
        assert_eq!(store.next_due().await.unwrap().unwrap().id, early);

        store.mark_processed(early).await.unwrap();
        assert_ne!(store.next_due().await.unwrap().unwrap().id, early);
    }

    #[tokio::test]
    async fn test_claim_skips_locked_rows() {
        let store = InMemoryDueStore::new("reminders");
        for _ in 0..3 {
            store.insert(due_item(-5));
        }
        store.insert(due_item(60));

        let first = store.claim_due(Utc::now(), 2).await.unwrap();
        let second = store.claim_due(Utc::now(), 10).await.unwrap();
        assert_eq!(first.items().len(), 2);
        assert_eq!(second.items().len(), 1);
        assert!(!first.items().iter().any(|a| second.items().iter().any(|b| a.id == b.id)));
        assert_eq!(store.locked_count(), 3);
    }

    #[tokio::test]
    async fn test_claim_orders_by_due_time() {
        let store = InMemoryDueStore::new("status");
        store.insert(due_item(-1));
        let oldest = store.insert(due_item(-100));
        let claim = store.claim_due(Utc::now(), 1).await.unwrap();
        assert_eq!(claim.items()[0].id, oldest);
    }

    #[tokio::test]
    async fn test_excluded_rows_are_neither_next_nor_claimed() {
        let store = InMemoryDueStore::new("reminders");
        let oldest = store.insert(due_item(-30));
        let other = store.insert(due_item(-10));

        assert_eq!(store.next_due_excluding(&[oldest]).await.unwrap().unwrap().id, other);
        let claim = store.claim_due_excluding(Utc::now(), 1, &[oldest]).await.unwrap();
        assert_eq!(claim.items().len(), 1);
        assert_eq!(claim.items()[0].id, other);
        drop(claim);
        assert_eq!(store.claim_due(Utc::now(), 1).await.unwrap().items()[0].id, oldest);
    }

    #[tokio::test]
    async fn test_commit_applies_marks_and_drop_discards_them() {
        let store = InMemoryDueStore::new("reminders");
        let a = store.insert(due_item(-1));

        let mut claim = store.claim_due(Utc::now(), 10).await.unwrap();
        claim.mark_processed(a).await.unwrap();
        drop(claim);
        assert!(!store.get(a).unwrap().processed);
        assert_eq!(store.locked_count(), 0);

        let mut claim = store.claim_due(Utc::now(), 10).await.unwrap();
        claim.mark_processed(a).await.unwrap();
        claim.commit().await.unwrap();
        assert!(store.get(a).unwrap().processed);
        assert_eq!(store.locked_count(), 0);
        assert_eq!(store.claim_due(Utc::now(), 10).await.unwrap().items().len(), 0);
    }

    #[tokio::test]
    async fn test_mark_processed_is_idempotent() {
        let store = InMemoryDueStore::new("reminders");
        let id = store.insert(due_item(0));
        assert!(store.mark_processed(id).await.unwrap());
        assert!(!store.mark_processed(id).await.unwrap());
        assert!(!store.mark_processed(Uuid::new_v4()).await.unwrap());
        assert!(store.get(id).unwrap().processed);
    }

    #[tokio::test]
    async fn test_mark_outside_claim_is_rejected() {
        let store = InMemoryDueStore::new("reminders");
        store.insert(due_item(-1));
        let mut claim = store.claim_due(Utc::now(), 10).await.unwrap();
        assert!(claim.mark_processed(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = InMemoryDueStore::new("reminders");
        store.insert(due_item(-1));
        store.set_unavailable(true);
        assert!(matches!(store.next_due().await, Err(RollcallError::Store(_))));
        assert!(store.claim_due(Utc::now(), 10).await.is_err());
        store.set_unavailable(false);
        assert_eq!(store.claim_due(Utc::now(), 10).await.unwrap().items().len(), 1);
    }

    #[tokio::test]
    async fn test_reschedule_moves_due_time() {
        let store = InMemoryDueStore::new("reminders");
        let id = store.insert(due_item(600));
        assert!(store.claim_due(Utc::now(), 10).await.unwrap().items().is_empty());
        assert!(store.reschedule(id, Utc::now() - Duration::seconds(1)));
        assert_eq!(store.claim_due(Utc::now(), 10).await.unwrap().items().len(), 1);
        assert!(store.remove(id));
        assert_eq!(store.unprocessed_count(), 0);
    }
}
