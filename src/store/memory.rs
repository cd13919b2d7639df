// src/store/memory.rs
//
// In-memory result store. Backs cache-bypassing runs (results discarded at
// end of run) and unit tests. Same claim/complete protocol as the
// persistent store, without the persistence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::plan::NodeId;
use crate::value::Value;

use super::{ClaimOutcome, Completion, ResultStore, StoreError, StoredResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct StateRow {
    status: Status,
    claim_token: String,
    started_at: DateTime<Utc>,
    error: Option<String>,
}

pub struct MemoryStore {
    results: DashMap<NodeId, Value>,
    states: DashMap<NodeId, StateRow>,
    waiters: DashMap<NodeId, Arc<Notify>>,
    stale_after: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            results: DashMap::new(),
            states: DashMap::new(),
            waiters: DashMap::new(),
            stale_after: Duration::from_secs(3600),
        }
    }

    fn waiter(&self, id: &str) -> Arc<Notify> {
        self.waiters
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn notify(&self, id: &str) {
        if let Some(n) = self.waiters.get(id) {
            n.notify_waiters();
        }
    }

    fn terminal(&self, id: &str) -> Option<Completion> {
        let row = self.states.get(id)?;
        match row.status {
            Status::Completed => Some(Completion::Completed(
                self.results.get(id).map(|v| v.clone()),
            )),
            Status::Failed => Some(Completion::Failed(row.error.clone().unwrap_or_default())),
            Status::Running => None,
        }
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn put(
        &self,
        id: &NodeId,
        value: Value,
        _meta: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        // Everything is memory-resident here; serializability is moot.
        self.results.insert(id.clone(), value);
        self.notify(id);
        Ok(())
    }

    async fn get(&self, id: &NodeId) -> Result<StoredResult, StoreError> {
        if let Some(v) = self.results.get(id) {
            return Ok(StoredResult::Value(v.clone()));
        }
        if let Some(row) = self.states.get(id) {
            if row.status == Status::Failed {
                return Ok(StoredResult::Failed(row.error.clone().unwrap_or_default()));
            }
        }
        Ok(StoredResult::Missing)
    }

    async fn exists(&self, id: &NodeId) -> Result<bool, StoreError> {
        Ok(self.results.contains_key(id))
    }

    async fn try_claim(&self, id: &NodeId) -> Result<ClaimOutcome, StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.states.entry(id.clone()) {
            Entry::Occupied(_) => Ok(ClaimOutcome::AlreadyClaimed),
            Entry::Vacant(e) => {
                e.insert(StateRow {
                    status: Status::Running,
                    claim_token: Uuid::new_v4().to_string(),
                    started_at: Utc::now(),
                    error: None,
                });
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn mark_completed(&self, id: &NodeId) -> Result<(), StoreError> {
        let mut row = self.states.get_mut(id).ok_or_else(|| {
            StoreError::InvalidTransition {
                id: id.clone(),
                detail: "no claim exists".into(),
            }
        })?;
        if row.status != Status::Running {
            return Err(StoreError::InvalidTransition {
                id: id.clone(),
                detail: format!("state is {:?}", row.status),
            });
        }
        row.status = Status::Completed;
        drop(row);
        self.notify(id);
        Ok(())
    }

    async fn mark_failed(&self, id: &NodeId, message: &str) -> Result<(), StoreError> {
        let mut row = self.states.get_mut(id).ok_or_else(|| {
            StoreError::InvalidTransition {
                id: id.clone(),
                detail: "no claim exists".into(),
            }
        })?;
        if row.status != Status::Running {
            return Err(StoreError::InvalidTransition {
                id: id.clone(),
                detail: format!("state is {:?}", row.status),
            });
        }
        row.status = Status::Failed;
        row.error = Some(message.to_string());
        drop(row);
        self.notify(id);
        Ok(())
    }

    async fn wait_for_completion(&self, id: &NodeId) -> Result<Completion, StoreError> {
        loop {
            let notify = self.waiter(id);
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before the state check, or a notification landing
            // in between would be lost.
            notified.as_mut().enable();

            if let Some(c) = self.terminal(id) {
                return Ok(c);
            }
            notified.await;
        }
    }

    async fn release(&self, id: &NodeId) -> Result<(), StoreError> {
        self.states.remove(id);
        self.notify(id);
        Ok(())
    }

    async fn cleanup_stale(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let cutoff = now - stale_after;
        let before = self.states.len();
        self.states
            .retain(|_, row| !(row.status == Status::Running && row.started_at < cutoff));
        Ok(before - self.states.len())
    }

    async fn purge_failed(&self) -> Result<usize, StoreError> {
        let before = self.states.len();
        self.states.retain(|_, row| row.status != Status::Failed);
        Ok(before - self.states.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = MemoryStore::new();
        let id: NodeId = "a".repeat(64);
        assert_eq!(store.try_claim(&id).await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            store.try_claim(&id).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
    }

    #[tokio::test]
    async fn completed_is_terminal() {
        let store = MemoryStore::new();
        let id: NodeId = "b".repeat(64);
        store.try_claim(&id).await.unwrap();
        store.put(&id, Value::Number(42.0), None).await.unwrap();
        store.mark_completed(&id).await.unwrap();

        assert!(matches!(
            store.mark_failed(&id, "late").await,
            Err(StoreError::InvalidTransition { .. })
        ));
        assert_eq!(
            store.get(&id).await.unwrap(),
            StoredResult::Value(Value::Number(42.0))
        );
    }

    #[tokio::test]
    async fn waiter_wakes_on_completion() {
        let store = Arc::new(MemoryStore::new());
        let id: NodeId = "c".repeat(64);
        store.try_claim(&id).await.unwrap();

        let waiter = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move { store.wait_for_completion(&id).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store.put(&id, Value::Bool(true), None).await.unwrap();
        store.mark_completed(&id).await.unwrap();

        let completion = waiter.await.unwrap().unwrap();
        assert_eq!(completion, Completion::Completed(Some(Value::Bool(true))));
    }

    #[tokio::test]
    async fn failed_surfaces_message_and_purges() {
        let store = MemoryStore::new();
        let id: NodeId = "d".repeat(64);
        store.try_claim(&id).await.unwrap();
        store.mark_failed(&id, "boom").await.unwrap();

        assert_eq!(
            store.get(&id).await.unwrap(),
            StoredResult::Failed("boom".into())
        );
        assert_eq!(store.purge_failed().await.unwrap(), 1);
        assert_eq!(store.get(&id).await.unwrap(), StoredResult::Missing);
    }

    #[tokio::test]
    async fn stale_running_claims_are_reclaimed() {
        let store = MemoryStore::new();
        let id: NodeId = "e".repeat(64);
        store.try_claim(&id).await.unwrap();

        // Not stale yet.
        assert_eq!(store.cleanup_stale(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(store.cleanup_stale(later).await.unwrap(), 1);
        assert_eq!(store.try_claim(&id).await.unwrap(), ClaimOutcome::Claimed);
    }
}
