// src/store/mod.rs
//
// =============================================================================
// VOXLOGICA: RESULT STORE
// =============================================================================
//
// Content-addressed key-value backing for operation results, with the
// claim/complete protocol workers coordinate through. Two backends:
// a persistent SQLite store and a process-local memory store (used by
// cache-bypassing runs and tests).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::plan::NodeId;
use crate::value::Value;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, StoreOptions};

// ============================================================================
// 1. TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("invalid state transition for {id}: {detail}")]
    InvalidTransition { id: NodeId, detail: String },

    #[error("store is shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This worker owns the computation.
    Claimed,
    /// Another worker (possibly in another process) holds the claim.
    AlreadyClaimed,
}

/// Outcome of a point read.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredResult {
    Value(Value),
    Failed(String),
    Missing,
}

/// Outcome of awaiting a node's terminal state.
///
/// `Completed(None)` means the state row is terminal but the value is no
/// longer retrievable (a non-serializable result owned by a cohort that is
/// gone); callers release the row and recompute.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Completed(Option<Value>),
    Failed(String),
}

// ============================================================================
// 2. THE CONTRACT
// ============================================================================

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Stores a result. Values that cannot be serialized are retained in
    /// the process-local memory cache instead; that is not an error.
    /// Serializable values become visible to `get` immediately, before the
    /// persistent write lands.
    async fn put(
        &self,
        id: &NodeId,
        value: Value,
        meta: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    async fn get(&self, id: &NodeId) -> Result<StoredResult, StoreError>;

    async fn exists(&self, id: &NodeId) -> Result<bool, StoreError>;

    /// Atomic insert-if-absent of a claim row. The sole cross-worker
    /// coordination primitive; no advisory locks anywhere.
    async fn try_claim(&self, id: &NodeId) -> Result<ClaimOutcome, StoreError>;

    async fn mark_completed(&self, id: &NodeId) -> Result<(), StoreError>;

    async fn mark_failed(&self, id: &NodeId, message: &str) -> Result<(), StoreError>;

    /// Suspends until the node reaches a terminal state.
    async fn wait_for_completion(&self, id: &NodeId) -> Result<Completion, StoreError>;

    /// Drops the execution-state row for a node: a cancelled computation,
    /// or a terminal row whose value can no longer be fetched.
    async fn release(&self, id: &NodeId) -> Result<(), StoreError>;

    /// Reclaims `running` rows whose worker cohort has died or whose claim
    /// outlived the staleness threshold. Returns the number reclaimed.
    async fn cleanup_stale(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Deletes failed states so the next run may retry those nodes.
    async fn purge_failed(&self) -> Result<usize, StoreError>;
}
