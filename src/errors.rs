// src/errors.rs
//
// =============================================================================
// VOXLOGICA: ENGINE ERROR TAXONOMY
// =============================================================================
//
// Every failure the engine can surface, as typed values. Failures recorded
// for a node travel through the store and the shared-future map as values;
// nothing unwinds across the scheduler boundary.

use thiserror::Error;

use crate::plan::NodeId;
use crate::primitives::ResolutionError;
use crate::store::StoreError;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A constant carries no deterministic representation and pseudo-ids
    /// are disabled.
    #[error("cannot derive a content id: {0}")]
    Identity(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// A primitive received arguments violating its documented constraints.
    #[error("operator '{operator}': {message}")]
    Argument { operator: String, message: String },

    /// A primitive raised an error during invocation.
    #[error("operator '{operator}' failed: {message}")]
    Primitive { operator: String, message: String },

    /// A prerequisite node failed; the originating error is preserved.
    #[error("dependency {node_id} failed: {inner}")]
    Dependency {
        node_id: NodeId,
        #[source]
        inner: Box<EngineError>,
    },

    /// The store records this node as failed (this run or a previous one).
    #[error("node {node_id} is recorded as failed: {message}")]
    NodeFailed { node_id: NodeId, message: String },

    /// The result could not be serialized for persistence. Normally
    /// downgraded to in-memory retention inside the store; surfaced only
    /// when a serializable value is strictly required.
    #[error("result for {0} is not serializable")]
    Serialization(NodeId),

    /// Persistent store failure. The only class that aborts scheduling.
    #[error("store failure: {0}")]
    Store(String),

    /// A goal or operation references a node the work plan does not hold.
    #[error("work plan does not contain node {0}")]
    UnknownNode(NodeId),

    /// Cooperative cancellation observed.
    #[error("cancelled")]
    Cancelled,
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e.to_string())
    }
}

impl EngineError {
    /// Wraps this error as seen from a dependent of `node_id`.
    pub fn into_dependency(self, node_id: NodeId) -> EngineError {
        EngineError::Dependency {
            node_id,
            inner: Box::new(self),
        }
    }

    /// The first failed node in the subtree this error describes, if any.
    pub fn origin_node(&self) -> Option<&NodeId> {
        match self {
            EngineError::Dependency { node_id, inner } => {
                inner.origin_node().or(Some(node_id))
            }
            EngineError::NodeFailed { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}
