// src/lib.rs
//
// =============================================================================
// VOXLOGICA: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.

// 1. Declare Modules
pub mod ast;
pub mod bufferplan;
pub mod engine;
pub mod errors;
pub mod expand;
pub mod goals;
pub mod identity;
pub mod plan;
pub mod primitives;
pub mod reducer;
pub mod store;
pub mod value;

// 2. Re-exports (The Public API)
// These allow `use voxlogica::WorkPlan` or `use voxlogica::ExecutionEngine`
// to work elsewhere.

pub use ast::{Command, Expression, Program};
pub use engine::{CancelSignal, EngineOptions, ExecutionEngine, GoalStatus, RunResult};
pub use errors::EngineError;
pub use goals::{GoalRunner, MemorySink, SerializerRegistry};
pub use plan::{Goal, GoalKind, Node, NodeId, WorkPlan};
pub use primitives::PrimitiveRegistry;
pub use reducer::{Environment, Reducer};
pub use store::{MemoryStore, ResultStore, SqliteStore};
pub use value::Value;
