// src/plan.rs
//
// =============================================================================
// VOXLOGICA: WORK PLAN
// =============================================================================
//
// The content-addressed DAG produced by reduction.
//
// Responsibilities:
// 1. Node variants (constant / operation / closure) and their canonical ids.
// 2. Deduplicating insertion (identical content collapses to one node).
// 3. Goals (print/save) and imported namespaces.
// 4. Deferred compilations expanded on demand by the reducer.

use std::collections::{BTreeMap, HashMap};

use serde_json::json;

use crate::ast::Expression;
use crate::errors::EngineError;
use crate::identity::{self, IdentityPolicy};
use crate::reducer::{Binding, Environment};
use crate::value::Value;

/// A 64-character lowercase hex content id.
pub type NodeId = String;

/// Reserved operator for per-element iteration, expanded at execution time.
pub const FOR_OPERATOR: &str = "for";

// ============================================================================
// 1. NODES
// ============================================================================

#[derive(Debug, Clone)]
pub enum Node {
    Constant(Value),
    Operation {
        operator: String,
        /// Keys are `"0"`, `"1"`, ... for positional arguments, arbitrary
        /// names for keyword arguments. BTreeMap keeps the canonical
        /// (lexicographic) order everywhere the map is iterated.
        arguments: BTreeMap<String, NodeId>,
    },
    Closure(ClosureNode),
}

/// A function value: parameters, body, and the captured environment.
#[derive(Debug, Clone)]
pub struct ClosureNode {
    pub parameters: Vec<String>,
    pub body: Expression,
    pub environment: Environment,
}

impl Node {
    pub fn operation(operator: impl Into<String>, arguments: BTreeMap<String, NodeId>) -> Node {
        Node::Operation {
            operator: operator.into(),
            arguments,
        }
    }

    /// Positional argument map: `"0"`, `"1"`, ...
    pub fn positional(ids: &[NodeId]) -> BTreeMap<String, NodeId> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| (i.to_string(), id.clone()))
            .collect()
    }

    /// Computes the node's content id.
    ///
    /// Constants without a deterministic representation get a pseudo-id
    /// under [`IdentityPolicy::AllowPseudo`]; such nodes are never shared.
    pub fn identity(&self, policy: IdentityPolicy) -> Result<NodeId, EngineError> {
        match self.encode() {
            Some(encoded) => Ok(identity::content_id(&encoded)),
            None => match policy {
                IdentityPolicy::AllowPseudo => Ok(identity::pseudo_id()),
                IdentityPolicy::Strict => Err(EngineError::Identity(
                    "constant has no deterministic representation".into(),
                )),
            },
        }
    }

    /// Canonical JSON encoding; `None` marks a non-identifiable constant.
    fn encode(&self) -> Option<serde_json::Value> {
        match self {
            Node::Constant(value) => {
                let v = value.identity_json()?;
                Some(json!({ "type": "constant", "value": v }))
            }
            Node::Operation {
                operator,
                arguments,
            } => {
                let args: serde_json::Map<String, serde_json::Value> = arguments
                    .iter()
                    .map(|(k, id)| (k.clone(), serde_json::Value::String(id.clone())))
                    .collect();
                Some(json!({
                    "type": "operation",
                    "operator": operator,
                    "arguments": args,
                }))
            }
            Node::Closure(c) => Some(json!({
                "type": "closure",
                "parameters": c.parameters,
                "body": expression_hash(&c.body),
                "closure": environment_entries(&c.environment),
            })),
        }
    }
}

/// Hash of the canonical serialization of a body expression.
pub fn expression_hash(expr: &Expression) -> String {
    match serde_json::to_value(expr) {
        Ok(v) => identity::content_id(&v),
        // Expressions always serialize; guarded for completeness.
        Err(_) => identity::pseudo_id(),
    }
}

/// Flattened, name-sorted view of an environment for closure hashing.
///
/// Constant bindings contribute their node id; function bindings contribute
/// a structural hash (parameters, body, captured environment). Shadowed
/// names are resolved innermost-first before sorting.
fn environment_entries(env: &Environment) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = env
        .bindings()
        .into_iter()
        .map(|(name, binding)| {
            let fingerprint = match binding {
                Binding::Constant(id) => id,
                Binding::Function(def) => identity::content_id(&json!({
                    "parameters": def.parameters,
                    "body": expression_hash(&def.body),
                    "closure": environment_entries(&def.environment),
                })),
            };
            (name, fingerprint)
        })
        .collect();
    entries.sort();
    entries
}

// ============================================================================
// 2. GOALS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalKind {
    Print,
    Save,
}

#[derive(Debug, Clone)]
pub struct Goal {
    pub kind: GoalKind,
    /// Print label, or the target filename for save goals.
    pub label: String,
    pub node_id: NodeId,
}

// ============================================================================
// 3. DEFERRED COMPILATION
// ============================================================================

/// An expression whose reduction is postponed: the body of a loop closure
/// waiting for its per-element parameter binding. Expanded by the reducer
/// when the plan's operations are demanded.
#[derive(Debug, Clone)]
pub struct LazyCompilation {
    pub expression: Expression,
    pub environment: Environment,
    pub bindings: Vec<(String, NodeId)>,
}

// ============================================================================
// 4. THE PLAN
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct WorkPlan {
    nodes: HashMap<NodeId, Node>,
    /// Insertion order, for deterministic iteration and reporting.
    order: Vec<NodeId>,
    goals: Vec<Goal>,
    imports: Vec<String>,
    lazy: Vec<LazyCompilation>,
}

impl WorkPlan {
    pub fn new() -> WorkPlan {
        WorkPlan::default()
    }

    /// Inserts a node, collapsing onto an existing entry with the same
    /// content id. Returns the id and whether the node was new.
    pub fn insert(
        &mut self,
        node: Node,
        policy: IdentityPolicy,
    ) -> Result<(NodeId, bool), EngineError> {
        let id = node.identity(policy)?;
        if self.nodes.contains_key(&id) {
            log::trace!("plan cache hit: {}", &id[..8.min(id.len())]);
            return Ok((id, false));
        }
        self.nodes.insert(id.clone(), node);
        self.order.push(id.clone());
        Ok((id, true))
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in insertion order.
    pub fn iter<'a>(&'a self) -> impl Iterator<Item = (&'a NodeId, &'a Node)> + 'a {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id).map(|n| (id, n)))
    }

    pub fn node_ids<'a>(&'a self) -> impl Iterator<Item = &'a NodeId> + 'a {
        self.order.iter()
    }

    pub fn goals(&self) -> &[Goal] {
        &self.goals
    }

    pub fn add_goal(&mut self, kind: GoalKind, label: impl Into<String>, node_id: NodeId) {
        self.goals.push(Goal {
            kind,
            label: label.into(),
            node_id,
        });
    }

    pub fn imports(&self) -> &[String] {
        &self.imports
    }

    pub fn add_import(&mut self, namespace: impl Into<String>) {
        let namespace = namespace.into();
        if !self.imports.contains(&namespace) {
            self.imports.push(namespace);
        }
    }

    pub fn push_lazy(&mut self, lazy: LazyCompilation) {
        self.lazy.push(lazy);
    }

    pub fn has_pending(&self) -> bool {
        !self.lazy.is_empty()
    }

    pub(crate) fn take_pending(&mut self) -> Vec<LazyCompilation> {
        std::mem::take(&mut self.lazy)
    }

    /// Merge nodes, goals and imports of another plan into this one.
    /// Colliding node ids refer to identical content and merge harmlessly.
    pub fn merge(&mut self, other: WorkPlan) {
        for id in other.order {
            if !self.nodes.contains_key(&id) {
                if let Some(node) = other.nodes.get(&id) {
                    self.nodes.insert(id.clone(), node.clone());
                    self.order.push(id);
                }
            }
        }
        for goal in other.goals {
            self.goals.push(goal);
        }
        for ns in other.imports {
            self.add_import(ns);
        }
        for lazy in other.lazy {
            self.lazy.push(lazy);
        }
    }

    /// Ids of the direct dependencies of `id` (operation arguments), in
    /// canonical key order.
    pub fn dependencies(&self, id: &str) -> Vec<NodeId> {
        match self.nodes.get(id) {
            Some(Node::Operation { arguments, .. }) => arguments.values().cloned().collect(),
            _ => Vec::new(),
        }
    }
}
