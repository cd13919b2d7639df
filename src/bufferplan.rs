// src/bufferplan.rs
//
// =============================================================================
// VOXLOGICA: BUFFER PLANNER (advisory)
// =============================================================================
//
// Static assignment of nodes to reusable buffers, for embedders that want
// memory planning. Chain-decomposition heuristic, linear in the plan size:
// a node reuses a parent's buffer when that parent has exactly one
// remaining consumer, is not a goal target, and carries a compatible type.
// Nodes sharing a buffer are comparable in the DAG's partial order, so
// their live intervals never overlap under any topological execution.
//
// Advisory only: the scheduler routes values through the store and does
// not consult the assignment.

use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::plan::{Node, NodeId, WorkPlan};

#[derive(Debug, Clone, Default)]
pub struct BufferAssignment {
    pub buffers: HashMap<NodeId, usize>,
    pub buffer_count: usize,
}

/// Computes a buffer assignment for the plan.
///
/// `type_of` assigns each node an opaque type; `compatible` is the
/// type-compatibility relation deciding whether a buffer can be reused.
pub fn assign_buffers<T, FT, FC>(
    plan: &WorkPlan,
    type_of: FT,
    compatible: FC,
) -> BufferAssignment
where
    FT: Fn(&NodeId) -> T,
    FC: Fn(&T, &T) -> bool,
{
    let goal_targets: HashSet<&NodeId> = plan.goals().iter().map(|g| &g.node_id).collect();

    // Mirror the plan as a petgraph DiGraph (argument -> consumer edges).
    let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
    let mut index: HashMap<NodeId, NodeIndex> = HashMap::new();
    for (id, _) in plan.iter() {
        index.insert(id.clone(), graph.add_node(id.clone()));
    }
    for (id, node) in plan.iter() {
        if let Node::Operation { arguments, .. } = node {
            let consumer = index[id];
            for dep in arguments.values() {
                if let Some(&producer) = index.get(dep) {
                    graph.add_edge(producer, consumer, ());
                }
            }
        }
    }

    // Acyclic by construction: ids hash their dependencies.
    let order = petgraph::algo::toposort(&graph, None).unwrap_or_default();

    // Remaining consumers per node: children plus one if a goal reads it.
    let mut consumers: HashMap<NodeIndex, usize> = HashMap::new();
    for idx in graph.node_indices() {
        let children = graph.neighbors_directed(idx, Direction::Outgoing).count();
        let goal_reads = goal_targets.contains(&graph[idx]) as usize;
        consumers.insert(idx, children + goal_reads);
    }

    let mut assignment = BufferAssignment::default();
    let mut buffer_of: HashMap<NodeIndex, usize> = HashMap::new();

    for idx in order {
        let ty = type_of(&graph[idx]);

        let reused = graph
            .neighbors_directed(idx, Direction::Incoming)
            .find(|parent| {
                consumers.get(parent).copied() == Some(1)
                    && !goal_targets.contains(&graph[*parent])
                    && compatible(&type_of(&graph[*parent]), &ty)
            })
            .and_then(|parent| buffer_of.get(&parent).copied());

        let buffer = match reused {
            Some(b) => b,
            None => {
                let b = assignment.buffer_count;
                assignment.buffer_count += 1;
                b
            }
        };
        buffer_of.insert(idx, buffer);
        assignment.buffers.insert(graph[idx].clone(), buffer);

        let parents: Vec<NodeIndex> = graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect();
        for parent in parents {
            if let Some(c) = consumers.get_mut(&parent) {
                *c = c.saturating_sub(1);
            }
        }
    }

    assignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityPolicy;
    use crate::plan::{GoalKind, Node};
    use crate::value::Value;

    /// a -> f(a) -> g(f(a)), goal on the last node.
    fn chain_plan() -> (WorkPlan, NodeId, NodeId, NodeId) {
        let mut plan = WorkPlan::new();
        let policy = IdentityPolicy::default();
        let (a, _) = plan.insert(Node::Constant(Value::Number(1.0)), policy).unwrap();
        let (f, _) = plan
            .insert(Node::operation("f", Node::positional(&[a.clone()])), policy)
            .unwrap();
        let (g, _) = plan
            .insert(Node::operation("g", Node::positional(&[f.clone()])), policy)
            .unwrap();
        plan.add_goal(GoalKind::Print, "out", g.clone());
        (plan, a, f, g)
    }

    #[test]
    fn chain_shares_one_buffer() {
        let (plan, a, f, g) = chain_plan();
        let assignment = assign_buffers(&plan, |_| (), |_, _| true);
        assert_eq!(assignment.buffer_count, 1);
        assert_eq!(assignment.buffers[&a], assignment.buffers[&f]);
        assert_eq!(assignment.buffers[&f], assignment.buffers[&g]);
    }

    #[test]
    fn incompatible_types_never_share() {
        let (plan, a, f, _) = chain_plan();
        let assignment = assign_buffers(
            &plan,
            |id| id.clone(),
            // Every node its own type; nothing is compatible.
            |x, y| x == y,
        );
        assert_eq!(assignment.buffer_count, 3);
        assert_ne!(assignment.buffers[&a], assignment.buffers[&f]);
    }

    #[test]
    fn fan_out_reuses_only_after_the_last_consumer() {
        // a feeds both f and g. The first consumer sees two outstanding
        // reads and must allocate; only the last consumer may take a's
        // buffer.
        let mut plan = WorkPlan::new();
        let policy = IdentityPolicy::default();
        let (a, _) = plan.insert(Node::Constant(Value::Number(1.0)), policy).unwrap();
        let (f, _) = plan
            .insert(Node::operation("f", Node::positional(&[a.clone()])), policy)
            .unwrap();
        let (g, _) = plan
            .insert(Node::operation("g", Node::positional(&[a.clone()])), policy)
            .unwrap();
        plan.add_goal(GoalKind::Print, "f", f.clone());
        plan.add_goal(GoalKind::Print, "g", g.clone());

        let assignment = assign_buffers(&plan, |_| (), |_, _| true);
        let shared = [&f, &g]
            .iter()
            .filter(|id| assignment.buffers[**id] == assignment.buffers[&a])
            .count();
        assert_eq!(shared, 1, "exactly the last consumer reuses a's buffer");
        assert_ne!(assignment.buffers[&f], assignment.buffers[&g]);
    }

    #[test]
    fn goal_targets_keep_their_buffer() {
        // a is itself a goal target; its consumer must not steal the
        // buffer even though a has one child.
        let mut plan = WorkPlan::new();
        let policy = IdentityPolicy::default();
        let (a, _) = plan.insert(Node::Constant(Value::Number(2.0)), policy).unwrap();
        let (f, _) = plan
            .insert(Node::operation("f", Node::positional(&[a.clone()])), policy)
            .unwrap();
        plan.add_goal(GoalKind::Print, "a", a.clone());
        plan.add_goal(GoalKind::Print, "f", f.clone());

        let assignment = assign_buffers(&plan, |_| (), |_, _| true);
        assert_ne!(assignment.buffers[&a], assignment.buffers[&f]);
    }

    #[test]
    fn empty_plan_needs_no_buffers() {
        let plan = WorkPlan::new();
        let assignment = assign_buffers(&plan, |_| (), |_, _| true);
        assert_eq!(assignment.buffer_count, 0);
        assert!(assignment.buffers.is_empty());
    }
}
