// src/expand.rs
//
// =============================================================================
// VOXLOGICA: DYNAMIC EXPANSION
// =============================================================================
//
// Just-in-time compilation of per-element sub-plans for the loop operator.
//
// When the scheduler dispatches a `for` node, the source sequence is
// resolved first; each element then gets its own constant node, a deferred
// compilation of the closure body under `parameter -> element`, and a
// recursive execution of the resulting node. Because the element constant
// participates in the body's hashing, every iteration is independently
// content-addressed: memoization works per element and across runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::engine::{execute, EngineInner};
use crate::errors::EngineError;
use crate::plan::{ClosureNode, LazyCompilation, Node, NodeId};
use crate::reducer::Reducer;
use crate::value::Value;

/// Executes a loop node: expands one sub-plan per source element and
/// collects the element results in source order.
pub(crate) async fn execute_loop(
    inner: &Arc<EngineInner>,
    id: &NodeId,
    arguments: &BTreeMap<String, NodeId>,
) -> Result<Value, EngineError> {
    let source_id = arguments
        .get("source")
        .ok_or_else(|| argument_error("loop node is missing its source"))?
        .clone();
    let closure_id = arguments
        .get("closure")
        .ok_or_else(|| argument_error("loop node is missing its closure"))?;

    let source = execute(inner.clone(), source_id.clone())
        .await
        .map_err(|e| match e {
            EngineError::Cancelled => EngineError::Cancelled,
            e @ EngineError::Store(_) => e,
            e => e.into_dependency(source_id),
        })?;
    let items: Vec<Value> = source
        .as_sequence()
        .ok_or_else(|| argument_error("loop source did not evaluate to a sequence"))?
        .to_vec();

    let closure: ClosureNode = match inner.plan.read().unwrap().get(closure_id) {
        Some(Node::Closure(c)) => c.clone(),
        _ => return Err(argument_error("loop closure is not addressable")),
    };
    let parameter = closure
        .parameters
        .first()
        .cloned()
        .ok_or_else(|| argument_error("loop closure has no parameter"))?;

    log::debug!(
        "expanding loop {} over {} element(s)",
        &id[..8.min(id.len())],
        items.len()
    );

    // Per-element sub-plans execute in parallel; results are collected in
    // source order regardless of completion order.
    let mut handles = Vec::with_capacity(items.len());
    for item in items {
        let inner = inner.clone();
        let closure = closure.clone();
        let parameter = parameter.clone();
        handles.push(tokio::spawn(async move {
            let element_node = iteration_node(&inner, item, &parameter, &closure)?;
            execute(inner, element_node.clone())
                .await
                .map_err(|e| match e {
                    EngineError::Cancelled => EngineError::Cancelled,
                    e @ EngineError::Store(_) => e,
                    e => e.into_dependency(element_node),
                })
        }));
    }

    let mut collected = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(Ok(value)) => collected.push(value),
            Ok(Err(e)) => return Err(e),
            Err(e) => {
                return Err(EngineError::Store(format!("iteration task aborted: {e}")))
            }
        }
    }
    Ok(Value::Sequence(collected))
}

/// Builds the iteration's sub-plan: a constant for the element, then the
/// closure body reduced with the parameter bound to it. New nodes merge
/// into the live plan; ids colliding with prior work collapse harmlessly.
fn iteration_node(
    inner: &Arc<EngineInner>,
    item: Value,
    parameter: &str,
    closure: &ClosureNode,
) -> Result<NodeId, EngineError> {
    let mut plan = inner.plan.write().unwrap();
    let (element_id, _) = plan.insert(Node::Constant(item), inner.policy)?;

    let deferred = LazyCompilation {
        expression: closure.body.clone(),
        environment: closure.environment.clone(),
        bindings: vec![(parameter.to_string(), element_id)],
    };
    let reducer = Reducer::with_policy(&inner.registry, inner.policy);
    reducer.reduce_deferred(&mut plan, &deferred)
}

fn argument_error(message: &str) -> EngineError {
    EngineError::Argument {
        operator: crate::plan::FOR_OPERATOR.into(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::ast::{Command, Expression, Program};
    use crate::engine::{EngineOptions, ExecutionEngine};
    use crate::goals::{GoalRunner, MemorySink, SerializerRegistry};
    use crate::primitives::PrimitiveRegistry;
    use crate::reducer::{Environment, Reducer};
    use crate::store::{MemoryStore, ResultStore};

    async fn run(program: Program, store: Arc<dyn ResultStore>) -> Vec<String> {
        let registry = Arc::new(PrimitiveRegistry::with_builtins());
        let reducer = Reducer::new(&registry);
        let (_, plan) = reducer
            .reduce_program(&program, Environment::new())
            .unwrap();
        let engine = ExecutionEngine::new(store, registry, EngineOptions::default());
        let sink = MemorySink::new(64);
        let runner = GoalRunner::new(Arc::new(sink.clone()), SerializerRegistry::with_defaults());
        let result = engine.run(plan, &runner).await.unwrap();
        assert!(result.all_completed(), "{:?}", result.goals);
        sink.lines()
    }

    fn loop_program() -> Program {
        // xs = for i in range(0, 5) do i + 10
        Program::new(vec![
            Command::Let {
                name: "xs".into(),
                params: vec![],
                body: Expression::for_in(
                    "i",
                    Expression::call(
                        "range",
                        vec![Expression::number(0.0), Expression::number(5.0)],
                    ),
                    Expression::call(
                        "+",
                        vec![Expression::var("i"), Expression::number(10.0)],
                    ),
                ),
            },
            Command::Print {
                label: "xs".into(),
                expr: Expression::var("xs"),
            },
        ])
    }

    #[tokio::test]
    async fn loop_collects_in_source_order() {
        let store: Arc<dyn ResultStore> = Arc::new(MemoryStore::new());
        let lines = run(loop_program(), store).await;
        assert_eq!(lines, vec!["xs=[10, 11, 12, 13, 14]".to_string()]);
    }

    #[tokio::test]
    async fn loop_body_uses_captured_bindings() {
        // offset = 100; ys = for i in range(0,3) do i + offset
        let program = Program::new(vec![
            Command::Let {
                name: "offset".into(),
                params: vec![],
                body: Expression::number(100.0),
            },
            Command::Let {
                name: "ys".into(),
                params: vec![],
                body: Expression::for_in(
                    "i",
                    Expression::call(
                        "range",
                        vec![Expression::number(0.0), Expression::number(3.0)],
                    ),
                    Expression::call(
                        "+",
                        vec![Expression::var("i"), Expression::var("offset")],
                    ),
                ),
            },
            Command::Print {
                label: "ys".into(),
                expr: Expression::var("ys"),
            },
        ]);
        let store: Arc<dyn ResultStore> = Arc::new(MemoryStore::new());
        let lines = run(program, store).await;
        assert_eq!(lines, vec!["ys=[100, 101, 102]".to_string()]);
    }

    #[tokio::test]
    async fn iteration_failure_propagates_to_the_loop() {
        // for i in range(0,3) do 1 / i  -- fails at i = 0
        let program = Program::new(vec![Command::Print {
            label: "zs".into(),
            expr: Expression::for_in(
                "i",
                Expression::call(
                    "range",
                    vec![Expression::number(0.0), Expression::number(3.0)],
                ),
                Expression::call("/", vec![Expression::number(1.0), Expression::var("i")]),
            ),
        }]);

        let registry = Arc::new(PrimitiveRegistry::with_builtins());
        let reducer = Reducer::new(&registry);
        let (_, plan) = reducer
            .reduce_program(&program, Environment::new())
            .unwrap();
        let store: Arc<dyn ResultStore> = Arc::new(MemoryStore::new());
        let engine = ExecutionEngine::new(store, registry, EngineOptions::default());
        let runner = GoalRunner::new(
            Arc::new(MemorySink::new(4)),
            SerializerRegistry::with_defaults(),
        );
        let result = engine.run(plan, &runner).await.unwrap();
        assert!(!result.all_completed());
        match &result.goals[0].status {
            crate::engine::GoalStatus::Failed(msg) => {
                assert!(msg.contains("division by zero"), "{msg}")
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_source_yields_empty_sequence() {
        let program = Program::new(vec![Command::Print {
            label: "none".into(),
            expr: Expression::for_in(
                "i",
                Expression::call(
                    "range",
                    vec![Expression::number(3.0), Expression::number(3.0)],
                ),
                Expression::var("i"),
            ),
        }]);
        let store: Arc<dyn ResultStore> = Arc::new(MemoryStore::new());
        let lines = run(program, store).await;
        assert_eq!(lines, vec!["none=[]".to_string()]);
    }
}
