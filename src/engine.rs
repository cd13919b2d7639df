// src/engine.rs
//
// =============================================================================
// VOXLOGICA: EXECUTION ENGINE
// =============================================================================
//
// Drives a work plan to completion.
//
// Responsibilities:
// 1. Demand-driven execution of goal subtrees, memoized through the store.
// 2. Deduplication of concurrent demand via a shared-future map: the
//    atomic insert on the map plus the atomic claim in the store together
//    guarantee at most one computation per node, with no locks.
// 3. Canonical argument ordering: values reach primitives in lexicographic
//    key order, never completion order.
// 4. Bounded parallelism (semaphore sized to the worker count) and
//    cooperative cancellation.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::{watch, Semaphore};

use crate::errors::EngineError;
use crate::expand;
use crate::goals::GoalRunner;
use crate::identity::IdentityPolicy;
use crate::plan::{Goal, GoalKind, Node, NodeId, WorkPlan, FOR_OPERATOR};
use crate::primitives::{ArgMap, PrimitiveError, PrimitiveRegistry};
use crate::reducer::Reducer;
use crate::store::{ClaimOutcome, Completion, ResultStore, StoredResult};
use crate::value::Value;

// ============================================================================
// 1. OPTIONS, CANCELLATION, RESULTS
// ============================================================================

/// Cooperative cancellation flag, checked between tasks. In-flight
/// primitive invocations run to completion.
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> CancelSignal {
        CancelSignal::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct EngineOptions {
    /// Concurrent primitive invocations. Defaults to machine concurrency.
    pub workers: usize,
    pub cancel: CancelSignal,
    pub policy: IdentityPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            cancel: CancelSignal::new(),
            policy: IdentityPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GoalStatus {
    Completed,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct GoalReport {
    pub kind: GoalKind,
    pub label: String,
    pub node_id: NodeId,
    pub status: GoalStatus,
    /// On failure, the first failed node in the goal's subtree.
    pub first_failed: Option<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub goals: Vec<GoalReport>,
}

impl RunResult {
    pub fn all_completed(&self) -> bool {
        self.goals
            .iter()
            .all(|g| g.status == GoalStatus::Completed)
    }

    pub fn exit_code(&self) -> i32 {
        if self.all_completed() {
            0
        } else {
            1
        }
    }
}

// ============================================================================
// 2. THE ENGINE
// ============================================================================

type TaskOutcome = Result<Value, EngineError>;
type BoxedTask = Pin<Box<dyn Future<Output = TaskOutcome> + Send>>;

pub(crate) struct EngineInner {
    pub(crate) plan: RwLock<WorkPlan>,
    pub(crate) imports: Vec<String>,
    pub(crate) store: Arc<dyn ResultStore>,
    pub(crate) registry: Arc<PrimitiveRegistry>,
    pub(crate) policy: IdentityPolicy,
    /// NodeId -> pending outcome. Creators compute, everyone else awaits.
    futures: DashMap<NodeId, watch::Receiver<Option<TaskOutcome>>>,
    limiter: Arc<Semaphore>,
    cancel: CancelSignal,
}

pub struct ExecutionEngine {
    store: Arc<dyn ResultStore>,
    registry: Arc<PrimitiveRegistry>,
    options: EngineOptions,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn ResultStore>,
        registry: Arc<PrimitiveRegistry>,
        options: EngineOptions,
    ) -> ExecutionEngine {
        ExecutionEngine {
            store,
            registry,
            options,
        }
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.options.cancel.clone()
    }

    /// Executes every goal of the plan. Independent goals run concurrently
    /// and fail independently; the report carries one status per goal.
    pub async fn run(
        &self,
        mut plan: WorkPlan,
        runner: &GoalRunner,
    ) -> Result<RunResult, EngineError> {
        // Deferred compilations must be materialized before goal subtrees
        // are walked.
        Reducer::with_policy(&self.registry, self.options.policy).expand_pending(&mut plan)?;

        let goals: Vec<Goal> = plan.goals().to_vec();
        let imports = plan.imports().to_vec();

        let inner = Arc::new(EngineInner {
            plan: RwLock::new(plan),
            imports,
            store: self.store.clone(),
            registry: self.registry.clone(),
            policy: self.options.policy,
            futures: DashMap::new(),
            limiter: Arc::new(Semaphore::new(self.options.workers.max(1))),
            cancel: self.options.cancel.clone(),
        });

        let mut handles = Vec::with_capacity(goals.len());
        for goal in goals {
            let inner = inner.clone();
            let runner = runner.clone();
            handles.push(tokio::spawn(async move {
                run_goal(inner, runner, goal).await
            }));
        }

        let mut result = RunResult::default();
        for handle in handles {
            match handle.await {
                Ok(report) => result.goals.push(report),
                Err(e) => {
                    return Err(EngineError::Store(format!("goal task aborted: {e}")));
                }
            }
        }

        for g in &result.goals {
            match &g.status {
                GoalStatus::Completed => log::info!("goal '{}' completed", g.label),
                GoalStatus::Failed(msg) => log::error!("goal '{}' failed: {msg}", g.label),
                GoalStatus::Cancelled => log::warn!("goal '{}' cancelled", g.label),
            }
        }
        Ok(result)
    }
}

async fn run_goal(inner: Arc<EngineInner>, runner: GoalRunner, goal: Goal) -> GoalReport {
    // Goal side effects start strictly after the target subtree is
    // terminal, and run exactly once per invocation regardless of how the
    // value was obtained.
    let (status, first_failed) = match execute(inner, goal.node_id.clone()).await {
        Ok(value) => match runner.run_goal(&goal, &value) {
            Ok(()) => (GoalStatus::Completed, None),
            Err(msg) => (GoalStatus::Failed(msg), None),
        },
        Err(EngineError::Cancelled) => (GoalStatus::Cancelled, None),
        Err(e) => {
            let origin = e
                .origin_node()
                .cloned()
                .unwrap_or_else(|| goal.node_id.clone());
            (GoalStatus::Failed(e.to_string()), Some(origin))
        }
    };
    GoalReport {
        kind: goal.kind,
        label: goal.label,
        node_id: goal.node_id,
        status,
        first_failed,
    }
}

// ============================================================================
// 3. NODE EXECUTION
// ============================================================================

/// Demand-driven execution of one node. Boxed for recursion.
pub(crate) fn execute(inner: Arc<EngineInner>, id: NodeId) -> BoxedTask {
    Box::pin(async move {
        if inner.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // Memoization fast path.
        match inner.store.get(&id).await? {
            StoredResult::Value(v) => return Ok(v),
            StoredResult::Failed(message) => {
                return Err(EngineError::NodeFailed {
                    node_id: id,
                    message,
                })
            }
            StoredResult::Missing => {}
        }

        // Shared-future deduplication: exactly one in-process creator.
        let tx = {
            use dashmap::mapref::entry::Entry;
            match inner.futures.entry(id.clone()) {
                Entry::Occupied(e) => {
                    let rx = e.get().clone();
                    drop(e);
                    return await_peer(inner.clone(), rx, id).await;
                }
                Entry::Vacant(e) => {
                    let (tx, rx) = watch::channel(None);
                    e.insert(rx);
                    tx
                }
            }
        };

        let outcome = compute(&inner, &id).await;
        let _ = tx.send(Some(outcome.clone()));
        inner.futures.remove(&id);
        outcome
    })
}

/// Awaits the outcome published by the in-process computer of `id`.
async fn await_peer(
    inner: Arc<EngineInner>,
    mut rx: watch::Receiver<Option<TaskOutcome>>,
    id: NodeId,
) -> TaskOutcome {
    loop {
        {
            let current = rx.borrow_and_update();
            if let Some(outcome) = current.as_ref() {
                return outcome.clone();
            }
        }
        if rx.changed().await.is_err() {
            // The computer vanished without publishing (task aborted).
            // Clear its entry, if still present, and retry from the top.
            inner
                .futures
                .remove_if(&id, |_, existing| existing.same_channel(&rx));
            return execute(inner, id).await;
        }
    }
}

/// The computation path: claim, resolve dependencies, invoke, persist.
async fn compute(inner: &Arc<EngineInner>, id: &NodeId) -> TaskOutcome {
    // Claim against the store; another process cohort may already own the
    // node, in which case its terminal state is awaited instead.
    loop {
        match inner.store.try_claim(id).await? {
            ClaimOutcome::Claimed => break,
            ClaimOutcome::AlreadyClaimed => match inner.store.wait_for_completion(id).await? {
                Completion::Completed(Some(v)) => return Ok(v),
                Completion::Completed(None) => {
                    // Terminal but unfetchable: a non-serializable result
                    // whose owning cohort is gone. Reclaim and recompute.
                    inner.store.release(id).await?;
                    continue;
                }
                Completion::Failed(message) => {
                    return Err(EngineError::NodeFailed {
                        node_id: id.clone(),
                        message,
                    })
                }
            },
        }
    }

    match evaluate_node(inner, id).await {
        Ok(value) => {
            inner.store.put(id, value.clone(), None).await?;
            inner.store.mark_completed(id).await?;
            Ok(value)
        }
        Err(EngineError::Cancelled) => {
            // Not a node failure: surrender the claim so a later run can
            // compute it.
            if let Err(e) = inner.store.release(id).await {
                log::warn!("failed to release claim for {}: {e}", &id[..8]);
            }
            Err(EngineError::Cancelled)
        }
        Err(e @ EngineError::Store(_)) => {
            // Store failures are fatal for the whole run.
            inner.cancel.cancel();
            Err(e)
        }
        Err(e) => {
            if let Err(me) = inner.store.mark_failed(id, &e.to_string()).await {
                log::warn!("failed to record failure for {}: {me}", &id[..8]);
            }
            Err(e)
        }
    }
}

async fn evaluate_node(inner: &Arc<EngineInner>, id: &NodeId) -> TaskOutcome {
    let node = inner
        .plan
        .read()
        .unwrap()
        .get(id)
        .cloned()
        .ok_or_else(|| EngineError::UnknownNode(id.clone()))?;

    match node {
        Node::Constant(value) => Ok(value),

        // A closure demanded as a value renders as an opaque handle; only
        // the loop operator consumes closures structurally.
        Node::Closure(_) => Ok(Value::Opaque(crate::value::OpaqueValue::new(
            "closure",
            Some(id.clone()),
            (),
        ))),

        Node::Operation {
            operator,
            arguments,
        } if operator == FOR_OPERATOR => {
            expand::execute_loop(inner, id, &arguments).await
        }

        Node::Operation {
            operator,
            arguments,
        } => invoke_operation(inner, &operator, &arguments).await,
    }
}

async fn invoke_operation(
    inner: &Arc<EngineInner>,
    operator: &str,
    arguments: &BTreeMap<String, NodeId>,
) -> TaskOutcome {
    // Dependencies run concurrently, but values are assembled in canonical
    // key order so primitives always observe the same sequence.
    let mut pending = Vec::with_capacity(arguments.len());
    for (key, dep_id) in arguments {
        let handle = tokio::spawn(execute(inner.clone(), dep_id.clone()));
        pending.push((key.clone(), dep_id.clone(), handle));
    }

    let mut args = ArgMap::new();
    let mut first_failure: Option<EngineError> = None;
    for (key, dep_id, handle) in pending {
        match handle.await {
            Ok(Ok(value)) => {
                args.insert(key, value);
            }
            Ok(Err(e)) if first_failure.is_none() => {
                first_failure = Some(match e {
                    EngineError::Cancelled => EngineError::Cancelled,
                    e @ EngineError::Store(_) => e,
                    e => e.into_dependency(dep_id),
                });
            }
            Ok(Err(_)) => {}
            Err(e) if first_failure.is_none() => {
                first_failure = Some(EngineError::Store(format!(
                    "dependency task aborted: {e}"
                )));
            }
            Err(_) => {}
        }
    }
    if let Some(e) = first_failure {
        return Err(e);
    }

    let primitive = inner.registry.resolve(operator, &inner.imports)?;

    // Bounded worker pool: at most `workers` primitives run at once.
    let permit = inner
        .limiter
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| EngineError::Cancelled)?;
    if inner.cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    log::debug!("invoking '{operator}' ({} argument(s))", args.len());
    let op_name = operator.to_string();
    let invocation = tokio::task::spawn_blocking(move || {
        let res = primitive.invoke(&args);
        drop(permit);
        res
    })
    .await;

    match invocation {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(PrimitiveError::Argument(message))) => Err(EngineError::Argument {
            operator: op_name,
            message,
        }),
        Ok(Err(PrimitiveError::Failure(message))) => Err(EngineError::Primitive {
            operator: op_name,
            message,
        }),
        Err(e) => Err(EngineError::Primitive {
            operator: op_name,
            message: format!("invocation panicked: {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Command, Expression, Program};
    use crate::goals::{MemorySink, SerializerRegistry};
    use crate::primitives::Namespace;
    use crate::reducer::Environment;
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    fn runner_with_sink() -> (GoalRunner, MemorySink) {
        let sink = MemorySink::new(64);
        (
            GoalRunner::new(Arc::new(sink.clone()), SerializerRegistry::with_defaults()),
            sink,
        )
    }

    async fn run_program(
        program: Program,
        registry: Arc<PrimitiveRegistry>,
        store: Arc<dyn ResultStore>,
    ) -> (RunResult, Vec<String>) {
        let reducer = Reducer::new(&registry);
        let (_, plan) = reducer
            .reduce_program(&program, Environment::new())
            .unwrap();
        let engine = ExecutionEngine::new(store, registry.clone(), EngineOptions::default());
        let (runner, sink) = runner_with_sink();
        let result = engine.run(plan, &runner).await.unwrap();
        (result, sink.lines())
    }

    fn sum_program() -> Program {
        Program::new(vec![
            Command::Let {
                name: "a".into(),
                params: vec![],
                body: Expression::number(1.0),
            },
            Command::Let {
                name: "b".into(),
                params: vec![],
                body: Expression::number(2.0),
            },
            Command::Let {
                name: "c".into(),
                params: vec![],
                body: Expression::call("+", vec![Expression::var("a"), Expression::var("b")]),
            },
            Command::Print {
                label: "sum".into(),
                expr: Expression::var("c"),
            },
        ])
    }

    #[tokio::test]
    async fn sum_prints_three() {
        let registry = Arc::new(PrimitiveRegistry::with_builtins());
        let store: Arc<dyn ResultStore> = Arc::new(MemoryStore::new());
        let (result, lines) = run_program(sum_program(), registry, store).await;
        assert!(result.all_completed());
        assert_eq!(result.exit_code(), 0);
        assert_eq!(lines, vec!["sum=3".to_string()]);
    }

    #[tokio::test]
    async fn empty_plan_completes_with_no_goals() {
        let registry = Arc::new(PrimitiveRegistry::with_builtins());
        let store: Arc<dyn ResultStore> = Arc::new(MemoryStore::new());
        let engine = ExecutionEngine::new(store, registry, EngineOptions::default());
        let (runner, _) = runner_with_sink();
        let result = engine.run(WorkPlan::new(), &runner).await.unwrap();
        assert!(result.goals.is_empty());
        assert!(result.all_completed());
    }

    /// Registry whose namespace counts invocations of a slow primitive.
    fn counting_registry(counter: Arc<AtomicUsize>) -> Arc<PrimitiveRegistry> {
        let registry = PrimitiveRegistry::with_builtins();
        let mut ns = Namespace::new("bench");
        ns.register("expensive", "sleeps, then returns its argument", move |args| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(30));
            crate::primitives::expect_value(args, "0").map(|v| v.clone())
        });
        registry.add_namespace(ns);
        Arc::new(registry)
    }

    #[tokio::test]
    async fn shared_dependency_is_computed_once() {
        // Two goals demand the same expensive node concurrently.
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(counter.clone());
        let store: Arc<dyn ResultStore> = Arc::new(MemoryStore::new());

        let program = Program::new(vec![
            Command::Let {
                name: "e".into(),
                params: vec![],
                body: Expression::call("bench.expensive", vec![Expression::number(9.0)]),
            },
            Command::Print {
                label: "g1".into(),
                expr: Expression::call("+", vec![Expression::var("e"), Expression::number(1.0)]),
            },
            Command::Print {
                label: "g2".into(),
                expr: Expression::call("+", vec![Expression::var("e"), Expression::number(2.0)]),
            },
        ]);

        let (result, lines) = run_program(program, registry, store).await;
        assert!(result.all_completed());
        assert_eq!(counter.load(Ordering::SeqCst), 1, "at most one compute");
        assert!(lines.contains(&"g1=10".to_string()));
        assert!(lines.contains(&"g2=11".to_string()));
    }

    #[tokio::test]
    async fn second_run_hits_the_cache() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(counter.clone());
        let store: Arc<dyn ResultStore> = Arc::new(MemoryStore::new());

        let program = Program::new(vec![Command::Print {
            label: "x".into(),
            expr: Expression::call("bench.expensive", vec![Expression::number(4.0)]),
        }]);

        let (r1, _) = run_program(program.clone(), registry.clone(), store.clone()).await;
        assert!(r1.all_completed());
        let (r2, lines) = run_program(program, registry, store).await;
        assert!(r2.all_completed());
        assert_eq!(lines, vec!["x=4".to_string()]);
        assert_eq!(
            counter.load(Ordering::SeqCst),
            1,
            "memoized rerun invokes no primitives"
        );
    }

    #[tokio::test]
    async fn failure_isolates_between_independent_goals() {
        let registry = Arc::new(PrimitiveRegistry::with_builtins());
        let store: Arc<dyn ResultStore> = Arc::new(MemoryStore::new());

        let program = Program::new(vec![
            Command::Print {
                label: "bad".into(),
                expr: Expression::call(
                    "/",
                    vec![Expression::number(1.0), Expression::number(0.0)],
                ),
            },
            Command::Print {
                label: "good".into(),
                expr: Expression::number(7.0),
            },
        ]);

        let (result, lines) = run_program(program, registry, store).await;
        assert!(!result.all_completed());
        assert_eq!(result.exit_code(), 1);

        let bad = result.goals.iter().find(|g| g.label == "bad").unwrap();
        assert!(matches!(&bad.status, GoalStatus::Failed(m) if m.contains("division by zero")));
        let good = result.goals.iter().find(|g| g.label == "good").unwrap();
        assert_eq!(good.status, GoalStatus::Completed);
        assert!(lines.contains(&"good=7".to_string()));
    }

    #[tokio::test]
    async fn dependents_of_a_failed_node_observe_dependency_failure() {
        let registry = Arc::new(PrimitiveRegistry::with_builtins());
        let store: Arc<dyn ResultStore> = Arc::new(MemoryStore::new());

        // bad = 1/0, out = bad + 1: "out" must report its failed dependency.
        let program = Program::new(vec![
            Command::Let {
                name: "bad".into(),
                params: vec![],
                body: Expression::call(
                    "/",
                    vec![Expression::number(1.0), Expression::number(0.0)],
                ),
            },
            Command::Print {
                label: "out".into(),
                expr: Expression::call("+", vec![Expression::var("bad"), Expression::number(1.0)]),
            },
        ]);

        let (result, _) = run_program(program, registry, store).await;
        let out = &result.goals[0];
        match &out.status {
            GoalStatus::Failed(msg) => {
                assert!(msg.contains("dependency"), "{msg}");
                assert!(msg.contains("division by zero"), "{msg}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        let origin = out.first_failed.as_ref().unwrap();
        assert_ne!(origin, &out.node_id, "origin is the failed prerequisite");
    }

    #[tokio::test]
    async fn unresolvable_operator_fails_the_goal() {
        let registry = Arc::new(PrimitiveRegistry::with_builtins());
        let store: Arc<dyn ResultStore> = Arc::new(MemoryStore::new());
        let program = Program::new(vec![Command::Print {
            label: "x".into(),
            expr: Expression::call("no_such_op", vec![Expression::number(1.0)]),
        }]);
        let (result, _) = run_program(program, registry, store).await;
        assert!(matches!(
            &result.goals[0].status,
            GoalStatus::Failed(m) if m.contains("unknown operator")
        ));
    }

    #[tokio::test]
    async fn cancelled_before_start_reports_cancelled_goals() {
        let registry = Arc::new(PrimitiveRegistry::with_builtins());
        let store: Arc<dyn ResultStore> = Arc::new(MemoryStore::new());
        let options = EngineOptions::default();
        options.cancel.cancel();

        let engine = ExecutionEngine::new(store, registry.clone(), options);
        let reducer = Reducer::new(&registry);
        let (_, plan) = reducer
            .reduce_program(&sum_program(), Environment::new())
            .unwrap();
        let (runner, sink) = runner_with_sink();
        let result = engine.run(plan, &runner).await.unwrap();

        assert_eq!(result.goals[0].status, GoalStatus::Cancelled);
        assert!(sink.lines().is_empty());
        assert_eq!(result.exit_code(), 1);
    }

    #[tokio::test]
    async fn print_renders_first_class_closures_opaquely() {
        let registry = Arc::new(PrimitiveRegistry::with_builtins());
        let store: Arc<dyn ResultStore> = Arc::new(MemoryStore::new());
        let program = Program::new(vec![
            Command::Let {
                name: "f".into(),
                params: vec!["x".into()],
                body: Expression::var("x"),
            },
            Command::Print {
                label: "fun".into(),
                expr: Expression::var("f"),
            },
        ]);
        let (result, lines) = run_program(program, registry, store).await;
        assert!(result.all_completed());
        assert_eq!(lines, vec!["fun=<closure>".to_string()]);
    }
}
