// src/reducer.rs
//
// =============================================================================
// VOXLOGICA: REDUCER
// =============================================================================
//
// AST -> WorkPlan translation under an environment.
//
// Responsibilities:
// 1. Persistent environments (immutable extension, structural sharing).
// 2. Expression reduction with node-level memoization.
// 3. User-defined function inlining (call-by-value on node ids).
// 4. For-loops reduce to a single reserved operation plus a closure node;
//    per-element work is expanded later, at execution time.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ast::{Command, Expression, Program};
use crate::errors::EngineError;
use crate::identity::IdentityPolicy;
use crate::plan::{
    ClosureNode, GoalKind, LazyCompilation, Node, NodeId, WorkPlan, FOR_OPERATOR,
};
use crate::primitives::{PrimitiveRegistry, ResolutionError};
use crate::value::Value;

// ============================================================================
// 1. ENVIRONMENTS
// ============================================================================

/// What a name stands for during reduction.
#[derive(Debug, Clone)]
pub enum Binding {
    /// An already-reduced node.
    Constant(NodeId),
    /// A user-defined function; applications inline its body.
    Function(Arc<FunctionDef>),
}

#[derive(Debug)]
pub struct FunctionDef {
    pub parameters: Vec<String>,
    pub body: Expression,
    /// Environment at the definition site (lexical capture).
    pub environment: Environment,
}

/// An immutable mapping from identifiers to bindings. Extension creates a
/// new environment sharing the parent, so closures capture cheaply and
/// plans may hold many environments without copying.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    head: Option<Arc<Frame>>,
}

#[derive(Debug)]
struct Frame {
    name: String,
    binding: Binding,
    parent: Option<Arc<Frame>>,
}

impl Environment {
    pub fn new() -> Environment {
        Environment::default()
    }

    /// A new environment with `name` bound, shadowing any outer binding.
    pub fn bind(&self, name: impl AsRef<str>, binding: Binding) -> Environment {
        Environment {
            head: Some(Arc::new(Frame {
                name: name.as_ref().to_string(),
                binding,
                parent: self.head.clone(),
            })),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        let mut frame = self.head.as_deref();
        while let Some(f) = frame {
            if f.name == name {
                return Some(&f.binding);
            }
            frame = f.parent.as_deref();
        }
        None
    }

    /// Visible bindings, innermost shadowing outer ones.
    pub fn bindings(&self) -> Vec<(String, Binding)> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        let mut frame = self.head.as_deref();
        while let Some(f) = frame {
            if seen.insert(f.name.clone()) {
                out.push((f.name.clone(), f.binding.clone()));
            }
            frame = f.parent.as_deref();
        }
        out
    }
}

// ============================================================================
// 2. THE REDUCER
// ============================================================================

pub struct Reducer<'r> {
    registry: &'r PrimitiveRegistry,
    policy: IdentityPolicy,
}

impl<'r> Reducer<'r> {
    pub fn new(registry: &'r PrimitiveRegistry) -> Reducer<'r> {
        Reducer {
            registry,
            policy: IdentityPolicy::default(),
        }
    }

    pub fn with_policy(registry: &'r PrimitiveRegistry, policy: IdentityPolicy) -> Reducer<'r> {
        Reducer { registry, policy }
    }

    pub fn policy(&self) -> IdentityPolicy {
        self.policy
    }

    /// Reduces a whole program to a work plan, threading the environment
    /// through the command list.
    pub fn reduce_program(
        &self,
        program: &Program,
        env: Environment,
    ) -> Result<(Environment, WorkPlan), EngineError> {
        let mut plan = WorkPlan::new();
        let mut env = env;

        for cmd in &program.commands {
            match cmd {
                Command::Let { name, params, body } if params.is_empty() => {
                    let id = self.reduce_expr(&env, &mut plan, body)?;
                    env = env.bind(name, Binding::Constant(id));
                }
                Command::Let { name, params, body } => {
                    // Lexical capture: the body sees the environment as it
                    // is now, not as it will be at the call site.
                    let def = FunctionDef {
                        parameters: params.clone(),
                        body: body.clone(),
                        environment: env.clone(),
                    };
                    env = env.bind(name, Binding::Function(Arc::new(def)));
                }
                Command::Import { namespace } => {
                    if !self.registry.has_namespace(namespace) {
                        return Err(ResolutionError::UnknownNamespace {
                            namespace: namespace.clone(),
                        }
                        .into());
                    }
                    plan.add_import(namespace);
                }
                Command::Print { label, expr } => {
                    let id = self.reduce_expr(&env, &mut plan, expr)?;
                    plan.add_goal(GoalKind::Print, label, id);
                }
                Command::Save { path, expr } => {
                    let id = self.reduce_expr(&env, &mut plan, expr)?;
                    plan.add_goal(GoalKind::Save, path, id);
                }
            }
        }

        log::debug!(
            "reduced program: {} nodes, {} goals, imports {:?}",
            plan.len(),
            plan.goals().len(),
            plan.imports()
        );
        Ok((env, plan))
    }

    /// Reduces one expression to a node id, reusing existing plan entries.
    pub fn reduce_expr(
        &self,
        env: &Environment,
        plan: &mut WorkPlan,
        expr: &Expression,
    ) -> Result<NodeId, EngineError> {
        match expr {
            Expression::Number { value } => {
                Ok(plan.insert(Node::Constant(Value::Number(*value)), self.policy)?.0)
            }
            Expression::Bool { value } => {
                Ok(plan.insert(Node::Constant(Value::Bool(*value)), self.policy)?.0)
            }
            Expression::String { value } => Ok(plan
                .insert(Node::Constant(Value::String(value.clone())), self.policy)?
                .0),

            Expression::Var { name } => match env.lookup(name) {
                Some(Binding::Constant(id)) => Ok(id.clone()),
                // A function referenced as a value becomes an addressable
                // closure node.
                Some(Binding::Function(def)) => {
                    let closure = ClosureNode {
                        parameters: def.parameters.clone(),
                        body: def.body.clone(),
                        environment: def.environment.clone(),
                    };
                    Ok(plan.insert(Node::Closure(closure), self.policy)?.0)
                }
                // Unbound identifiers are nullary operator applications.
                None => Ok(plan
                    .insert(Node::operation(name.clone(), BTreeMap::new()), self.policy)?
                    .0),
            },

            Expression::Call { operator, args } => {
                let mut arg_ids = Vec::with_capacity(args.len());
                for a in args {
                    arg_ids.push(self.reduce_expr(env, plan, a)?);
                }

                match env.lookup(operator) {
                    Some(Binding::Function(def)) => {
                        if def.parameters.len() != arg_ids.len() {
                            return Err(EngineError::Argument {
                                operator: operator.clone(),
                                message: format!(
                                    "expects {} argument(s), got {}",
                                    def.parameters.len(),
                                    arg_ids.len()
                                ),
                            });
                        }
                        // Inline: bind parameters to the argument node ids
                        // and reduce the body under the captured env.
                        let mut call_env = def.environment.clone();
                        for (param, id) in def.parameters.iter().zip(arg_ids) {
                            call_env = call_env.bind(param, Binding::Constant(id));
                        }
                        let def = def.clone();
                        self.reduce_expr(&call_env, plan, &def.body)
                    }
                    Some(Binding::Constant(id)) => {
                        if arg_ids.is_empty() {
                            Ok(id.clone())
                        } else {
                            Err(EngineError::Argument {
                                operator: operator.clone(),
                                message: "bound value is not a function".into(),
                            })
                        }
                    }
                    None => Ok(plan
                        .insert(
                            Node::operation(operator.clone(), Node::positional(&arg_ids)),
                            self.policy,
                        )?
                        .0),
                }
            }

            Expression::For {
                variable,
                source,
                body,
            } => {
                let source_id = self.reduce_expr(env, plan, source)?;
                let closure = ClosureNode {
                    parameters: vec![variable.clone()],
                    body: (**body).clone(),
                    environment: env.clone(),
                };
                let (closure_id, _) = plan.insert(Node::Closure(closure), self.policy)?;

                let mut arguments = BTreeMap::new();
                arguments.insert("closure".to_string(), closure_id);
                arguments.insert("source".to_string(), source_id);
                Ok(plan
                    .insert(Node::operation(FOR_OPERATOR, arguments), self.policy)?
                    .0)
            }
        }
    }

    /// Reduces a deferred compilation: the recorded expression under its
    /// recorded environment extended with the recorded bindings.
    pub fn reduce_deferred(
        &self,
        plan: &mut WorkPlan,
        lazy: &LazyCompilation,
    ) -> Result<NodeId, EngineError> {
        let mut env = lazy.environment.clone();
        for (name, id) in &lazy.bindings {
            env = env.bind(name, Binding::Constant(id.clone()));
        }
        self.reduce_expr(&env, plan, &lazy.expression)
    }

    /// Expands every pending deferred compilation in the plan, returning
    /// the result node ids in expansion order.
    pub fn expand_pending(&self, plan: &mut WorkPlan) -> Result<Vec<NodeId>, EngineError> {
        let mut out = Vec::new();
        while plan.has_pending() {
            for lazy in plan.take_pending() {
                out.push(self.reduce_deferred(plan, &lazy)?);
            }
        }
        Ok(out)
    }
}
