// src/primitives/mod.rs
//
// =============================================================================
// VOXLOGICA: PRIMITIVE REGISTRY
// =============================================================================
//
// Namespace-qualified operator lookup.
//
// Responsibilities:
// 1. Static namespaces (builtin operator tables).
// 2. Dynamic namespaces: a builder runs on first use and returns the
//    operator table (e.g. introspecting an external library).
// 3. Resolution of unqualified names: `default` first, then imported
//    namespaces in import order; a tie across imports is an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::value::Value;

mod basic;
mod seq;

/// The namespace consulted for unqualified operators before any imports.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Already-resolved arguments, keyed `"0"`, `"1"`, ... or by name.
/// BTreeMap iteration gives the canonical argument order.
pub type ArgMap = BTreeMap<String, Value>;

// ============================================================================
// 1. ERRORS
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolutionError {
    #[error("unknown operator '{operator}'")]
    UnknownOperator { operator: String },

    #[error("unknown namespace '{namespace}'")]
    UnknownNamespace { namespace: String },

    #[error("ambiguous '{operator}' in {{{namespaces}}}")]
    Ambiguous {
        operator: String,
        /// Comma-separated list of the namespaces that collide.
        namespaces: String,
    },
}

/// Failure raised by a primitive during invocation.
#[derive(Debug, Clone, Error)]
pub enum PrimitiveError {
    /// Arguments violate the primitive's documented constraints.
    #[error("{0}")]
    Argument(String),
    /// The computation itself failed.
    #[error("{0}")]
    Failure(String),
}

// ============================================================================
// 2. PRIMITIVES
// ============================================================================

/// A pure function of its keyword arguments. Primitives never perform
/// goal-level side effects; file output belongs to save goals.
pub trait Primitive: Send + Sync {
    fn describe(&self) -> &str;
    fn invoke(&self, args: &ArgMap) -> Result<Value, PrimitiveError>;
}

impl std::fmt::Debug for dyn Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Primitive({})", self.describe())
    }
}

/// Adapter turning a plain closure into a [`Primitive`].
struct FnPrimitive<F> {
    description: String,
    f: F,
}

impl<F> Primitive for FnPrimitive<F>
where
    F: Fn(&ArgMap) -> Result<Value, PrimitiveError> + Send + Sync,
{
    fn describe(&self) -> &str {
        &self.description
    }

    fn invoke(&self, args: &ArgMap) -> Result<Value, PrimitiveError> {
        (self.f)(args)
    }
}

// ============================================================================
// 3. NAMESPACES
// ============================================================================

pub struct Namespace {
    name: String,
    ops: BTreeMap<String, Arc<dyn Primitive>>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Namespace {
        Namespace {
            name: name.into(),
            ops: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a closure under `op`.
    pub fn register<F>(&mut self, op: impl Into<String>, description: impl Into<String>, f: F)
    where
        F: Fn(&ArgMap) -> Result<Value, PrimitiveError> + Send + Sync + 'static,
    {
        self.ops.insert(
            op.into(),
            Arc::new(FnPrimitive {
                description: description.into(),
                f,
            }),
        );
    }

    pub fn register_primitive(&mut self, op: impl Into<String>, primitive: Arc<dyn Primitive>) {
        self.ops.insert(op.into(), primitive);
    }

    pub fn get(&self, op: &str) -> Option<Arc<dyn Primitive>> {
        self.ops.get(op).cloned()
    }

    pub fn operators(&self) -> impl Iterator<Item = (&String, &Arc<dyn Primitive>)> {
        self.ops.iter()
    }
}

// ============================================================================
// 4. THE REGISTRY
// ============================================================================

type NamespaceBuilder = Arc<dyn Fn() -> Namespace + Send + Sync>;

#[derive(Default)]
pub struct PrimitiveRegistry {
    namespaces: DashMap<String, Arc<Namespace>>,
    /// Builders for namespaces materialized on first use. Read-mostly;
    /// duplicate population is harmless (both builds are identical).
    dynamic: DashMap<String, NamespaceBuilder>,
}

impl PrimitiveRegistry {
    pub fn new() -> PrimitiveRegistry {
        PrimitiveRegistry::default()
    }

    /// Registry with the builtin namespaces: `default` (arithmetic,
    /// comparison, boolean, string operators) and `seq` (dataset-like
    /// operators, built dynamically).
    pub fn with_builtins() -> PrimitiveRegistry {
        let registry = PrimitiveRegistry::new();
        registry.add_namespace(basic::namespace());
        registry.add_dynamic("seq", Arc::new(seq::build));
        registry
    }

    pub fn add_namespace(&self, ns: Namespace) {
        self.namespaces.insert(ns.name.clone(), Arc::new(ns));
    }

    pub fn add_dynamic(&self, name: impl Into<String>, builder: NamespaceBuilder) {
        self.dynamic.insert(name.into(), builder);
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.contains_key(name) || self.dynamic.contains_key(name)
    }

    /// Fetches a namespace, materializing a dynamic one on first access.
    pub fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        if let Some(ns) = self.namespaces.get(name) {
            return Some(ns.value().clone());
        }
        let builder = self.dynamic.get(name)?.value().clone();
        let built = Arc::new(builder());
        let entry = self
            .namespaces
            .entry(name.to_string())
            .or_insert_with(|| built);
        Some(entry.value().clone())
    }

    /// Resolves an operator symbol against the imported namespaces.
    ///
    /// Qualified symbols (`ns.op`) go straight to their namespace.
    /// Unqualified symbols try `default`, then the imports in order; more
    /// than one import defining the symbol is an error.
    pub fn resolve(
        &self,
        operator: &str,
        imports: &[String],
    ) -> Result<Arc<dyn Primitive>, ResolutionError> {
        if let Some((ns_name, op)) = operator.split_once('.') {
            let ns = self
                .namespace(ns_name)
                .ok_or_else(|| ResolutionError::UnknownNamespace {
                    namespace: ns_name.to_string(),
                })?;
            return ns
                .get(op)
                .ok_or_else(|| ResolutionError::UnknownOperator {
                    operator: operator.to_string(),
                });
        }

        if let Some(ns) = self.namespace(DEFAULT_NAMESPACE) {
            if let Some(p) = ns.get(operator) {
                return Ok(p);
            }
        }

        let mut matches: Vec<(String, Arc<dyn Primitive>)> = Vec::new();
        for ns_name in imports {
            if let Some(ns) = self.namespace(ns_name) {
                if let Some(p) = ns.get(operator) {
                    matches.push((ns_name.clone(), p));
                }
            }
        }

        match matches.len() {
            0 => Err(ResolutionError::UnknownOperator {
                operator: operator.to_string(),
            }),
            1 => Ok(matches.remove(0).1),
            _ => Err(ResolutionError::Ambiguous {
                operator: operator.to_string(),
                namespaces: matches
                    .iter()
                    .map(|(ns, _)| ns.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    /// All namespaces with their operators and descriptions. Materializes
    /// every dynamic namespace.
    pub fn list(&self) -> BTreeMap<String, Vec<(String, String)>> {
        let names: Vec<String> = self
            .namespaces
            .iter()
            .map(|e| e.key().clone())
            .chain(self.dynamic.iter().map(|e| e.key().clone()))
            .collect();

        let mut out = BTreeMap::new();
        for name in names {
            if let Some(ns) = self.namespace(&name) {
                let ops = ns
                    .operators()
                    .map(|(op, p)| (op.clone(), p.describe().to_string()))
                    .collect();
                out.insert(name, ops);
            }
        }
        out
    }
}

// ============================================================================
// 5. ARGUMENT HELPERS (used by builtin namespaces)
// ============================================================================

pub fn expect_value<'a>(args: &'a ArgMap, key: &str) -> Result<&'a Value, PrimitiveError> {
    args.get(key)
        .ok_or_else(|| PrimitiveError::Argument(format!("missing argument '{key}'")))
}

pub fn expect_number(args: &ArgMap, key: &str) -> Result<f64, PrimitiveError> {
    let v = expect_value(args, key)?;
    v.as_number()
        .ok_or_else(|| PrimitiveError::Argument(format!("argument '{key}' must be a number")))
}

pub fn expect_bool(args: &ArgMap, key: &str) -> Result<bool, PrimitiveError> {
    let v = expect_value(args, key)?;
    v.as_bool()
        .ok_or_else(|| PrimitiveError::Argument(format!("argument '{key}' must be a boolean")))
}

pub fn expect_sequence<'a>(args: &'a ArgMap, key: &str) -> Result<&'a [Value], PrimitiveError> {
    let v = expect_value(args, key)?;
    v.as_sequence()
        .ok_or_else(|| PrimitiveError::Argument(format!("argument '{key}' must be a sequence")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &ArgMap) -> Result<Value, PrimitiveError> {
        Ok(Value::Bool(true))
    }

    #[test]
    fn qualified_resolution() {
        let registry = PrimitiveRegistry::with_builtins();
        assert!(registry.resolve("seq.range", &[]).is_ok());
        assert!(matches!(
            registry.resolve("nope.range", &[]),
            Err(ResolutionError::UnknownNamespace { .. })
        ));
    }

    #[test]
    fn default_namespace_wins_over_imports() {
        let registry = PrimitiveRegistry::with_builtins();
        let mut ns = Namespace::new("imaging");
        ns.register("+", "shadowed by default", noop);
        registry.add_namespace(ns);

        // "+" resolves via default even though "imaging" also defines it.
        let p = registry.resolve("+", &["imaging".to_string()]).unwrap();
        let mut args = ArgMap::new();
        args.insert("0".into(), Value::Number(1.0));
        args.insert("1".into(), Value::Number(2.0));
        assert_eq!(p.invoke(&args).unwrap(), Value::Number(3.0));
    }

    #[test]
    fn ambiguity_across_imports_is_an_error() {
        let registry = PrimitiveRegistry::with_builtins();
        for name in ["ns_a", "ns_b"] {
            let mut ns = Namespace::new(name);
            ns.register("blur", "gaussian blur", noop);
            registry.add_namespace(ns);
        }

        let imports = vec!["ns_a".to_string(), "ns_b".to_string()];
        let err = registry.resolve("blur", &imports).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ambiguous 'blur'"), "{msg}");
        assert!(msg.contains("ns_a") && msg.contains("ns_b"), "{msg}");

        // Qualifying disambiguates.
        assert!(registry.resolve("ns_a.blur", &imports).is_ok());
    }

    #[test]
    fn dynamic_namespace_builds_on_first_use() {
        let registry = PrimitiveRegistry::new();
        registry.add_dynamic(
            "lazy_ns",
            Arc::new(|| {
                let mut ns = Namespace::new("lazy_ns");
                ns.register("touch", "marker", noop);
                ns
            }),
        );

        assert!(registry.has_namespace("lazy_ns"));
        assert!(registry.resolve("lazy_ns.touch", &[]).is_ok());
        // Second resolve hits the materialized table.
        assert!(registry.resolve("lazy_ns.touch", &[]).is_ok());
    }

    #[test]
    fn listing_includes_dynamic_namespaces() {
        let registry = PrimitiveRegistry::with_builtins();
        let listing = registry.list();
        assert!(listing.contains_key("default"));
        let seq_ops = &listing["seq"];
        assert!(seq_ops.iter().any(|(op, _)| op == "range"));
    }
}
