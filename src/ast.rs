//! Pre-parsed program representation.
//!
//! The concrete grammar lives in the frontend; the engine consumes a
//! command list that has already been parsed. The canonical on-disk form
//! is a YAML (or JSON) document describing the same tree, which keeps
//! program fixtures VCS-friendly and lets frontends in other processes
//! hand programs over without linking the parser.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// A user-facing error for program loading/validation.
///
/// Kept human-readable and actionable: what to fix, where.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("I/O error while reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse program document: {0}")]
    Parse(String),

    #[error("invalid program: {0}")]
    Validation(String),
}

// =============================================================================
// Expressions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expression {
    Number {
        value: f64,
    },
    Bool {
        value: bool,
    },
    String {
        value: String,
    },
    /// A bare identifier. Resolves against the environment first and falls
    /// back to a nullary operator call.
    Var {
        name: String,
    },
    Call {
        operator: String,
        #[serde(default)]
        args: Vec<Expression>,
    },
    /// Per-element iteration. Never pre-expanded by the reducer; the
    /// scheduler expands it one element at a time.
    For {
        variable: String,
        source: Box<Expression>,
        body: Box<Expression>,
    },
}

impl Expression {
    pub fn number(value: f64) -> Expression {
        Expression::Number { value }
    }

    pub fn bool(value: bool) -> Expression {
        Expression::Bool { value }
    }

    pub fn string(value: impl Into<String>) -> Expression {
        Expression::String {
            value: value.into(),
        }
    }

    pub fn var(name: impl Into<String>) -> Expression {
        Expression::Var { name: name.into() }
    }

    pub fn call(operator: impl Into<String>, args: Vec<Expression>) -> Expression {
        Expression::Call {
            operator: operator.into(),
            args,
        }
    }

    pub fn for_in(
        variable: impl Into<String>,
        source: Expression,
        body: Expression,
    ) -> Expression {
        Expression::For {
            variable: variable.into(),
            source: Box::new(source),
            body: Box::new(body),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Number { value } => write!(f, "{value}"),
            Expression::Bool { value } => write!(f, "{value}"),
            Expression::String { value } => write!(f, "{value:?}"),
            Expression::Var { name } => write!(f, "{name}"),
            Expression::Call { operator, args } => {
                write!(f, "{operator}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            Expression::For {
                variable,
                source,
                body,
            } => write!(f, "for {variable} in {source} do {body}"),
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// `let name = body` or `let name(p1,...,pk) = body`.
    Let {
        name: String,
        #[serde(default)]
        params: Vec<String>,
        body: Expression,
    },
    Import {
        namespace: String,
    },
    Print {
        label: String,
        expr: Expression,
    },
    Save {
        path: String,
        expr: Expression,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub commands: Vec<Command>,
}

impl Program {
    pub fn new(commands: Vec<Command>) -> Program {
        Program { commands }
    }

    /// Load a program document, choosing the format by file extension
    /// (`.yaml`/`.yml` vs JSON).
    pub fn load(path: impl AsRef<Path>) -> Result<Program, ProgramError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| ProgramError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|s| s.to_str()),
            Some("yaml") | Some("yml")
        );
        let program: Program = if is_yaml {
            serde_yaml::from_str(&raw).map_err(|e| ProgramError::Parse(e.to_string()))?
        } else {
            serde_json::from_str(&raw).map_err(|e| ProgramError::Parse(e.to_string()))?
        };

        program.validate()?;
        Ok(program)
    }

    /// Validate command structure. Intentionally strict: fail fast with
    /// actionable errors rather than letting malformed programs reach the
    /// reducer.
    pub fn validate(&self) -> Result<(), ProgramError> {
        for (i, cmd) in self.commands.iter().enumerate() {
            let at = |msg: String| ProgramError::Validation(format!("command {}: {msg}", i + 1));
            match cmd {
                Command::Let { name, params, body } => {
                    if name.trim().is_empty() {
                        return Err(at("let binding requires a name".into()));
                    }
                    let mut seen = HashSet::new();
                    for p in params {
                        if p.trim().is_empty() {
                            return Err(at(format!("function '{name}' has an empty parameter")));
                        }
                        if !seen.insert(p.as_str()) {
                            return Err(at(format!(
                                "function '{name}' repeats parameter '{p}'"
                            )));
                        }
                    }
                    validate_expr(body).map_err(at)?;
                }
                Command::Import { namespace } => {
                    if namespace.trim().is_empty() {
                        return Err(at("import requires a namespace".into()));
                    }
                }
                Command::Print { label, expr } => {
                    if label.trim().is_empty() {
                        return Err(at("print requires a label".into()));
                    }
                    validate_expr(expr).map_err(at)?;
                }
                Command::Save { path, expr } => {
                    if path.trim().is_empty() {
                        return Err(at("save requires a filename".into()));
                    }
                    validate_expr(expr).map_err(at)?;
                }
            }
        }
        Ok(())
    }
}

fn validate_expr(expr: &Expression) -> Result<(), String> {
    match expr {
        Expression::Number { .. } | Expression::Bool { .. } | Expression::String { .. } => Ok(()),
        Expression::Var { name } => {
            if name.trim().is_empty() {
                Err("empty identifier".into())
            } else {
                Ok(())
            }
        }
        Expression::Call { operator, args } => {
            if operator.trim().is_empty() {
                return Err("call with an empty operator name".into());
            }
            for a in args {
                validate_expr(a)?;
            }
            Ok(())
        }
        Expression::For {
            variable,
            source,
            body,
        } => {
            if variable.trim().is_empty() {
                return Err("for-loop requires a variable name".into());
            }
            validate_expr(source)?;
            validate_expr(body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sum_program_yaml() {
        let yaml = r#"
commands:
  - command: let
    name: a
    body: { kind: number, value: 1 }
  - command: let
    name: b
    body: { kind: number, value: 2 }
  - command: let
    name: c
    body:
      kind: call
      operator: "+"
      args:
        - { kind: var, name: a }
        - { kind: var, name: b }
  - command: print
    label: sum
    expr: { kind: var, name: c }
"#;
        let program: Program = serde_yaml::from_str(yaml).unwrap();
        program.validate().unwrap();
        assert_eq!(program.commands.len(), 4);
        assert_eq!(
            program.commands[2],
            Command::Let {
                name: "c".into(),
                params: vec![],
                body: Expression::call("+", vec![Expression::var("a"), Expression::var("b")]),
            }
        );
    }

    #[test]
    fn duplicate_parameter_rejected() {
        let program = Program::new(vec![Command::Let {
            name: "f".into(),
            params: vec!["x".into(), "x".into()],
            body: Expression::var("x"),
        }]);
        let err = program.validate().unwrap_err();
        assert!(err.to_string().contains("repeats parameter"));
    }

    #[test]
    fn empty_print_label_rejected() {
        let program = Program::new(vec![Command::Print {
            label: " ".into(),
            expr: Expression::number(1.0),
        }]);
        assert!(program.validate().is_err());
    }
}
