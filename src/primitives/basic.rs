// src/primitives/basic.rs
//
// The `default` namespace: arithmetic, comparison, boolean and string
// operators, plus the sequence constructors programs use without imports.

use crate::value::Value;

use super::{
    expect_bool, expect_number, expect_sequence, expect_value, ArgMap, Namespace, PrimitiveError,
};

pub(super) fn namespace() -> Namespace {
    let mut ns = Namespace::new(super::DEFAULT_NAMESPACE);

    // --- Arithmetic -------------------------------------------------------
    ns.register("+", "addition", |args| binary(args, |a, b| Ok(a + b)));
    ns.register("-", "subtraction", |args| binary(args, |a, b| Ok(a - b)));
    ns.register("*", "multiplication", |args| binary(args, |a, b| Ok(a * b)));
    ns.register("/", "division", |args| {
        binary(args, |a, b| {
            if b == 0.0 {
                Err(PrimitiveError::Failure("division by zero".into()))
            } else {
                Ok(a / b)
            }
        })
    });
    ns.register("min", "minimum of two numbers", |args| {
        binary(args, |a, b| Ok(a.min(b)))
    });
    ns.register("max", "maximum of two numbers", |args| {
        binary(args, |a, b| Ok(a.max(b)))
    });
    ns.register("abs", "absolute value", |args| {
        Ok(Value::Number(expect_number(args, "0")?.abs()))
    });
    ns.register("floor", "round towards negative infinity", |args| {
        Ok(Value::Number(expect_number(args, "0")?.floor()))
    });
    ns.register("ceil", "round towards positive infinity", |args| {
        Ok(Value::Number(expect_number(args, "0")?.ceil()))
    });

    // --- Comparison -------------------------------------------------------
    ns.register("=", "equality", |args| {
        let a = expect_value(args, "0")?;
        let b = expect_value(args, "1")?;
        Ok(Value::Bool(a == b))
    });
    ns.register("<", "less than", |args| compare(args, |a, b| a < b));
    ns.register("<=", "less than or equal", |args| compare(args, |a, b| a <= b));
    ns.register(">", "greater than", |args| compare(args, |a, b| a > b));
    ns.register(">=", "greater than or equal", |args| compare(args, |a, b| a >= b));

    // --- Boolean ----------------------------------------------------------
    ns.register("and", "logical conjunction", |args| {
        Ok(Value::Bool(expect_bool(args, "0")? && expect_bool(args, "1")?))
    });
    ns.register("or", "logical disjunction", |args| {
        Ok(Value::Bool(expect_bool(args, "0")? || expect_bool(args, "1")?))
    });
    ns.register("not", "logical negation", |args| {
        Ok(Value::Bool(!expect_bool(args, "0")?))
    });
    ns.register("if", "conditional selection: if(cond, then, else)", |args| {
        let cond = expect_bool(args, "0")?;
        let branch = if cond { "1" } else { "2" };
        Ok(expect_value(args, branch)?.clone())
    });

    // --- Strings ----------------------------------------------------------
    ns.register("concat", "string concatenation", |args| {
        let mut out = String::new();
        for (_, v) in args.iter() {
            out.push_str(&v.to_string());
        }
        Ok(Value::String(out))
    });

    // --- Sequences (unqualified constructors) -----------------------------
    ns.register("range", "integer sequence [start, end)", range);
    ns.register("length", "number of elements in a sequence", |args| {
        Ok(Value::Number(expect_sequence(args, "0")?.len() as f64))
    });
    ns.register("sum", "sum of a numeric sequence", sum);
    ns.register("nth", "element of a sequence by zero-based index", nth);

    ns
}

fn binary(
    args: &ArgMap,
    f: impl Fn(f64, f64) -> Result<f64, PrimitiveError>,
) -> Result<Value, PrimitiveError> {
    let a = expect_number(args, "0")?;
    let b = expect_number(args, "1")?;
    f(a, b).map(Value::Number)
}

fn compare(args: &ArgMap, f: impl Fn(f64, f64) -> bool) -> Result<Value, PrimitiveError> {
    let a = expect_number(args, "0")?;
    let b = expect_number(args, "1")?;
    Ok(Value::Bool(f(a, b)))
}

pub(super) fn range(args: &ArgMap) -> Result<Value, PrimitiveError> {
    let start = expect_number(args, "0")?;
    let end = expect_number(args, "1")?;
    if !start.is_finite() || !end.is_finite() {
        return Err(PrimitiveError::Argument("range bounds must be finite".into()));
    }
    let start = start as i64;
    let end = end as i64;
    let items = (start..end.max(start)).map(|i| Value::Number(i as f64));
    Ok(Value::sequence(items))
}

pub(super) fn sum(args: &ArgMap) -> Result<Value, PrimitiveError> {
    let items = expect_sequence(args, "0")?;
    let mut total = 0.0;
    for v in items {
        total += v.as_number().ok_or_else(|| {
            PrimitiveError::Argument("sum requires a sequence of numbers".into())
        })?;
    }
    Ok(Value::Number(total))
}

pub(super) fn nth(args: &ArgMap) -> Result<Value, PrimitiveError> {
    let items = expect_sequence(args, "0")?;
    let index = expect_number(args, "1")?;
    if index < 0.0 || index.fract() != 0.0 {
        return Err(PrimitiveError::Argument(
            "index must be a non-negative integer".into(),
        ));
    }
    items
        .get(index as usize)
        .cloned()
        .ok_or_else(|| {
            PrimitiveError::Failure(format!(
                "index {} out of bounds for sequence of length {}",
                index as usize,
                items.len()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::super::PrimitiveRegistry;
    use super::*;

    fn positional(values: &[Value]) -> ArgMap {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect()
    }

    fn invoke(op: &str, values: &[Value]) -> Result<Value, PrimitiveError> {
        let registry = PrimitiveRegistry::with_builtins();
        let p = registry.resolve(op, &[]).unwrap();
        p.invoke(&positional(values))
    }

    #[test]
    fn arithmetic() {
        assert_eq!(
            invoke("+", &[Value::Number(1.0), Value::Number(2.0)]).unwrap(),
            Value::Number(3.0)
        );
        assert_eq!(
            invoke("max", &[Value::Number(1.0), Value::Number(2.0)]).unwrap(),
            Value::Number(2.0)
        );
    }

    #[test]
    fn division_by_zero_fails() {
        let err = invoke("/", &[Value::Number(1.0), Value::Number(0.0)]).unwrap_err();
        assert!(matches!(err, PrimitiveError::Failure(_)));
    }

    #[test]
    fn range_is_end_exclusive() {
        let v = invoke("range", &[Value::Number(0.0), Value::Number(5.0)]).unwrap();
        assert_eq!(v.as_sequence().unwrap().len(), 5);
        assert_eq!(v.to_string(), "[0, 1, 2, 3, 4]");
    }

    #[test]
    fn reversed_range_is_empty() {
        let v = invoke("range", &[Value::Number(5.0), Value::Number(0.0)]).unwrap();
        assert_eq!(v.as_sequence().unwrap().len(), 0);
    }

    #[test]
    fn type_mismatch_is_an_argument_error() {
        let err = invoke("+", &[Value::Bool(true), Value::Number(1.0)]).unwrap_err();
        assert!(matches!(err, PrimitiveError::Argument(_)));
    }
}
