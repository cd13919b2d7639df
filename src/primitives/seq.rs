// src/primitives/seq.rs
//
// The `seq` namespace: dataset-like operators over sequences. Registered
// dynamically; the operator table is built on first use.

use crate::value::Value;

use super::{basic, expect_sequence, Namespace, PrimitiveError};

pub(super) fn build() -> Namespace {
    let mut ns = Namespace::new("seq");

    ns.register("range", "integer sequence [start, end)", basic::range);
    ns.register("sum", "sum of a numeric sequence", basic::sum);
    ns.register("nth", "element of a sequence by zero-based index", basic::nth);
    ns.register("length", "number of elements in a sequence", |args| {
        Ok(Value::Number(expect_sequence(args, "0")?.len() as f64))
    });
    ns.register("first", "first element of a non-empty sequence", |args| {
        expect_sequence(args, "0")?
            .first()
            .cloned()
            .ok_or_else(|| PrimitiveError::Failure("empty sequence".into()))
    });
    ns.register("last", "last element of a non-empty sequence", |args| {
        expect_sequence(args, "0")?
            .last()
            .cloned()
            .ok_or_else(|| PrimitiveError::Failure("empty sequence".into()))
    });
    ns.register("reverse", "sequence with elements in reverse order", |args| {
        let mut items: Vec<Value> = expect_sequence(args, "0")?.to_vec();
        items.reverse();
        Ok(Value::Sequence(items))
    });

    ns
}
