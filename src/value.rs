//! Runtime values flowing through the DAG.
//!
//! The engine treats values opaquely: primitives produce them, the store
//! persists the serializable ones, goals render them. Values from external
//! primitive libraries (images, meshes) travel as [`OpaqueValue`] handles;
//! those stay process-local unless the producing primitive supplies a
//! deterministic fingerprint for content addressing.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// =============================================================================
// Value
// =============================================================================

#[derive(Debug, Clone)]
pub enum Value {
    Number(f64),
    Bool(bool),
    String(String),
    Sequence(Vec<Value>),
    Opaque(OpaqueValue),
}

/// A handle to a primitive-library object the engine cannot introspect.
#[derive(Clone)]
pub struct OpaqueValue {
    type_name: Arc<str>,
    /// Deterministic representation supplied by the producing primitive.
    /// `None` makes the value non-identifiable (no memoization).
    fingerprint: Option<Arc<str>>,
    payload: Arc<dyn Any + Send + Sync>,
}

impl OpaqueValue {
    pub fn new<T: Any + Send + Sync>(
        type_name: impl Into<Arc<str>>,
        fingerprint: Option<String>,
        payload: T,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            fingerprint: fingerprint.map(Arc::from),
            payload: Arc::new(payload),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn downcast<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for OpaqueValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueValue")
            .field("type_name", &self.type_name)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

// =============================================================================
// Wire format (store blobs, save goals)
// =============================================================================

/// The serializable subset of [`Value`], as stored in result blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
enum WireValue {
    Number(f64),
    Bool(bool),
    String(String),
    Sequence(Vec<WireValue>),
}

impl WireValue {
    fn from_value(value: &Value) -> Option<WireValue> {
        match value {
            Value::Number(n) => {
                // JSON cannot carry NaN / infinities.
                if n.is_finite() {
                    Some(WireValue::Number(*n))
                } else {
                    None
                }
            }
            Value::Bool(b) => Some(WireValue::Bool(*b)),
            Value::String(s) => Some(WireValue::String(s.clone())),
            Value::Sequence(items) => items
                .iter()
                .map(WireValue::from_value)
                .collect::<Option<Vec<_>>>()
                .map(WireValue::Sequence),
            Value::Opaque(_) => None,
        }
    }

    fn into_value(self) -> Value {
        match self {
            WireValue::Number(n) => Value::Number(n),
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::String(s) => Value::String(s),
            WireValue::Sequence(items) => {
                Value::Sequence(items.into_iter().map(WireValue::into_value).collect())
            }
        }
    }
}

/// Blob type tag written to the store's `data_type` column.
pub const BLOB_TYPE_JSON: &str = "json";

impl Value {
    pub fn sequence(items: impl IntoIterator<Item = Value>) -> Value {
        Value::Sequence(items.into_iter().collect())
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(items) => Some(items),
            _ => None,
        }
    }

    /// Encodes the value as a store blob. `None` marks the value as
    /// non-serializable; the store then retains it in memory only.
    pub fn to_blob(&self) -> Option<Vec<u8>> {
        let wire = WireValue::from_value(self)?;
        serde_json::to_vec(&wire).ok()
    }

    pub fn from_blob(data: &[u8], data_type: &str) -> Result<Value, String> {
        if data_type != BLOB_TYPE_JSON {
            return Err(format!("unknown blob type '{data_type}'"));
        }
        let wire: WireValue =
            serde_json::from_slice(data).map_err(|e| format!("corrupt result blob: {e}"))?;
        Ok(wire.into_value())
    }

    /// The JSON form used for content addressing of constants.
    /// `None` classifies the value as non-identifiable.
    pub fn identity_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Number(n) => serde_json::Number::from_f64(*n).map(serde_json::Value::Number),
            Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Value::String(s) => Some(serde_json::Value::String(s.clone())),
            Value::Sequence(items) => items
                .iter()
                .map(Value::identity_json)
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
            Value::Opaque(o) => o.fingerprint().map(|fp| {
                serde_json::json!({ "opaque": o.type_name(), "repr": fp })
            }),
        }
    }
}

// =============================================================================
// Rendering (print goals, diagnostics)
// =============================================================================

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Sequence(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            // Short descriptive form for values without a textual rendering.
            Value::Opaque(o) => write!(f, "<{}>", o.type_name()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Sequence(a), Value::Sequence(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => match (&a.fingerprint, &b.fingerprint) {
                (Some(fa), Some(fb)) => a.type_name == b.type_name && fa == fb,
                _ => Arc::ptr_eq(&a.payload, &b.payload),
            },
            _ => false,
        }
    }
}
