use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque pagination position: an ordered set of scalar fields such as
/// `idBis`/`neuanlageBis` or `skip`.
///
/// Two cursors are equal when all fields are equal, which is what stall
/// detection compares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor {
    fields: BTreeMap<String, Value>,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field. Non-scalar values are ignored.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let value = value.into();
        if is_scalar(&value) {
            self.fields.insert(key.into(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Build a cursor from the scalar fields of a JSON object. Returns `None`
    /// if there are none.
    pub fn from_json(value: &Value) -> Option<Self> {
        let cursor = match value {
            Value::Object(map) => map.iter().fold(Cursor::new(), |c, (k, v)| {
                c.with(k.clone(), v.clone())
            }),
            Value::String(s) if !s.is_empty() => Cursor::new().with("cursor", s.clone()),
            Value::Number(n) => Cursor::new().with("cursor", n.clone()),
            _ => Cursor::new(),
        };
        (!cursor.is_empty()).then_some(cursor)
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
