//! # Topic Values
//!
//! A small JSON-shaped value type shared by the generic/set/list/dict topic
//! types and their change payloads. Deep (structural) equality on `Value` is
//! what the spec calls "JSON-equivalent" equality: `Dict` compares as a map
//! (insertion order does not affect equality) while `List` compares
//! positionally, matching `indexmap::IndexMap`'s and `Vec`'s own `PartialEq`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// An arbitrary JSON-like value held by a topic or nested inside a
/// set/list/dict element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Dict(IndexMap<String, Value>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }
}

/// Multiset equality used by the `set` topic type: two sequences of values
/// are equal regardless of order, as long as every element occurs the same
/// number of times in both.
pub fn multiset_eq(a: &[Value], b: &[Value]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut used = vec![false; b.len()];
    'outer: for x in a {
        for (i, y) in b.iter().enumerate() {
            if !used[i] && x == y {
                used[i] = true;
                continue 'outer;
            }
        }
        return false;
    }
    true
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Tag identifying one of the nine topic kinds. Carried on the wire alongside
/// every change so deserialization can dispatch on `(topic_type, type)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicType {
    Generic,
    String,
    Int,
    Float,
    Set,
    List,
    Dict,
    Event,
    Binary,
}

impl TopicType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicType::Generic => "generic",
            TopicType::String => "string",
            TopicType::Int => "int",
            TopicType::Float => "float",
            TopicType::Set => "set",
            TopicType::List => "list",
            TopicType::Dict => "dict",
            TopicType::Event => "event",
            TopicType::Binary => "binary",
        }
    }
}

/// The in-memory representation held by a topic's value cell. One variant per
/// `TopicType`; `Event` carries no persisted value since events are
/// fire-and-forget notifications rather than replicated state.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicValue {
    Generic(Value),
    Str(String),
    Int(i64),
    Float(f64),
    Set(Vec<Value>),
    List(Vec<Value>),
    Dict(IndexMap<String, Value>),
    Event,
    Binary(Vec<u8>),
}

impl TopicValue {
    /// The zero value a freshly created topic of this type starts with,
    /// mirroring `change.py`'s `default_topic_value` table.
    pub fn default_for(topic_type: TopicType) -> Self {
        match topic_type {
            TopicType::Generic => TopicValue::Generic(Value::Null),
            TopicType::String => TopicValue::Str(String::new()),
            TopicType::Int => TopicValue::Int(0),
            TopicType::Float => TopicValue::Float(0.0),
            TopicType::Set => TopicValue::Set(Vec::new()),
            TopicType::List => TopicValue::List(Vec::new()),
            TopicType::Dict => TopicValue::Dict(IndexMap::new()),
            TopicType::Event => TopicValue::Event,
            TopicType::Binary => TopicValue::Binary(Vec::new()),
        }
    }

    pub fn topic_type(&self) -> TopicType {
        match self {
            TopicValue::Generic(_) => TopicType::Generic,
            TopicValue::Str(_) => TopicType::String,
            TopicValue::Int(_) => TopicType::Int,
            TopicValue::Float(_) => TopicType::Float,
            TopicValue::Set(_) => TopicType::Set,
            TopicValue::List(_) => TopicType::List,
            TopicValue::Dict(_) => TopicType::Dict,
            TopicValue::Event => TopicType::Event,
            TopicValue::Binary(_) => TopicType::Binary,
        }
    }

    /// Render as a generic `Value` for wire transmission (`init`, generic-topic
    /// storage). Binary values are not representable here; callers serialize
    /// them as base64 strings directly where needed.
    pub fn to_value(&self) -> Value {
        match self {
            TopicValue::Generic(v) => v.clone(),
            TopicValue::Str(s) => Value::Str(s.clone()),
            TopicValue::Int(n) => Value::Int(*n),
            TopicValue::Float(f) => Value::Float(*f),
            TopicValue::Set(items) => Value::List(items.clone()),
            TopicValue::List(items) => Value::List(items.clone()),
            TopicValue::Dict(m) => Value::Dict(m.clone()),
            TopicValue::Event => Value::Null,
            TopicValue::Binary(bytes) => Value::Str(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                bytes,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiset_eq_ignores_order() {
        let a = vec![Value::from(1i64), Value::from(2i64), Value::from(2i64)];
        let b = vec![Value::from(2i64), Value::from(1i64), Value::from(2i64)];
        assert!(multiset_eq(&a, &b));
    }

    #[test]
    fn multiset_eq_respects_multiplicity() {
        let a = vec![Value::from(1i64), Value::from(1i64)];
        let b = vec![Value::from(1i64)];
        assert!(!multiset_eq(&a, &b));
    }

    #[test]
    fn dict_equality_is_order_independent() {
        let mut a = IndexMap::new();
        a.insert("x".to_string(), Value::from(1i64));
        a.insert("y".to_string(), Value::from(2i64));
        let mut b = IndexMap::new();
        b.insert("y".to_string(), Value::from(2i64));
        b.insert("x".to_string(), Value::from(1i64));
        assert_eq!(Value::Dict(a), Value::Dict(b));
    }
}
