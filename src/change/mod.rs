//! # Change model
//!
//! A `Change` is a tagged, serializable description of one mutation to one
//! topic. Each topic type defines a closed set of change kinds (`ChangeBody`
//! variants below); every kind knows how to `apply` against the topic's
//! current value, how to build its own `inverse`, and how it is framed on
//! the wire (`{ topic_name, topic_type, type, id, ...fields }`).
//!
//! `Change::apply` regenerates `id` whenever a `set`-like change's recorded
//! `old_value` no longer matches the topic's actual value — this is how a
//! client's optimistic preview entry is distinguished from a genuinely
//! confirming server echo (see `topic.rs` / the client mirror).

pub mod merge;
pub mod ot;

use base64::Engine;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::error::{BrokerError, Result};
use crate::value::{TopicType, TopicValue, Value};

pub use merge::merge_changes;

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenericKind {
    Set { old_value: Value, value: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StringKind {
    Set { old_value: String, value: String },
    Insert { pos: usize, text: String, base_version: String },
    Delete { pos: usize, text: String, base_version: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntKind {
    Set { old_value: i64, value: i64 },
    Add { value: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FloatKind {
    Set { old_value: f64, value: f64 },
    Add { value: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetKind {
    Set { old_value: Vec<Value>, value: Vec<Value> },
    Append { item: Value },
    Remove { item: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListKind {
    Set { old_value: Vec<Value>, value: Vec<Value> },
    /// `pos == -1` means append. `resolved_pos` is filled in by `apply` so
    /// `inverse` can build an exact `Pop` regardless of the `-1` sentinel.
    Insert { item: Value, pos: i64, resolved_pos: Option<usize> },
    /// `removed` is filled in by `apply`; never sent on the wire.
    Pop { pos: i64, removed: Option<Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DictKind {
    Set { old_value: IndexMap<String, Value>, value: IndexMap<String, Value> },
    Add { key: String, value: Value },
    /// `removed` is filled in by `apply`; never sent on the wire.
    Pop { key: String, removed: Option<Value> },
    ChangeValue { key: String, old_value: Value, value: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Emit { args: Value, forward_info: Option<Value> },
    ReversedEmit { args: Value, forward_info: Option<Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BinaryKind {
    Set { old_value: Vec<u8>, value: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeBody {
    /// Internal sentinel produced where "no change happened" needs a
    /// placeholder in a changes list. Never serialized.
    Null,
    Generic(GenericKind),
    Str(StringKind),
    Int(IntKind),
    Float(FloatKind),
    Set(SetKind),
    List(ListKind),
    Dict(DictKind),
    Event(EventKind),
    Binary(BinaryKind),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub topic_name: String,
    pub topic_type: TopicType,
    pub id: String,
    pub body: ChangeBody,
}

impl Change {
    pub fn new(topic_name: String, topic_type: TopicType, body: ChangeBody) -> Self {
        Change {
            topic_name,
            topic_type,
            id: new_id(),
            body,
        }
    }

    pub fn with_id(topic_name: String, topic_type: TopicType, id: String, body: ChangeBody) -> Self {
        Change {
            topic_name,
            topic_type,
            id,
            body,
        }
    }

    /// Build the `NullChange` sentinel: a committed-but-empty placeholder,
    /// filtered out of every flat changes list before it reaches a callback.
    pub fn null(topic_name: String, topic_type: TopicType) -> Self {
        Change::new(topic_name, topic_type, ChangeBody::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.body, ChangeBody::Null)
    }

    /// `true` for `event` changes: they never persist a topic value.
    pub fn is_event(&self) -> bool {
        matches!(self.body, ChangeBody::Event(_))
    }

    /// Apply this change to `current`, returning the new value. May mutate
    /// `self.id` (precondition-drift regeneration) or other bookkeeping
    /// fields (`resolved_pos`, `removed`) needed by `inverse()`.
    pub fn apply(&mut self, current: &TopicValue) -> Result<TopicValue> {
        let topic_name = self.topic_name.clone();
        let id = &mut self.id;
        match (&mut self.body, current) {
            (ChangeBody::Null, cur) => Ok(cur.clone()),
            (ChangeBody::Generic(k), TopicValue::Generic(cur)) => {
                apply_generic(id, k, cur).map(TopicValue::Generic)
            }
            (ChangeBody::Str(k), TopicValue::Str(cur)) => {
                apply_string(id, k, cur, &topic_name).map(TopicValue::Str)
            }
            (ChangeBody::Int(k), TopicValue::Int(cur)) => {
                apply_int(id, k, *cur).map(TopicValue::Int)
            }
            (ChangeBody::Float(k), TopicValue::Float(cur)) => {
                apply_float(id, k, *cur).map(TopicValue::Float)
            }
            (ChangeBody::Set(k), TopicValue::Set(cur)) => {
                apply_set(id, k, cur, &topic_name).map(TopicValue::Set)
            }
            (ChangeBody::List(k), TopicValue::List(cur)) => {
                apply_list(id, k, cur, &topic_name).map(TopicValue::List)
            }
            (ChangeBody::Dict(k), TopicValue::Dict(cur)) => {
                apply_dict(id, k, cur, &topic_name).map(TopicValue::Dict)
            }
            (ChangeBody::Event(_), TopicValue::Event) => Ok(TopicValue::Event),
            (ChangeBody::Binary(k), TopicValue::Binary(cur)) => {
                apply_binary(id, k, cur).map(TopicValue::Binary)
            }
            _ => Err(BrokerError::invalid(
                topic_name,
                "change kind does not match topic type",
            )),
        }
    }

    /// Build the inverse change. Always gets a fresh id (it is a new,
    /// independently-applied change, not a replay of this one).
    pub fn inverse(&self) -> Change {
        let body = match &self.body {
            ChangeBody::Null => ChangeBody::Null,
            ChangeBody::Generic(GenericKind::Set { old_value, value }) => {
                ChangeBody::Generic(GenericKind::Set {
                    old_value: value.clone(),
                    value: old_value.clone(),
                })
            }
            ChangeBody::Str(k) => ChangeBody::Str(match k {
                StringKind::Set { old_value, value } => StringKind::Set {
                    old_value: value.clone(),
                    value: old_value.clone(),
                },
                StringKind::Insert { pos, text, .. } => StringKind::Delete {
                    pos: *pos,
                    text: text.clone(),
                    base_version: self.id.clone(),
                },
                StringKind::Delete { pos, text, .. } => StringKind::Insert {
                    pos: *pos,
                    text: text.clone(),
                    base_version: self.id.clone(),
                },
            }),
            ChangeBody::Int(k) => ChangeBody::Int(match k {
                IntKind::Set { old_value, value } => IntKind::Set {
                    old_value: *value,
                    value: *old_value,
                },
                IntKind::Add { value } => IntKind::Add { value: -value },
            }),
            ChangeBody::Float(k) => ChangeBody::Float(match k {
                FloatKind::Set { old_value, value } => FloatKind::Set {
                    old_value: *value,
                    value: *old_value,
                },
                FloatKind::Add { value } => FloatKind::Add { value: -value },
            }),
            ChangeBody::Set(k) => ChangeBody::Set(match k {
                SetKind::Set { old_value, value } => SetKind::Set {
                    old_value: value.clone(),
                    value: old_value.clone(),
                },
                SetKind::Append { item } => SetKind::Remove { item: item.clone() },
                SetKind::Remove { item } => SetKind::Append { item: item.clone() },
            }),
            ChangeBody::List(k) => ChangeBody::List(match k {
                ListKind::Set { old_value, value } => ListKind::Set {
                    old_value: value.clone(),
                    value: old_value.clone(),
                },
                ListKind::Insert { item, resolved_pos, .. } => {
                    let pos = resolved_pos.unwrap_or(0) as i64;
                    ListKind::Pop { pos, removed: Some(item.clone()) }
                }
                ListKind::Pop { pos, removed } => ListKind::Insert {
                    item: removed.clone().unwrap_or(Value::Null),
                    pos: *pos,
                    resolved_pos: Some((*pos).max(0) as usize),
                },
            }),
            ChangeBody::Dict(k) => ChangeBody::Dict(match k {
                DictKind::Set { old_value, value } => DictKind::Set {
                    old_value: value.clone(),
                    value: old_value.clone(),
                },
                DictKind::Add { key, value } => DictKind::Pop {
                    key: key.clone(),
                    removed: Some(value.clone()),
                },
                DictKind::Pop { key, removed } => DictKind::Add {
                    key: key.clone(),
                    value: removed.clone().unwrap_or(Value::Null),
                },
                DictKind::ChangeValue { key, old_value, value } => DictKind::ChangeValue {
                    key: key.clone(),
                    old_value: value.clone(),
                    value: old_value.clone(),
                },
            }),
            ChangeBody::Event(k) => ChangeBody::Event(match k {
                EventKind::Emit { args, forward_info } => EventKind::ReversedEmit {
                    args: args.clone(),
                    forward_info: forward_info.clone(),
                },
                EventKind::ReversedEmit { args, forward_info } => EventKind::Emit {
                    args: args.clone(),
                    forward_info: forward_info.clone(),
                },
            }),
            ChangeBody::Binary(BinaryKind::Set { old_value, value }) => {
                ChangeBody::Binary(BinaryKind::Set {
                    old_value: value.clone(),
                    value: old_value.clone(),
                })
            }
        };
        Change::new(self.topic_name.clone(), self.topic_type, body)
    }
}

fn apply_generic(id: &mut String, kind: &GenericKind, current: &Value) -> Result<Value> {
    let GenericKind::Set { old_value, value } = kind;
    if old_value != current {
        *id = new_id();
    }
    Ok(value.clone())
}

fn apply_string(id: &mut String, kind: &StringKind, current: &String, topic_name: &str) -> Result<String> {
    match kind {
        StringKind::Set { old_value, value } => {
            if old_value != current {
                *id = new_id();
            }
            Ok(value.clone())
        }
        StringKind::Insert { pos, text, .. } => ot::apply_insert(current, *pos, text, topic_name),
        StringKind::Delete { pos, text, .. } => ot::apply_delete(current, *pos, text, topic_name),
    }
}

fn apply_int(id: &mut String, kind: &IntKind, current: i64) -> Result<i64> {
    match kind {
        IntKind::Set { old_value, value } => {
            if *old_value != current {
                *id = new_id();
            }
            Ok(*value)
        }
        IntKind::Add { value } => Ok(current + value),
    }
}

fn apply_float(id: &mut String, kind: &FloatKind, current: f64) -> Result<f64> {
    match kind {
        FloatKind::Set { old_value, value } => {
            if *old_value != current {
                *id = new_id();
            }
            Ok(*value)
        }
        FloatKind::Add { value } => Ok(current + value),
    }
}

fn apply_set(id: &mut String, kind: &SetKind, current: &[Value], topic_name: &str) -> Result<Vec<Value>> {
    match kind {
        SetKind::Set { old_value, value } => {
            if !crate::value::multiset_eq(old_value, current) {
                *id = new_id();
            }
            Ok(value.clone())
        }
        SetKind::Append { item } => {
            if current.iter().any(|v| v == item) {
                return Err(BrokerError::invalid(topic_name, "item already present"));
            }
            let mut v = current.to_vec();
            v.push(item.clone());
            Ok(v)
        }
        SetKind::Remove { item } => {
            if let Some(pos) = current.iter().position(|v| v == item) {
                let mut v = current.to_vec();
                v.remove(pos);
                Ok(v)
            } else {
                Err(BrokerError::invalid(topic_name, "item not present"))
            }
        }
    }
}

fn apply_list(id: &mut String, kind: &mut ListKind, current: &[Value], topic_name: &str) -> Result<Vec<Value>> {
    match kind {
        ListKind::Set { old_value, value } => {
            if old_value.as_slice() != current {
                *id = new_id();
            }
            Ok(value.clone())
        }
        ListKind::Insert { item, pos, resolved_pos } => {
            let len = current.len();
            let actual = if *pos == -1 {
                len
            } else if *pos < 0 || *pos as usize > len {
                return Err(BrokerError::invalid(topic_name, "insert position out of range"));
            } else {
                *pos as usize
            };
            *resolved_pos = Some(actual);
            let mut v = current.to_vec();
            v.insert(actual, item.clone());
            Ok(v)
        }
        ListKind::Pop { pos, removed } => {
            let len = current.len();
            if *pos < 0 || *pos as usize >= len {
                return Err(BrokerError::invalid(topic_name, "pop position out of range"));
            }
            let p = *pos as usize;
            let mut v = current.to_vec();
            let item = v.remove(p);
            *removed = Some(item);
            Ok(v)
        }
    }
}

fn apply_dict(
    id: &mut String,
    kind: &mut DictKind,
    current: &IndexMap<String, Value>,
    topic_name: &str,
) -> Result<IndexMap<String, Value>> {
    match kind {
        DictKind::Set { old_value, value } => {
            if old_value != current {
                *id = new_id();
            }
            Ok(value.clone())
        }
        DictKind::Add { key, value } => {
            if current.contains_key(key) {
                return Err(BrokerError::invalid(topic_name, "key already present"));
            }
            let mut m = current.clone();
            m.insert(key.clone(), value.clone());
            Ok(m)
        }
        DictKind::Pop { key, removed } => {
            if !current.contains_key(key) {
                return Err(BrokerError::invalid(topic_name, "key not present"));
            }
            let mut m = current.clone();
            let item = m.shift_remove(key).expect("checked above");
            *removed = Some(item);
            Ok(m)
        }
        DictKind::ChangeValue { key, old_value, value } => {
            match current.get(key) {
                None => return Err(BrokerError::invalid(topic_name, "key not present")),
                Some(actual) => {
                    if actual != old_value {
                        *id = new_id();
                    }
                }
            }
            let mut m = current.clone();
            m.insert(key.clone(), value.clone());
            Ok(m)
        }
    }
}

fn apply_binary(id: &mut String, kind: &BinaryKind, current: &[u8]) -> Result<Vec<u8>> {
    let BinaryKind::Set { old_value, value } = kind;
    if old_value.as_slice() != current {
        *id = new_id();
    }
    Ok(value.clone())
}

// --- wire format ---------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct ChangeWire {
    topic_name: String,
    topic_type: TopicType,
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(flatten)]
    fields: Map<String, serde_json::Value>,
}

fn take_field(fields: &mut Map<String, serde_json::Value>, key: &str) -> Result<serde_json::Value> {
    fields
        .remove(key)
        .ok_or_else(|| BrokerError::Deserialize(format!("missing field '{key}'")))
}

fn take<T: for<'de> Deserialize<'de>>(fields: &mut Map<String, serde_json::Value>, key: &str) -> Result<T> {
    let v = take_field(fields, key)?;
    serde_json::from_value(v).map_err(|e| BrokerError::Deserialize(format!("field '{key}': {e}")))
}

fn take_opt_value(fields: &mut Map<String, serde_json::Value>, key: &str) -> Option<Value> {
    fields.remove(key).and_then(|v| serde_json::from_value(v).ok())
}

fn take_usize(fields: &mut Map<String, serde_json::Value>, key: &str) -> Result<usize> {
    let n: i64 = take(fields, key)?;
    if n < 0 {
        return Err(BrokerError::Deserialize(format!("field '{key}' must not be negative")));
    }
    Ok(n as usize)
}

fn take_bytes(fields: &mut Map<String, serde_json::Value>, key: &str) -> Result<Vec<u8>> {
    let s: String = take(fields, key)?;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| BrokerError::Deserialize(format!("field '{key}' is not valid base64: {e}")))
}

fn put_bytes(fields: &mut Map<String, serde_json::Value>, key: &str, bytes: &[u8]) {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    fields.insert(key.to_string(), serde_json::Value::String(encoded));
}

fn put<T: Serialize>(fields: &mut Map<String, serde_json::Value>, key: &str, value: &T) {
    fields.insert(key.to_string(), serde_json::to_value(value).expect("value is always serializable"));
}

impl Change {
    fn to_wire(&self) -> ChangeWire {
        let mut fields = Map::new();
        let kind = match &self.body {
            ChangeBody::Null => "null",
            ChangeBody::Generic(GenericKind::Set { old_value, value }) => {
                put(&mut fields, "old_value", old_value);
                put(&mut fields, "value", value);
                "set"
            }
            ChangeBody::Str(k) => match k {
                StringKind::Set { old_value, value } => {
                    put(&mut fields, "old_value", old_value);
                    put(&mut fields, "value", value);
                    "set"
                }
                StringKind::Insert { pos, text, base_version } => {
                    put(&mut fields, "pos", pos);
                    put(&mut fields, "text", text);
                    put(&mut fields, "base_version", base_version);
                    "insert"
                }
                StringKind::Delete { pos, text, base_version } => {
                    put(&mut fields, "pos", pos);
                    put(&mut fields, "text", text);
                    put(&mut fields, "base_version", base_version);
                    "delete"
                }
            },
            ChangeBody::Int(k) => match k {
                IntKind::Set { old_value, value } => {
                    put(&mut fields, "old_value", old_value);
                    put(&mut fields, "value", value);
                    "set"
                }
                IntKind::Add { value } => {
                    put(&mut fields, "value", value);
                    "add"
                }
            },
            ChangeBody::Float(k) => match k {
                FloatKind::Set { old_value, value } => {
                    put(&mut fields, "old_value", old_value);
                    put(&mut fields, "value", value);
                    "set"
                }
                FloatKind::Add { value } => {
                    put(&mut fields, "value", value);
                    "add"
                }
            },
            ChangeBody::Set(k) => match k {
                SetKind::Set { old_value, value } => {
                    put(&mut fields, "old_value", old_value);
                    put(&mut fields, "value", value);
                    "set"
                }
                SetKind::Append { item } => {
                    put(&mut fields, "item", item);
                    "append"
                }
                SetKind::Remove { item } => {
                    put(&mut fields, "item", item);
                    "remove"
                }
            },
            ChangeBody::List(k) => match k {
                ListKind::Set { old_value, value } => {
                    put(&mut fields, "old_value", old_value);
                    put(&mut fields, "value", value);
                    "set"
                }
                ListKind::Insert { item, pos, .. } => {
                    put(&mut fields, "item", item);
                    put(&mut fields, "pos", pos);
                    "insert"
                }
                ListKind::Pop { pos, .. } => {
                    put(&mut fields, "pos", pos);
                    "pop"
                }
            },
            ChangeBody::Dict(k) => match k {
                DictKind::Set { old_value, value } => {
                    put(&mut fields, "old_value", old_value);
                    put(&mut fields, "value", value);
                    "set"
                }
                DictKind::Add { key, value } => {
                    put(&mut fields, "key", key);
                    put(&mut fields, "value", value);
                    "add"
                }
                DictKind::Pop { key, .. } => {
                    put(&mut fields, "key", key);
                    "pop"
                }
                DictKind::ChangeValue { key, old_value, value } => {
                    put(&mut fields, "key", key);
                    put(&mut fields, "old_value", old_value);
                    put(&mut fields, "value", value);
                    "change_value"
                }
            },
            ChangeBody::Event(k) => match k {
                EventKind::Emit { args, forward_info } => {
                    put(&mut fields, "args", args);
                    if let Some(fi) = forward_info {
                        put(&mut fields, "forward_info", fi);
                    }
                    "emit"
                }
                EventKind::ReversedEmit { args, forward_info } => {
                    put(&mut fields, "args", args);
                    if let Some(fi) = forward_info {
                        put(&mut fields, "forward_info", fi);
                    }
                    "reversed_emit"
                }
            },
            ChangeBody::Binary(BinaryKind::Set { old_value, value }) => {
                put_bytes(&mut fields, "old_value", old_value);
                put_bytes(&mut fields, "value", value);
                "set"
            }
        };
        ChangeWire {
            topic_name: self.topic_name.clone(),
            topic_type: self.topic_type,
            kind: kind.to_string(),
            id: self.id.clone(),
            fields,
        }
    }

    fn from_wire(wire: ChangeWire) -> Result<Change> {
        let ChangeWire { topic_name, topic_type, kind, id, mut fields } = wire;
        let body = match (topic_type, kind.as_str()) {
            (_, "null") => ChangeBody::Null,
            (TopicType::Generic, "set") => ChangeBody::Generic(GenericKind::Set {
                old_value: take(&mut fields, "old_value")?,
                value: take(&mut fields, "value")?,
            }),
            (TopicType::String, "set") => ChangeBody::Str(StringKind::Set {
                old_value: take(&mut fields, "old_value")?,
                value: take(&mut fields, "value")?,
            }),
            (TopicType::String, "insert") => ChangeBody::Str(StringKind::Insert {
                pos: take_usize(&mut fields, "pos")?,
                text: take(&mut fields, "text")?,
                base_version: take(&mut fields, "base_version")?,
            }),
            (TopicType::String, "delete") => ChangeBody::Str(StringKind::Delete {
                pos: take_usize(&mut fields, "pos")?,
                text: take(&mut fields, "text")?,
                base_version: take(&mut fields, "base_version")?,
            }),
            (TopicType::Int, "set") => ChangeBody::Int(IntKind::Set {
                old_value: take(&mut fields, "old_value")?,
                value: take(&mut fields, "value")?,
            }),
            (TopicType::Int, "add") => ChangeBody::Int(IntKind::Add { value: take(&mut fields, "value")? }),
            (TopicType::Float, "set") => ChangeBody::Float(FloatKind::Set {
                old_value: take(&mut fields, "old_value")?,
                value: take(&mut fields, "value")?,
            }),
            (TopicType::Float, "add") => ChangeBody::Float(FloatKind::Add { value: take(&mut fields, "value")? }),
            (TopicType::Set, "set") => ChangeBody::Set(SetKind::Set {
                old_value: take(&mut fields, "old_value")?,
                value: take(&mut fields, "value")?,
            }),
            (TopicType::Set, "append") => ChangeBody::Set(SetKind::Append { item: take(&mut fields, "item")? }),
            (TopicType::Set, "remove") => ChangeBody::Set(SetKind::Remove { item: take(&mut fields, "item")? }),
            (TopicType::List, "set") => ChangeBody::List(ListKind::Set {
                old_value: take(&mut fields, "old_value")?,
                value: take(&mut fields, "value")?,
            }),
            (TopicType::List, "insert") => ChangeBody::List(ListKind::Insert {
                item: take(&mut fields, "item")?,
                pos: take(&mut fields, "pos")?,
                resolved_pos: None,
            }),
            (TopicType::List, "pop") => ChangeBody::List(ListKind::Pop {
                pos: take(&mut fields, "pos")?,
                removed: None,
            }),
            (TopicType::Dict, "set") => ChangeBody::Dict(DictKind::Set {
                old_value: take(&mut fields, "old_value")?,
                value: take(&mut fields, "value")?,
            }),
            (TopicType::Dict, "add") => ChangeBody::Dict(DictKind::Add {
                key: take(&mut fields, "key")?,
                value: take(&mut fields, "value")?,
            }),
            (TopicType::Dict, "pop") => ChangeBody::Dict(DictKind::Pop {
                key: take(&mut fields, "key")?,
                removed: None,
            }),
            (TopicType::Dict, "change_value") => ChangeBody::Dict(DictKind::ChangeValue {
                key: take(&mut fields, "key")?,
                old_value: take(&mut fields, "old_value")?,
                value: take(&mut fields, "value")?,
            }),
            (TopicType::Event, "emit") => ChangeBody::Event(EventKind::Emit {
                args: take(&mut fields, "args")?,
                forward_info: take_opt_value(&mut fields, "forward_info"),
            }),
            (TopicType::Event, "reversed_emit") => ChangeBody::Event(EventKind::ReversedEmit {
                args: take(&mut fields, "args")?,
                forward_info: take_opt_value(&mut fields, "forward_info"),
            }),
            (TopicType::Binary, "set") => ChangeBody::Binary(BinaryKind::Set {
                old_value: take_bytes(&mut fields, "old_value")?,
                value: take_bytes(&mut fields, "value")?,
            }),
            (tt, other) => {
                return Err(BrokerError::Deserialize(format!(
                    "unknown change kind '{other}' for topic type '{}'",
                    tt.as_str()
                )))
            }
        };
        Ok(Change { topic_name, topic_type, id, body })
    }
}

impl Serialize for Change {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Change {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wire = ChangeWire::deserialize(deserializer)?;
        Change::from_wire(wire).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_topic() -> TopicValue {
        TopicValue::Int(0)
    }

    #[test]
    fn add_then_inverse_is_identity() {
        let mut change = Change::new("counter".into(), TopicType::Int, ChangeBody::Int(IntKind::Add { value: 5 }));
        let new_value = change.apply(&int_topic()).unwrap();
        assert_eq!(new_value, TopicValue::Int(5));
        let mut inv = change.inverse();
        let restored = inv.apply(&new_value).unwrap();
        assert_eq!(restored, TopicValue::Int(0));
    }

    #[test]
    fn set_regenerates_id_on_precondition_drift() {
        let mut change = Change::new(
            "a".into(),
            TopicType::Int,
            ChangeBody::Int(IntKind::Set { old_value: 0, value: 1 }),
        );
        let original_id = change.id.clone();
        // actual current value is 99, not the 0 the change expected
        change.apply(&TopicValue::Int(99)).unwrap();
        assert_ne!(change.id, original_id);
    }

    #[test]
    fn set_keeps_id_when_precondition_matches() {
        let mut change = Change::new(
            "a".into(),
            TopicType::Int,
            ChangeBody::Int(IntKind::Set { old_value: 0, value: 1 }),
        );
        let original_id = change.id.clone();
        change.apply(&TopicValue::Int(0)).unwrap();
        assert_eq!(change.id, original_id);
    }

    #[test]
    fn set_append_rejects_duplicate() {
        let mut change = Change::new(
            "tags".into(),
            TopicType::Set,
            ChangeBody::Set(SetKind::Append { item: Value::from("x") }),
        );
        let current = TopicValue::Set(vec![Value::from("x")]);
        assert!(change.apply(&current).is_err());
    }

    #[test]
    fn list_pop_then_inverse_restores_value_and_position() {
        let mut change = Change::new("l".into(), TopicType::List, ChangeBody::List(ListKind::Pop { pos: 1, removed: None }));
        let current = TopicValue::List(vec![Value::from(1i64), Value::from(2i64), Value::from(3i64)]);
        let new_value = change.apply(&current).unwrap();
        assert_eq!(new_value, TopicValue::List(vec![Value::from(1i64), Value::from(3i64)]));
        let mut inv = change.inverse();
        let restored = inv.apply(&new_value).unwrap();
        assert_eq!(restored, current);
    }

    #[test]
    fn list_insert_append_sentinel_then_inverse() {
        let mut change = Change::new(
            "l".into(),
            TopicType::List,
            ChangeBody::List(ListKind::Insert { item: Value::from(9i64), pos: -1, resolved_pos: None }),
        );
        let current = TopicValue::List(vec![Value::from(1i64)]);
        let new_value = change.apply(&current).unwrap();
        assert_eq!(new_value, TopicValue::List(vec![Value::from(1i64), Value::from(9i64)]));
        let mut inv = change.inverse();
        let restored = inv.apply(&new_value).unwrap();
        assert_eq!(restored, current);
    }

    #[test]
    fn dict_change_value_regenerates_id_on_drift() {
        let mut dict = IndexMap::new();
        dict.insert("k".to_string(), Value::from(1i64));
        let mut change = Change::new(
            "d".into(),
            TopicType::Dict,
            ChangeBody::Dict(DictKind::ChangeValue {
                key: "k".into(),
                old_value: Value::from(1i64),
                value: Value::from(2i64),
            }),
        );
        let original_id = change.id.clone();
        let mut drifted = dict.clone();
        drifted.insert("k".to_string(), Value::from(7i64));
        change.apply(&TopicValue::Dict(drifted)).unwrap();
        assert_ne!(change.id, original_id);
    }

    #[test]
    fn wire_roundtrip_string_insert() {
        let change = Change::new(
            "doc".into(),
            TopicType::String,
            ChangeBody::Str(StringKind::Insert {
                pos: 3,
                text: "xyz".into(),
                base_version: "v0".into(),
            }),
        );
        let json = serde_json::to_string(&change).unwrap();
        let parsed: Change = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, change);
    }

    #[test]
    fn wire_roundtrip_binary_set() {
        let change = Change::new(
            "blob".into(),
            TopicType::Binary,
            ChangeBody::Binary(BinaryKind::Set { old_value: vec![1, 2], value: vec![3, 4, 5] }),
        );
        let json = serde_json::to_string(&change).unwrap();
        assert!(json.contains("\"type\":\"set\""));
        let parsed: Change = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, change);
    }

    #[test]
    fn deserialize_rejects_unknown_kind() {
        let json = r#"{"topic_name":"a","topic_type":"int","type":"frobnicate","id":"x"}"#;
        let result: std::result::Result<Change, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
