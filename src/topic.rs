//! # Topic
//!
//! An owned value cell with a type tag, an ordered list of validators, and
//! the mechanics to validate and commit a `Change` against its value.
//!
//! Listener hubs (`auto`/`manual`/`raw`) are *not* stored here: firing an
//! `auto` listener may recursively call back into the state machine to
//! mutate other topics, which would require a topic to hold a reference back
//! to its owning state machine. Rust has no cheap way to express that
//! ownership cycle, so the listener registry lives on `StateMachine` instead,
//! keyed by topic name — `Topic` itself only ever sees its own value.

use crate::change::ot::HistOp;
use crate::change::{Change, ChangeBody, StringKind};
use crate::error::{BrokerError, Result};
use crate::value::{multiset_eq, TopicType, TopicValue};

/// A predicate run against a change's prospective new value before it is
/// committed. Returning `false` rejects the change with `InvalidChange`.
pub type Validator = Box<dyn Fn(&TopicValue, &Change) -> bool + Send + Sync>;

pub struct Topic {
    pub name: String,
    pub topic_type: TopicType,
    pub is_stateful: bool,
    value: TopicValue,
    validators: Vec<Validator>,
    /// Current version for string topics: the id of the last change applied
    /// to this topic (used as `base_version` for OT rewind and sent in
    /// `init`). `None` for every other topic type.
    pub string_version: Option<String>,
    /// Ordered log of every change applied to a string topic, reduced to the
    /// shape the OT rewind needs, keyed by the change's (possibly
    /// regenerated) id. Empty for every other topic type.
    pub string_history: Vec<(String, HistOp)>,
}

impl Topic {
    pub fn new(name: impl Into<String>, topic_type: TopicType, is_stateful: bool) -> Self {
        let string_version = matches!(topic_type, TopicType::String).then(|| nil_version());
        Topic {
            name: name.into(),
            topic_type,
            is_stateful,
            value: TopicValue::default_for(topic_type),
            validators: Vec::new(),
            string_version,
            string_history: Vec::new(),
        }
    }

    pub fn with_initial_value(mut self, value: TopicValue) -> Self {
        self.value = value;
        self
    }

    /// Deep copy of the current value.
    pub fn get(&self) -> TopicValue {
        self.value.clone()
    }

    pub fn value(&self) -> &TopicValue {
        &self.value
    }

    pub fn add_validator(&mut self, validator: Validator) {
        self.validators.push(validator);
    }

    /// Validate and commit `change` against the current value. Returns the
    /// `(old, new)` pair on success. Does not fire any listener hub — the
    /// caller (the state machine) does that once the commit succeeds.
    pub fn apply_change(&mut self, change: &mut Change) -> Result<(TopicValue, TopicValue)> {
        let old = self.value.clone();
        let new = change.apply(&old)?;
        for validator in &self.validators {
            if !validator(&new, change) {
                return Err(BrokerError::invalid(
                    self.name.clone(),
                    "validator rejected change",
                ));
            }
        }
        self.value = new.clone();
        if self.topic_type == TopicType::String {
            self.string_version = Some(change.id.clone());
            if let Some(op) = string_hist_op(&change.body) {
                self.string_history.push((change.id.clone(), op));
            }
        }
        Ok((old, new))
    }

    /// Index into `string_history` that `base_version` rewinds from — the
    /// entries *after* it are what a pending edit must be rewound through.
    /// The nil version (a topic that has never been mutated) rewinds through
    /// the entire history.
    pub fn string_rewind_ops(&self, base_version: &str) -> Result<Vec<HistOp>> {
        if base_version == nil_version() {
            return Ok(self.string_history.iter().map(|(_, op)| op.clone()).collect());
        }
        let idx = self
            .string_history
            .iter()
            .position(|(id, _)| id == base_version)
            .ok_or_else(|| BrokerError::invalid(self.name.clone(), "base_version not found in history"))?;
        Ok(self.string_history[idx + 1..].iter().map(|(_, op)| op.clone()).collect())
    }

    /// Per-type coalescer used by the update buffer to merge a topic's
    /// queued non-stateful changes before a flush.
    pub fn merge_changes(&self, changes: Vec<Change>) -> Vec<Change> {
        crate::change::merge_changes(self.topic_type, changes)
    }

    pub fn as_str(&self) -> Result<&str> {
        match &self.value {
            TopicValue::Str(s) => Ok(s.as_str()),
            _ => Err(BrokerError::invalid(self.name.clone(), "not a string topic")),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match &self.value {
            TopicValue::Int(n) => Ok(*n),
            _ => Err(BrokerError::invalid(self.name.clone(), "not an int topic")),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match &self.value {
            TopicValue::Float(f) => Ok(*f),
            _ => Err(BrokerError::invalid(self.name.clone(), "not a float topic")),
        }
    }

    pub fn as_set(&self) -> Result<&[crate::value::Value]> {
        match &self.value {
            TopicValue::Set(v) => Ok(v.as_slice()),
            _ => Err(BrokerError::invalid(self.name.clone(), "not a set topic")),
        }
    }

    pub fn as_list(&self) -> Result<&[crate::value::Value]> {
        match &self.value {
            TopicValue::List(v) => Ok(v.as_slice()),
            _ => Err(BrokerError::invalid(self.name.clone(), "not a list topic")),
        }
    }

    pub fn as_dict(&self) -> Result<&indexmap::IndexMap<String, crate::value::Value>> {
        match &self.value {
            TopicValue::Dict(m) => Ok(m),
            _ => Err(BrokerError::invalid(self.name.clone(), "not a dict topic")),
        }
    }

    /// `true` if `change` would be a no-op: a `set`-kind change whose value
    /// is deep-equal to the current one. Mirrors `Topic.set`'s early return.
    pub fn is_noop_set(&self, body: &ChangeBody) -> bool {
        match (&self.value, body) {
            (TopicValue::Generic(cur), ChangeBody::Generic(crate::change::GenericKind::Set { value, .. })) => {
                cur == value
            }
            (TopicValue::Str(cur), ChangeBody::Str(crate::change::StringKind::Set { value, .. })) => cur == value,
            (TopicValue::Int(cur), ChangeBody::Int(crate::change::IntKind::Set { value, .. })) => cur == value,
            (TopicValue::Float(cur), ChangeBody::Float(crate::change::FloatKind::Set { value, .. })) => cur == value,
            (TopicValue::Set(cur), ChangeBody::Set(crate::change::SetKind::Set { value, .. })) => {
                multiset_eq(cur, value)
            }
            (TopicValue::List(cur), ChangeBody::List(crate::change::ListKind::Set { value, .. })) => cur == value,
            (TopicValue::Dict(cur), ChangeBody::Dict(crate::change::DictKind::Set { value, .. })) => cur == value,
            (TopicValue::Binary(cur), ChangeBody::Binary(crate::change::BinaryKind::Set { value, .. })) => {
                cur == value
            }
            _ => false,
        }
    }
}

/// The sentinel version string for a string topic that has never been
/// mutated: rewinding against it means "rewind through the topic's entire
/// history", matching `base_version` of an edit composed right after
/// `add_topic`.
pub fn nil_version() -> String {
    uuid::Uuid::nil().to_string()
}

fn string_hist_op(body: &ChangeBody) -> Option<HistOp> {
    match body {
        ChangeBody::Str(StringKind::Set { .. }) => Some(HistOp::Set),
        ChangeBody::Str(StringKind::Insert { pos, text, .. }) => {
            Some(HistOp::Insert { pos: *pos, len: text.chars().count() })
        }
        ChangeBody::Str(StringKind::Delete { pos, text, .. }) => {
            Some(HistOp::Delete { pos: *pos, text: text.clone() })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::StringKind;

    #[test]
    fn new_string_topic_has_nil_version() {
        let topic = Topic::new("s", TopicType::String, true);
        assert_eq!(topic.string_version.as_deref(), Some(nil_version().as_str()));
    }

    #[test]
    fn apply_change_updates_version_to_change_id() {
        let mut topic = Topic::new("s", TopicType::String, true);
        let mut change = Change::new(
            "s".into(),
            TopicType::String,
            ChangeBody::Str(StringKind::Set { old_value: String::new(), value: "hi".into() }),
        );
        let id = change.id.clone();
        topic.apply_change(&mut change).unwrap();
        assert_eq!(topic.string_version, Some(id));
        assert_eq!(topic.as_str().unwrap(), "hi");
    }

    #[test]
    fn validator_rejects_change_and_leaves_value_untouched() {
        let mut topic = Topic::new("s", TopicType::String, true);
        topic.add_validator(Box::new(|new_value, _| match new_value {
            TopicValue::Str(s) => s.len() < 3,
            _ => true,
        }));
        let mut change = Change::new(
            "s".into(),
            TopicType::String,
            ChangeBody::Str(StringKind::Set { old_value: String::new(), value: "too long".into() }),
        );
        assert!(topic.apply_change(&mut change).is_err());
        assert_eq!(topic.as_str().unwrap(), "");
    }

    #[test]
    fn is_noop_set_detects_deep_equal_value() {
        let topic = Topic::new("n", TopicType::Int, true);
        let body = ChangeBody::Int(crate::change::IntKind::Set { old_value: 0, value: 0 });
        assert!(topic.is_noop_set(&body));
    }
}
