//! # ClientMirror
//!
//! A local copy of every topic this client subscribes to, kept in sync with
//! the server's authoritative state. Mutations are applied optimistically —
//! immediately, before the server has seen them — and queued on a preview
//! deque until the server's `update` confirms or overrules them.

use std::collections::{HashMap, VecDeque};

use serde_json::Value as Json;
use topicsync::{Change, TopicType, TopicValue, Value};

use crate::error::{Error, Result};

struct LocalTopic {
    topic_type: TopicType,
    value: TopicValue,
    /// Current version for string topics, used as `base_version` on the next
    /// locally-originated edit. `None` for every other topic type.
    string_version: Option<String>,
}

/// Tracks local topics plus the deque of not-yet-confirmed optimistic
/// changes, exactly as described for the client side of the protocol: apply
/// locally, send the change, and either drop it (confirmed) or unwind it
/// (overruled) once the server replies.
pub struct ClientMirror {
    topics: HashMap<String, LocalTopic>,
    preview: VecDeque<Change>,
}

impl Default for ClientMirror {
    fn default() -> Self {
        ClientMirror::new()
    }
}

impl ClientMirror {
    pub fn new() -> Self {
        ClientMirror { topics: HashMap::new(), preview: VecDeque::new() }
    }

    /// Register a topic this client is about to subscribe to, so incoming
    /// `init`/`update` frames for it have somewhere to land. No-op if the
    /// topic is already tracked.
    pub fn track_topic(&mut self, topic_name: &str, topic_type: TopicType) {
        self.topics.entry(topic_name.to_string()).or_insert_with(|| LocalTopic {
            topic_type,
            value: TopicValue::default_for(topic_type),
            string_version: matches!(topic_type, TopicType::String).then(topicsync::topic::nil_version),
        });
    }

    pub fn forget_topic(&mut self, topic_name: &str) {
        self.topics.remove(topic_name);
        self.preview.retain(|c| c.topic_name != topic_name);
    }

    pub fn get(&self, topic_name: &str) -> Option<&TopicValue> {
        self.topics.get(topic_name).map(|t| &t.value)
    }

    pub fn string_version(&self, topic_name: &str) -> Option<&str> {
        self.topics.get(topic_name).and_then(|t| t.string_version.as_deref())
    }

    /// `init` for a just-subscribed topic: overwrite the local value
    /// wholesale, and for string topics record the server's version.
    pub fn handle_init(&mut self, topic_name: &str, value: Json, id: Option<String>) -> Result<()> {
        let topic_type =
            self.topics.get(topic_name).map(|t| t.topic_type).unwrap_or(TopicType::Generic);
        let value = topic_value_from_json(topic_type, &value)?;
        self.topics.insert(
            topic_name.to_string(),
            LocalTopic { topic_type, value, string_version: id },
        );
        self.preview.retain(|c| c.topic_name != topic_name);
        Ok(())
    }

    /// Apply a locally-originated mutation: commit it to the mirror
    /// immediately and push it onto the preview deque. Returns the change as
    /// actually committed (its id may have been regenerated), ready to be
    /// sent to the server as part of an `action`.
    pub fn propose(&mut self, mut change: Change) -> Result<Change> {
        let topic = self
            .topics
            .get_mut(&change.topic_name)
            .ok_or_else(|| Error::topic_not_found(change.topic_name.clone()))?;
        let new_value = change
            .apply(&topic.value)
            .map_err(|e| Error::protocol(e.to_string()))?;
        topic.value = new_value;
        if topic.topic_type == TopicType::String {
            topic.string_version = Some(change.id.clone());
        }
        self.preview.push_back(change.clone());
        Ok(change)
    }

    /// `update` from the server: walk the incoming changes against the head
    /// of the preview deque. A matching id is a confirmation (pop, don't
    /// reapply — it is already reflected locally); a mismatch means the
    /// whole deque from that point on was never going to happen, so unwind
    /// it before applying the authoritative change.
    pub fn handle_update(&mut self, changes: Vec<Change>) {
        for mut change in changes {
            match self.preview.front() {
                Some(head) if head.id == change.id => {
                    self.preview.pop_front();
                }
                _ => {
                    self.rollback_preview();
                    self.apply_authoritative(&mut change);
                }
            }
        }
    }

    /// `reject` from the server: the entire preview path is abandoned.
    pub fn handle_reject(&mut self) {
        self.rollback_preview();
    }

    fn apply_authoritative(&mut self, change: &mut Change) {
        if let Some(topic) = self.topics.get_mut(&change.topic_name) {
            if let Ok(new_value) = change.apply(&topic.value) {
                topic.value = new_value;
                if topic.topic_type == TopicType::String {
                    topic.string_version = Some(change.id.clone());
                }
            }
        }
    }

    fn rollback_preview(&mut self) {
        while let Some(change) = self.preview.pop_back() {
            let inverse = change.inverse();
            if let Some(topic) = self.topics.get_mut(&inverse.topic_name) {
                let mut inverse = inverse;
                if let Ok(restored) = inverse.apply(&topic.value) {
                    topic.value = restored;
                    if topic.topic_type == TopicType::String {
                        topic.string_version = Some(inverse.id.clone());
                    }
                }
            }
        }
    }
}

/// Reconstruct a `TopicValue` from the JSON shape `Topic::to_value` renders
/// it as, the same `init`/`update` wire shape the server sends.
fn topic_value_from_json(topic_type: TopicType, json: &Json) -> Result<TopicValue> {
    let err = || Error::protocol(format!("value does not match topic type {}", topic_type.as_str()));
    match topic_type {
        TopicType::Generic => {
            let value: Value = serde_json::from_value(json.clone()).map_err(|e| Error::protocol(e.to_string()))?;
            Ok(TopicValue::Generic(value))
        }
        TopicType::String => json.as_str().map(|s| TopicValue::Str(s.to_string())).ok_or_else(err),
        TopicType::Int => json.as_i64().map(TopicValue::Int).ok_or_else(err),
        TopicType::Float => json.as_f64().map(TopicValue::Float).ok_or_else(err),
        TopicType::Set | TopicType::List => {
            let items: Vec<Value> = serde_json::from_value(json.clone()).map_err(|e| Error::protocol(e.to_string()))?;
            Ok(if topic_type == TopicType::Set { TopicValue::Set(items) } else { TopicValue::List(items) })
        }
        TopicType::Dict => {
            let map = serde_json::from_value(json.clone()).map_err(|e| Error::protocol(e.to_string()))?;
            Ok(TopicValue::Dict(map))
        }
        TopicType::Event => Ok(TopicValue::Event),
        TopicType::Binary => {
            let encoded = json.as_str().ok_or_else(err)?;
            let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
                .map_err(|e| Error::protocol(e.to_string()))?;
            Ok(TopicValue::Binary(bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use topicsync::change::{ChangeBody, IntKind, StringKind};

    #[test]
    fn propose_applies_immediately_and_queues_preview() {
        let mut mirror = ClientMirror::new();
        mirror.track_topic("counter", TopicType::Int);
        let change = Change::new("counter".into(), TopicType::Int, ChangeBody::Int(IntKind::Add { value: 5 }));
        mirror.propose(change).unwrap();
        assert_eq!(mirror.get("counter"), Some(&TopicValue::Int(5)));
    }

    #[test]
    fn matching_update_confirms_without_reapplying() {
        let mut mirror = ClientMirror::new();
        mirror.track_topic("counter", TopicType::Int);
        let change = Change::new("counter".into(), TopicType::Int, ChangeBody::Int(IntKind::Add { value: 5 }));
        let committed = mirror.propose(change).unwrap();
        mirror.handle_update(vec![committed]);
        assert_eq!(mirror.get("counter"), Some(&TopicValue::Int(5)));
    }

    #[test]
    fn mismatched_update_unwinds_preview_then_applies_authoritative() {
        let mut mirror = ClientMirror::new();
        mirror.track_topic("counter", TopicType::Int);
        let local = Change::new("counter".into(), TopicType::Int, ChangeBody::Int(IntKind::Add { value: 5 }));
        mirror.propose(local).unwrap();

        let authoritative =
            Change::new("counter".into(), TopicType::Int, ChangeBody::Int(IntKind::Add { value: 100 }));
        mirror.handle_update(vec![authoritative]);
        assert_eq!(mirror.get("counter"), Some(&TopicValue::Int(100)));
    }

    #[test]
    fn reject_unwinds_the_whole_preview_path() {
        let mut mirror = ClientMirror::new();
        mirror.track_topic("room/title", TopicType::String);
        let version = mirror.string_version("room/title").unwrap().to_string();
        let change = Change::new(
            "room/title".into(),
            TopicType::String,
            ChangeBody::Str(StringKind::Insert { pos: 0, text: "hi".into(), base_version: version }),
        );
        mirror.propose(change).unwrap();
        assert_eq!(mirror.get("room/title"), Some(&TopicValue::Str("hi".to_string())));

        mirror.handle_reject();
        assert_eq!(mirror.get("room/title"), Some(&TopicValue::Str(String::new())));
    }
}
