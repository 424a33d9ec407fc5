//! # UpdateBuffer
//!
//! Every change the state machine emits passes through here before reaching
//! a subscriber. Stateful-topic changes go out immediately (subscribers of a
//! live-state topic want to see each value change as it happens); changes on
//! non-stateful topics (events, high-frequency streams) are queued per topic
//! and coalesced by a periodic flush, since a burst of those is usually only
//! interesting as its latest/merged state.

use std::collections::HashMap;

use crate::change::Change;
use crate::value::TopicType;

struct PendingTopic {
    topic_type: TopicType,
    changes: Vec<Change>,
}

/// Buffers non-stateful changes between flushes. Stateful changes never
/// enter the buffer at all — the caller sends those straight through.
#[derive(Default)]
pub struct UpdateBuffer {
    pending: HashMap<String, PendingTopic>,
}

impl UpdateBuffer {
    pub fn new() -> Self {
        UpdateBuffer::default()
    }

    /// Queue a non-stateful change for the next flush.
    pub fn push(&mut self, topic_type: TopicType, change: Change) {
        self.pending
            .entry(change.topic_name.clone())
            .or_insert_with(|| PendingTopic { topic_type, changes: Vec::new() })
            .changes
            .push(change);
    }

    /// A topic was removed from the topology: drop anything still queued for
    /// it so a flush never addresses a dead topic.
    pub fn drop_topic(&mut self, topic_name: &str) {
        self.pending.remove(topic_name);
    }

    /// Run on the buffer's fixed-interval clock tick: merge and drain every
    /// queued topic's changes, ready for one `update` broadcast each.
    pub fn flush(&mut self) -> Vec<(String, Vec<Change>)> {
        self.pending
            .drain()
            .filter_map(|(topic_name, pending)| {
                let merged = crate::change::merge_changes(pending.topic_type, pending.changes);
                if merged.is_empty() {
                    None
                } else {
                    Some((topic_name, merged))
                }
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeBody, StringKind};

    fn insert(topic: &str, pos: usize, text: &str) -> Change {
        Change::new(
            topic.to_string(),
            TopicType::String,
            ChangeBody::Str(StringKind::Insert { pos, text: text.to_string(), base_version: "v".into() }),
        )
    }

    #[test]
    fn flush_drains_and_merges_per_topic() {
        let mut buf = UpdateBuffer::new();
        buf.push(TopicType::String, insert("log", 0, "a"));
        buf.push(TopicType::String, insert("log", 1, "b"));
        let flushed = buf.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].0, "log");
        assert_eq!(flushed[0].1.len(), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn drop_topic_discards_pending_entries() {
        let mut buf = UpdateBuffer::new();
        buf.push(TopicType::String, insert("log", 0, "a"));
        buf.drop_topic("log");
        assert!(buf.flush().is_empty());
    }
}
