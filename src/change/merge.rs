//! Per-type coalescing of buffered changes for non-stateful-topic flush and
//! for the update buffer's periodic merge pass (spec "Merge (buffer
//! coalescing)"). Only string and list topics coalesce; every other kind
//! passes its changes through untouched.

use super::{Change, ChangeBody, ListKind, StringKind};
use crate::value::TopicType;

pub fn merge_changes(topic_type: TopicType, changes: Vec<Change>) -> Vec<Change> {
    match topic_type {
        TopicType::String | TopicType::List => coalesce_on_set(changes),
        _ => changes,
    }
}

fn is_set(change: &Change) -> bool {
    matches!(
        change.body,
        ChangeBody::Str(StringKind::Set { .. }) | ChangeBody::List(ListKind::Set { .. })
    )
}

/// A `set` overwrites everything queued before it; only the latest `set` and
/// whatever comes after it survive.
fn coalesce_on_set(changes: Vec<Change>) -> Vec<Change> {
    let mut out: Vec<Change> = Vec::new();
    for change in changes {
        if is_set(&change) {
            out.clear();
        }
        out.push(change);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::StringKind;
    use crate::value::TopicType;

    fn set_change(value: &str) -> Change {
        Change::new(
            "s".into(),
            TopicType::String,
            ChangeBody::Str(StringKind::Set {
                old_value: String::new(),
                value: value.into(),
            }),
        )
    }

    fn insert_change(pos: usize, text: &str) -> Change {
        Change::new(
            "s".into(),
            TopicType::String,
            ChangeBody::Str(StringKind::Insert {
                pos,
                text: text.into(),
                base_version: "v0".into(),
            }),
        )
    }

    #[test]
    fn set_drops_earlier_pending_changes() {
        let changes = vec![insert_change(0, "a"), set_change("hello"), insert_change(5, "!")];
        let merged = merge_changes(TopicType::String, changes);
        assert_eq!(merged.len(), 2);
        assert!(matches!(merged[0].body, ChangeBody::Str(StringKind::Set { .. })));
        assert!(matches!(merged[1].body, ChangeBody::Str(StringKind::Insert { .. })));
    }

    #[test]
    fn non_coalescing_type_passes_through() {
        let changes = vec![set_change("a"), set_change("b")];
        let merged = merge_changes(TopicType::Int, changes.clone());
        assert_eq!(merged.len(), changes.len());
    }
}
