//! A `Transition` is the unit of undo/redo: the ordered list of changes
//! committed by one recording scope, plus who asked for it.

use crate::change::Change;

/// Who opened the recording scope that produced a `Transition`. Carried
/// through so the server can avoid echoing a transition back to its own
/// originator and so history entries can be attributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionSource {
    /// The server itself (startup, a reactive cascade with no client behind
    /// it, a meta-topic mutation).
    Server,
    /// A connected client, identified by its allocated id.
    Client(u64),
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub changes: Vec<Change>,
    pub action_source: ActionSource,
    pub action_id: String,
}

impl Transition {
    pub fn new(action_source: ActionSource, action_id: impl Into<String>) -> Self {
        Transition {
            changes: Vec::new(),
            action_source,
            action_id: action_id.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
