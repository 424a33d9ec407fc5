//! A stack of committed `Transition`s with an undo/redo cursor, supplementing
//! the bare `undo`/`redo` primitives with the bookkeeping a history-manager
//! UI would otherwise have to keep itself.

use crate::state_machine::RunState;
use crate::transition::Transition;

#[derive(Default)]
pub struct HistoryStack {
    stack: Vec<Transition>,
    /// Number of entries currently "active"; entries at and after this index
    /// have been undone and remain only for `redo`.
    cursor: usize,
}

impl HistoryStack {
    pub fn new() -> Self {
        HistoryStack::default()
    }

    /// Push a freshly committed transition, pruning any redo tail. Only
    /// forward-recorded transitions extend history — undo/redo themselves
    /// replay existing entries rather than creating new ones.
    pub fn record(&mut self, phase: RunState, transition: Transition) {
        if matches!(phase, RunState::Forwarding) && !transition.is_empty() {
            self.stack.truncate(self.cursor);
            self.stack.push(transition);
            self.cursor = self.stack.len();
        }
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.stack.len()
    }

    pub fn peek_undo(&self) -> Option<&Transition> {
        self.cursor.checked_sub(1).and_then(|i| self.stack.get(i))
    }

    pub fn peek_redo(&self) -> Option<&Transition> {
        self.stack.get(self.cursor)
    }

    pub fn advance_undo(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn advance_redo(&mut self) {
        if self.cursor < self.stack.len() {
            self.cursor += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transition::ActionSource;

    fn t() -> Transition {
        let mut t = Transition::new(ActionSource::Server, "a");
        t.changes.push(crate::change::Change::new(
            "x".into(),
            crate::value::TopicType::Int,
            crate::change::ChangeBody::Int(crate::change::IntKind::Add { value: 1 }),
        ));
        t
    }

    #[test]
    fn redo_tail_is_pruned_by_new_forward_record() {
        let mut h = HistoryStack::new();
        h.record(RunState::Forwarding, t());
        h.record(RunState::Forwarding, t());
        h.advance_undo();
        assert!(h.can_redo());
        h.record(RunState::Forwarding, t());
        assert!(!h.can_redo());
        assert!(h.can_undo());
    }
}
