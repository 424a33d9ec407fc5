//! # StateMachine
//!
//! The transactional core: owns every `Topic`, the listener registry fired
//! on each committed change, and the recording-scope machinery that turns a
//! burst of `apply_change` calls (possibly cascading into more `apply_change`
//! calls from `auto` listeners) into one `Transition` and one broadcast.
//!
//! A `Topic` does not know about listeners or mutators (see `topic.rs`'s
//! module doc) — both live here instead, keyed by topic name, so a listener
//! closure can take `&mut StateMachine` and freely mutate other topics.

pub mod history;
pub mod tree;

use std::collections::{HashMap, VecDeque};

use log::{debug, error, warn};

use crate::change::ot::HistOp;
use crate::change::{
    BinaryKind, Change, ChangeBody, DictKind, EventKind, FloatKind, GenericKind, IntKind,
    ListKind, SetKind, StringKind,
};
use crate::error::{BrokerError, Result};
use crate::topic::Topic;
use crate::transition::{ActionSource, Transition};
use crate::value::{TopicType, TopicValue, Value};

pub use history::HistoryStack;
pub use tree::TransitionTree;

/// What the machine is currently doing. Auto listeners only ever fire while
/// `Forwarding`; `Undoing`/`Redoing` replay committed changes without
/// triggering new cascades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Forwarding,
    Undoing,
    Redoing,
}

/// Whether newly-applied stateful changes grow the transition tree (and so
/// fire `auto` listeners) or are treated like non-stateful changes (`manual`
/// only, no cascade).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    Auto,
    Manual,
}

/// Whether a prior auto-listener failure is still being unwound.
/// `Recovering` suppresses further auto-listener firing; `Critical` means a
/// `manual` listener itself failed and the state machine refuses to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorState {
    NoError,
    Recovering,
    Critical,
}

pub type AutoListener =
    Box<dyn FnMut(&mut StateMachine, &mut Change, &TopicValue, &TopicValue) -> Result<()> + Send>;
pub type ManualListener =
    Box<dyn FnMut(&mut StateMachine, &mut Change, &TopicValue, &TopicValue) -> Result<()> + Send>;
pub type RawListener =
    Box<dyn FnMut(&mut StateMachine, &Change, &TopicValue, &TopicValue, bool) + Send>;

#[derive(Default)]
pub struct ListenerHub {
    pub auto: Vec<AutoListener>,
    pub manual: Vec<ManualListener>,
    pub raw: Vec<RawListener>,
}

type AfterTransitionTask = Box<dyn FnOnce(&mut StateMachine) + Send>;

pub struct StateMachine {
    topics: HashMap<String, Topic>,
    listeners: HashMap<String, ListenerHub>,
    run_state: RunState,
    mode: RecordMode,
    error_state: ErrorState,
    recording: bool,
    tree: TransitionTree,
    cursor: Option<usize>,
    changes_made: Vec<Change>,
    call_stack: Vec<String>,
    /// Set while an `auto` listener reacting to an `event` topic's `emit` is
    /// on the stack. A change application failure in that span cannot be
    /// unwound by ordinary subtree rollback (the event's own notifier has
    /// already run side effects outside the tree's bookkeeping), so it
    /// escalates straight to `CRITICAL` instead.
    inside_emit_change: bool,
    after_transition: VecDeque<AfterTransitionTask>,
    pub history: HistoryStack,
    transition_callback: Option<Box<dyn FnMut(&Transition) + Send>>,
    changes_callback: Option<Box<dyn FnMut(&[Change], &str) + Send>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        StateMachine::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        StateMachine {
            topics: HashMap::new(),
            listeners: HashMap::new(),
            run_state: RunState::Idle,
            mode: RecordMode::Auto,
            error_state: ErrorState::NoError,
            recording: false,
            tree: TransitionTree::new(),
            cursor: None,
            changes_made: Vec::new(),
            call_stack: Vec::new(),
            inside_emit_change: false,
            after_transition: VecDeque::new(),
            history: HistoryStack::new(),
            transition_callback: None,
            changes_callback: None,
        }
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn error_state(&self) -> ErrorState {
        self.error_state
    }

    pub fn on_transition(&mut self, cb: impl FnMut(&Transition) + Send + 'static) {
        self.transition_callback = Some(Box::new(cb));
    }

    pub fn on_changes(&mut self, cb: impl FnMut(&[Change], &str) + Send + 'static) {
        self.changes_callback = Some(Box::new(cb));
    }

    // ---- topic registry ----------------------------------------------

    pub fn add_topic(&mut self, name: impl Into<String>, topic_type: TopicType, is_stateful: bool) -> Result<()> {
        let name = name.into();
        if self.topics.contains_key(&name) {
            return Err(BrokerError::TopicExists(name));
        }
        self.topics.insert(name.clone(), Topic::new(name, topic_type, is_stateful));
        Ok(())
    }

    pub fn add_topic_with_value(
        &mut self,
        name: impl Into<String>,
        topic_type: TopicType,
        is_stateful: bool,
        value: TopicValue,
    ) -> Result<()> {
        let name = name.into();
        if self.topics.contains_key(&name) {
            return Err(BrokerError::TopicExists(name));
        }
        self.topics
            .insert(name.clone(), Topic::new(name, topic_type, is_stateful).with_initial_value(value));
        Ok(())
    }

    pub fn remove_topic(&mut self, name: &str) -> Result<()> {
        self.topics
            .remove(name)
            .ok_or_else(|| BrokerError::UnknownTopic(name.to_string()))?;
        self.listeners.remove(name);
        Ok(())
    }

    pub fn has_topic(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    pub fn get_topic(&self, name: &str) -> Option<&Topic> {
        self.topics.get(name)
    }

    pub fn topic_names(&self) -> Vec<&str> {
        self.topics.keys().map(String::as_str).collect()
    }

    pub fn add_validator(&mut self, name: &str, validator: crate::topic::Validator) -> Result<()> {
        let topic = self
            .topics
            .get_mut(name)
            .ok_or_else(|| BrokerError::UnknownTopic(name.to_string()))?;
        topic.add_validator(validator);
        Ok(())
    }

    pub fn add_auto_listener(&mut self, name: &str, listener: AutoListener) {
        self.listeners.entry(name.to_string()).or_default().auto.push(listener);
    }

    pub fn add_manual_listener(&mut self, name: &str, listener: ManualListener) {
        self.listeners.entry(name.to_string()).or_default().manual.push(listener);
    }

    pub fn add_raw_listener(&mut self, name: &str, listener: RawListener) {
        self.listeners.entry(name.to_string()).or_default().raw.push(listener);
    }

    // ---- recording scope ------------------------------------------------

    /// Run `f` inside a recording scope: every `apply_change` made by `f`
    /// (directly or via a cascading `auto` listener) is grouped into one
    /// `Transition` and one broadcast.
    ///
    /// On success: the tree's surviving pre-order becomes a `Transition`
    /// (fired via `on_transition` and pushed to `history`) unless empty or
    /// `emit_transition` is false; then, regardless, the flat changes made
    /// (minus `Null` sentinels) are broadcast via `on_changes` exactly once.
    ///
    /// On failure: every top-level node is rolled back (inverse applied,
    /// `manual` re-fired on the way) and the broadcast is skipped entirely —
    /// partial changes were never sent to a subscriber, so there is nothing
    /// to retract.
    pub fn record<F>(
        &mut self,
        action_source: ActionSource,
        action_id: impl Into<String>,
        allow_reentry: bool,
        emit_transition: bool,
        phase: RunState,
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut StateMachine) -> Result<()>,
    {
        let action_id = action_id.into();
        if self.recording {
            return if allow_reentry {
                f(self)
            } else {
                Err(BrokerError::Reentry)
            };
        }

        self.recording = true;
        self.run_state = phase;

        let result = f(self);

        match result {
            Ok(()) => {
                if emit_transition && !self.tree.is_empty() {
                    let changes = self.tree.pre_order();
                    if !changes.is_empty() {
                        debug!("transition '{action_id}' committed {} change(s)", changes.len());
                        let transition = Transition { changes, action_source, action_id: action_id.clone() };
                        if let Some(cb) = self.transition_callback.as_mut() {
                            cb(&transition);
                        }
                        self.history.record(phase, transition);
                    }
                }
                let filtered: Vec<Change> =
                    self.changes_made.drain(..).filter(|c| !c.is_null() && !c.is_event()).collect();
                if let Some(cb) = self.changes_callback.as_mut() {
                    cb(&filtered, &action_id);
                }
                self.finish_scope();
                self.run_after_transition();
                Ok(())
            }
            Err(e) => {
                warn!("transition '{action_id}' failed, rolling back: {e}");
                if matches!(self.error_state, ErrorState::Critical) {
                    error!("state machine already CRITICAL, refusing recovery for '{action_id}'");
                } else {
                    self.error_state = ErrorState::Recovering;
                    self.rollback_all();
                    if matches!(self.error_state, ErrorState::Critical) {
                        error!("state machine entered CRITICAL after rollback of '{action_id}'");
                    } else {
                        self.error_state = ErrorState::NoError;
                    }
                }
                self.changes_made.clear();
                self.finish_scope();
                Err(e)
            }
        }
    }

    fn finish_scope(&mut self) {
        self.recording = false;
        self.tree = TransitionTree::new();
        self.cursor = None;
        self.run_state = RunState::Idle;
    }

    fn run_after_transition(&mut self) {
        while let Some(task) = self.after_transition.pop_front() {
            task(self);
        }
    }

    /// Queue (or run, or drop) a task per spec §4.3: immediate if `Idle`,
    /// queued until scope exit if `Forwarding`, silently discarded during
    /// `Undoing`/`Redoing` (replays should not schedule new follow-up work).
    pub fn do_after_transition(&mut self, task: impl FnOnce(&mut StateMachine) + Send + 'static) {
        match self.run_state {
            RunState::Idle => task(self),
            RunState::Forwarding => self.after_transition.push_back(Box::new(task)),
            RunState::Undoing | RunState::Redoing => {}
        }
    }

    // ---- applying changes ------------------------------------------------

    /// Apply one change, opening an implicit top-level `Forwarding` scope if
    /// nothing is currently recording (so a direct call from outside a
    /// `record`/`propose` still produces a transition and a broadcast).
    pub fn apply_change(&mut self, change: Change) -> Result<()> {
        if self.recording {
            return self.apply_change_inner(change);
        }
        let action_id = uuid::Uuid::new_v4().to_string();
        self.record(ActionSource::Server, action_id, false, true, RunState::Forwarding, move |sm| {
            sm.apply_change_inner(change)
        })
    }

    /// Apply a batch of changes as one atomic client (or server) action: all
    /// commit together inside one recording scope, one `Transition`, one
    /// broadcast.
    pub fn propose(&mut self, changes: Vec<Change>, action_source: ActionSource, action_id: impl Into<String>) -> Result<()> {
        self.record(action_source, action_id, false, true, RunState::Forwarding, move |sm| {
            for change in changes {
                sm.apply_change_inner(change)?;
            }
            Ok(())
        })
    }

    fn apply_change_inner(&mut self, mut change: Change) -> Result<()> {
        if self.call_stack.contains(&change.topic_name) {
            // Reentrant mutation of a topic already mid-cascade on this call
            // stack: drop it rather than let a listener recurse into itself.
            return Ok(());
        }

        // Rewind a string insert/delete's position (and regenerate its id on
        // drift) against whatever concurrent history has landed since its
        // `base_version`. A no-op for every other change kind. Centralized
        // here so every entry point — a raw `apply_change`, a `propose`d
        // client action, and the `insert_string`/`delete_string`
        // convenience methods — gets the same OT reconciliation.
        self.rewind_string_change(&mut change)?;

        let topic_name = change.topic_name.clone();
        let topic = self
            .topics
            .get_mut(&topic_name)
            .ok_or_else(|| BrokerError::UnknownTopic(topic_name.clone()))?;
        let is_stateful = topic.is_stateful;
        let (old, new) = match topic.apply_change(&mut change) {
            Ok(pair) => pair,
            Err(e) => {
                if self.inside_emit_change {
                    error!(
                        "change application on '{topic_name}' failed inside an event-change \
                         notifier, escalating to CRITICAL: {e}"
                    );
                    self.error_state = ErrorState::Critical;
                }
                return Err(e);
            }
        };

        if !is_stateful || matches!(self.mode, RecordMode::Manual) {
            self.fire_manual(&mut change, &old, &new)?;
            self.changes_made.push(change.clone());
            self.fire_raw(&change, &old, &new, false);
            return Ok(());
        }

        let node_idx = self.tree.insert(self.cursor, change.clone());

        if let Err(e) = self.fire_manual(&mut change, &old, &new) {
            // A manual-listener failure is never recoverable: the spec
            // treats it as a critical, unrecovered error.
            error!("manual listener on '{}' failed: {e}", change.topic_name);
            self.error_state = ErrorState::Critical;
            return Err(e);
        }
        self.tree.set_change(node_idx, change.clone());
        self.changes_made.push(change.clone());
        self.fire_raw(&change, &old, &new, true);

        if matches!(self.run_state, RunState::Forwarding) && matches!(self.error_state, ErrorState::NoError) {
            let prev_cursor = self.cursor;
            self.cursor = Some(node_idx);
            self.call_stack.push(topic_name.clone());
            let entered_emit_change = change.topic_type == TopicType::Event && !self.inside_emit_change;
            if entered_emit_change {
                self.inside_emit_change = true;
            }
            let result = self.fire_auto(&mut change, &old, &new);
            if entered_emit_change {
                self.inside_emit_change = false;
            }
            self.call_stack.pop();
            self.cursor = prev_cursor;

            match result {
                Ok(()) => self.tree.set_change(node_idx, change),
                Err(e) => {
                    if matches!(self.error_state, ErrorState::Critical) {
                        // Already escalated (e.g. a failure inside the event
                        // notifier's own span) — recovery is refused, so
                        // don't attempt a subtree rollback on top of it.
                        return Err(e);
                    }
                    // Only the cascade this node spawned is rolled back; the
                    // node's own committed change survives.
                    debug!("auto listener on '{topic_name}' failed, rolling back its cascade: {e}");
                    self.rollback_children(node_idx);
                    return Err(e);
                }
            }
        }
        // Undoing/Redoing/Recovering: auto listeners stay silent so replay
        // never spawns a fresh cascade.

        Ok(())
    }

    fn fire_manual(&mut self, change: &mut Change, old: &TopicValue, new: &TopicValue) -> Result<()> {
        let topic_name = change.topic_name.clone();
        let mut hub = self.listeners.remove(&topic_name).unwrap_or_default();
        let mut result = Ok(());
        for listener in hub.manual.iter_mut() {
            if let Err(e) = listener(self, change, old, new) {
                result = Err(e);
                break;
            }
        }
        self.listeners.insert(topic_name, hub);
        result
    }

    fn fire_auto(&mut self, change: &mut Change, old: &TopicValue, new: &TopicValue) -> Result<()> {
        let topic_name = change.topic_name.clone();
        let mut hub = self.listeners.remove(&topic_name).unwrap_or_default();
        let mut result = Ok(());
        for listener in hub.auto.iter_mut() {
            if let Err(e) = listener(self, change, old, new) {
                result = Err(e);
                break;
            }
        }
        self.listeners.insert(topic_name, hub);
        result
    }

    fn fire_raw(&mut self, change: &Change, old: &TopicValue, new: &TopicValue, auto: bool) {
        let topic_name = change.topic_name.clone();
        let mut hub = self.listeners.remove(&topic_name).unwrap_or_default();
        for listener in hub.raw.iter_mut() {
            listener(self, change, old, new, auto);
        }
        self.listeners.insert(topic_name, hub);
    }

    // ---- rollback ---------------------------------------------------------

    fn rollback_children(&mut self, node_idx: usize) {
        for child in self.tree.children(node_idx).into_iter().rev() {
            if let Err(e) = self.rollback_subtree(child) {
                error!("manual listener failed during rollback, escalating to CRITICAL: {e}");
                self.error_state = ErrorState::Critical;
            }
        }
    }

    fn rollback_all(&mut self) {
        for idx in self.tree.top_level().into_iter().rev() {
            if let Err(e) = self.rollback_subtree(idx) {
                error!("manual listener failed during rollback, escalating to CRITICAL: {e}");
                self.error_state = ErrorState::Critical;
            }
        }
    }

    /// Recursively undo `idx` and its descendants (children first), applying
    /// each node's inverse to its topic, firing `manual` on the way (the
    /// spec requires the manual hub to see both forward and inverse paths),
    /// and appending the inverse to the flat changes list. If `manual` itself
    /// fails during this unwind, recovery has failed and the caller must
    /// escalate to `CRITICAL` rather than silently swallow it.
    fn rollback_subtree(&mut self, idx: usize) -> Result<()> {
        for child in self.tree.children(idx).into_iter().rev() {
            self.rollback_subtree(child)?;
        }
        let change = self.tree.remove(idx);
        let mut inverse = change.inverse();
        if let Some(topic) = self.topics.get_mut(&change.topic_name) {
            if let Ok((old, new)) = topic.apply_change(&mut inverse) {
                self.fire_manual(&mut inverse, &old, &new)?;
                self.changes_made.push(inverse.clone());
                self.fire_raw(&inverse, &old, &new, false);
            }
        }
        Ok(())
    }

    // ---- undo/redo ---------------------------------------------------------

    /// Replay `transition`'s inverses in reverse order inside an `Undoing`
    /// scope. Auto listeners stay suppressed throughout (`run_state` is
    /// never `Forwarding`), so undoing never spawns a new cascade.
    pub fn undo(&mut self, transition: &Transition) -> Result<()> {
        let inverses: Vec<Change> = transition.changes.iter().rev().map(Change::inverse).collect();
        self.record(
            transition.action_source,
            format!("undo:{}", transition.action_id),
            false,
            false,
            RunState::Undoing,
            move |sm| {
                for change in inverses {
                    sm.apply_change_inner(change)?;
                }
                Ok(())
            },
        )
    }

    /// Replay `transition`'s changes in original order inside a `Redoing`
    /// scope.
    pub fn redo(&mut self, transition: &Transition) -> Result<()> {
        let changes = transition.changes.clone();
        self.record(
            transition.action_source,
            format!("redo:{}", transition.action_id),
            false,
            false,
            RunState::Redoing,
            move |sm| {
                for change in changes {
                    sm.apply_change_inner(change)?;
                }
                Ok(())
            },
        )
    }

    /// Undo the most recent entry in `history`, advancing its cursor.
    pub fn undo_last(&mut self) -> Result<bool> {
        let Some(transition) = self.history.peek_undo().cloned() else {
            return Ok(false);
        };
        self.undo(&transition)?;
        self.history.advance_undo();
        Ok(true)
    }

    /// Redo the next entry in `history`, advancing its cursor.
    pub fn redo_next(&mut self) -> Result<bool> {
        let Some(transition) = self.history.peek_redo().cloned() else {
            return Ok(false);
        };
        self.redo(&transition)?;
        self.history.advance_redo();
        Ok(true)
    }

    // ---- string OT rewind --------------------------------------------------

    fn rewind_string_change(&self, change: &mut Change) -> Result<()> {
        let topic = self
            .topics
            .get(&change.topic_name)
            .ok_or_else(|| BrokerError::UnknownTopic(change.topic_name.clone()))?;
        match &mut change.body {
            ChangeBody::Str(StringKind::Insert { pos, text, base_version }) => {
                let ops: Vec<HistOp> = topic.string_rewind_ops(base_version)?;
                if ops.is_empty() {
                    return Ok(());
                }
                let (new_pos, degenerate) = crate::change::ot::rewind_insert(*pos, false, &ops);
                *pos = new_pos;
                if degenerate {
                    text.clear();
                }
                change.id = format!("{}_adjust", change.id);
            }
            ChangeBody::Str(StringKind::Delete { pos, text, base_version }) => {
                let ops: Vec<HistOp> = topic.string_rewind_ops(base_version)?;
                if ops.is_empty() {
                    return Ok(());
                }
                let (new_pos, new_text) = crate::change::ot::rewind_delete(*pos, text.clone(), &ops);
                *pos = new_pos;
                *text = new_text;
                change.id = format!("{}_adjust", change.id);
            }
            _ => {}
        }
        Ok(())
    }

    // ---- per-type mutators (spec §4.2's Topic-level API, moved here) ------

    fn propose_single(&mut self, topic_name: &str, body: ChangeBody) -> Result<()> {
        let topic = self
            .topics
            .get(topic_name)
            .ok_or_else(|| BrokerError::UnknownTopic(topic_name.to_string()))?;
        if topic.is_noop_set(&body) {
            return Ok(());
        }
        let change = Change::new(topic_name.to_string(), topic.topic_type, body);
        self.apply_change(change)
    }

    pub fn set_generic(&mut self, topic_name: &str, value: Value) -> Result<()> {
        let old_value = self
            .get_topic(topic_name)
            .ok_or_else(|| BrokerError::UnknownTopic(topic_name.to_string()))?
            .value()
            .to_value();
        self.propose_single(topic_name, ChangeBody::Generic(GenericKind::Set { old_value, value }))
    }

    pub fn set_string(&mut self, topic_name: &str, value: impl Into<String>) -> Result<()> {
        let old_value = self.get_topic(topic_name).ok_or_else(|| BrokerError::UnknownTopic(topic_name.to_string()))?.as_str()?.to_string();
        self.propose_single(topic_name, ChangeBody::Str(StringKind::Set { old_value, value: value.into() }))
    }

    pub fn insert_string(&mut self, topic_name: &str, pos: usize, text: impl Into<String>, base_version: impl Into<String>) -> Result<()> {
        if !self.has_topic(topic_name) {
            return Err(BrokerError::UnknownTopic(topic_name.to_string()));
        }
        let change = Change::new(
            topic_name.to_string(),
            TopicType::String,
            ChangeBody::Str(StringKind::Insert { pos, text: text.into(), base_version: base_version.into() }),
        );
        self.apply_change(change)
    }

    pub fn delete_string(&mut self, topic_name: &str, pos: usize, text: impl Into<String>, base_version: impl Into<String>) -> Result<()> {
        if !self.has_topic(topic_name) {
            return Err(BrokerError::UnknownTopic(topic_name.to_string()));
        }
        let change = Change::new(
            topic_name.to_string(),
            TopicType::String,
            ChangeBody::Str(StringKind::Delete { pos, text: text.into(), base_version: base_version.into() }),
        );
        self.apply_change(change)
    }

    pub fn set_int(&mut self, topic_name: &str, value: i64) -> Result<()> {
        let old_value = self.get_topic(topic_name).ok_or_else(|| BrokerError::UnknownTopic(topic_name.to_string()))?.as_int()?;
        self.propose_single(topic_name, ChangeBody::Int(IntKind::Set { old_value, value }))
    }

    pub fn add_int(&mut self, topic_name: &str, value: i64) -> Result<()> {
        self.propose_single(topic_name, ChangeBody::Int(IntKind::Add { value }))
    }

    pub fn set_float(&mut self, topic_name: &str, value: f64) -> Result<()> {
        let old_value = self.get_topic(topic_name).ok_or_else(|| BrokerError::UnknownTopic(topic_name.to_string()))?.as_float()?;
        self.propose_single(topic_name, ChangeBody::Float(FloatKind::Set { old_value, value }))
    }

    pub fn add_float(&mut self, topic_name: &str, value: f64) -> Result<()> {
        self.propose_single(topic_name, ChangeBody::Float(FloatKind::Add { value }))
    }

    pub fn set_set(&mut self, topic_name: &str, value: Vec<Value>) -> Result<()> {
        let old_value = self.get_topic(topic_name).ok_or_else(|| BrokerError::UnknownTopic(topic_name.to_string()))?.as_set()?.to_vec();
        self.propose_single(topic_name, ChangeBody::Set(SetKind::Set { old_value, value }))
    }

    pub fn append_set(&mut self, topic_name: &str, item: Value) -> Result<()> {
        self.propose_single(topic_name, ChangeBody::Set(SetKind::Append { item }))
    }

    pub fn remove_set(&mut self, topic_name: &str, item: Value) -> Result<()> {
        self.propose_single(topic_name, ChangeBody::Set(SetKind::Remove { item }))
    }

    pub fn set_list(&mut self, topic_name: &str, value: Vec<Value>) -> Result<()> {
        let old_value = self.get_topic(topic_name).ok_or_else(|| BrokerError::UnknownTopic(topic_name.to_string()))?.as_list()?.to_vec();
        self.propose_single(topic_name, ChangeBody::List(ListKind::Set { old_value, value }))
    }

    pub fn insert_list(&mut self, topic_name: &str, item: Value, pos: i64) -> Result<()> {
        let change = Change::new(
            topic_name.to_string(),
            TopicType::List,
            ChangeBody::List(ListKind::Insert { item, pos, resolved_pos: None }),
        );
        self.apply_change(change)
    }

    pub fn pop_list(&mut self, topic_name: &str, pos: i64) -> Result<()> {
        let change = Change::new(
            topic_name.to_string(),
            TopicType::List,
            ChangeBody::List(ListKind::Pop { pos, removed: None }),
        );
        self.apply_change(change)
    }

    pub fn set_dict(&mut self, topic_name: &str, value: indexmap::IndexMap<String, Value>) -> Result<()> {
        let old_value = self.get_topic(topic_name).ok_or_else(|| BrokerError::UnknownTopic(topic_name.to_string()))?.as_dict()?.clone();
        self.propose_single(topic_name, ChangeBody::Dict(DictKind::Set { old_value, value }))
    }

    pub fn add_dict(&mut self, topic_name: &str, key: impl Into<String>, value: Value) -> Result<()> {
        let change = Change::new(
            topic_name.to_string(),
            TopicType::Dict,
            ChangeBody::Dict(DictKind::Add { key: key.into(), value }),
        );
        self.apply_change(change)
    }

    pub fn pop_dict(&mut self, topic_name: &str, key: impl Into<String>) -> Result<()> {
        let change = Change::new(
            topic_name.to_string(),
            TopicType::Dict,
            ChangeBody::Dict(DictKind::Pop { key: key.into(), removed: None }),
        );
        self.apply_change(change)
    }

    pub fn change_value_dict(&mut self, topic_name: &str, key: impl Into<String>, old_value: Value, value: Value) -> Result<()> {
        let change = Change::new(
            topic_name.to_string(),
            TopicType::Dict,
            ChangeBody::Dict(DictKind::ChangeValue { key: key.into(), old_value, value }),
        );
        self.apply_change(change)
    }

    pub fn emit_event(&mut self, topic_name: &str, args: Value) -> Result<()> {
        let change = Change::new(
            topic_name.to_string(),
            TopicType::Event,
            ChangeBody::Event(EventKind::Emit { args, forward_info: None }),
        );
        self.apply_change(change)
    }

    pub fn set_binary(&mut self, topic_name: &str, value: Vec<u8>) -> Result<()> {
        let old_value = match self.get_topic(topic_name).ok_or_else(|| BrokerError::UnknownTopic(topic_name.to_string()))?.value() {
            TopicValue::Binary(b) => b.clone(),
            _ => return Err(BrokerError::invalid(topic_name.to_string(), "not a binary topic")),
        };
        self.propose_single(topic_name, ChangeBody::Binary(BinaryKind::Set { old_value, value }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn simple_change_broadcasts_exactly_once() {
        let mut sm = StateMachine::new();
        sm.add_topic("n", TopicType::Int, true).unwrap();
        let seen: Arc<Mutex<Vec<Vec<Change>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        sm.on_changes(move |changes, _action_id| {
            seen_cb.lock().unwrap().push(changes.to_vec());
        });

        sm.add_int("n", 5).unwrap();

        let batches = seen.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(sm.get_topic("n").unwrap().as_int().unwrap(), 5);
    }

    #[test]
    fn reactive_cascade_nests_under_its_trigger() {
        let mut sm = StateMachine::new();
        sm.add_topic("a", TopicType::Int, true).unwrap();
        sm.add_topic("b", TopicType::Int, true).unwrap();
        sm.add_auto_listener(
            "a",
            Box::new(|sm, _change, _old, _new| sm.add_int("b", 100)),
        );

        let transitions: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let transitions_cb = transitions.clone();
        sm.on_transition(move |t| transitions_cb.lock().unwrap().push(t.changes.len()));

        sm.add_int("a", 1).unwrap();

        assert_eq!(sm.get_topic("a").unwrap().as_int().unwrap(), 1);
        assert_eq!(sm.get_topic("b").unwrap().as_int().unwrap(), 100);
        // one transition, with both the trigger and its cascade child
        assert_eq!(*transitions.lock().unwrap(), vec![2]);
    }

    #[test]
    fn auto_listener_failure_rolls_back_only_its_cascade() {
        let mut sm = StateMachine::new();
        sm.add_topic("a", TopicType::Int, true).unwrap();
        sm.add_topic("b", TopicType::Int, true).unwrap();
        sm.add_auto_listener("a", Box::new(|sm, _change, _old, _new| {
            sm.add_int("b", 100)?;
            Err(BrokerError::invalid("a", "downstream validator rejected"))
        }));

        let result = sm.add_int("a", 1);
        assert!(result.is_err());
        // the cascade's own change to "b" is rolled back...
        assert_eq!(sm.get_topic("b").unwrap().as_int().unwrap(), 0);
        // ...but the whole scope failed, so "a" is rolled back too via rollback_all
        assert_eq!(sm.get_topic("a").unwrap().as_int().unwrap(), 0);
    }

    #[test]
    fn manual_listener_sees_forward_and_inverse_paths() {
        let mut sm = StateMachine::new();
        sm.add_topic("a", TopicType::Int, true).unwrap();
        sm.add_topic("trigger", TopicType::Int, true).unwrap();
        let seen: Arc<Mutex<i64>> = Arc::new(Mutex::new(0));
        let seen_cb = seen.clone();
        sm.add_manual_listener("a", Box::new(move |_sm, _change, _old, new| {
            if let TopicValue::Int(n) = new {
                *seen_cb.lock().unwrap() = *n;
            }
            Ok(())
        }));
        sm.add_auto_listener("trigger", Box::new(|sm, _c, _o, _n| {
            sm.add_int("a", 7)?;
            Err(BrokerError::invalid("trigger", "force rollback"))
        }));

        let _ = sm.add_int("trigger", 1);
        // manual fired on the forward int-add (7) then again on its inverse (0)
        assert_eq!(*seen.lock().unwrap(), 0);
        assert_eq!(sm.get_topic("a").unwrap().as_int().unwrap(), 0);
    }

    #[test]
    fn undo_then_redo_round_trips_through_history() {
        let mut sm = StateMachine::new();
        sm.add_topic("n", TopicType::Int, true).unwrap();

        // `record` pushes the committed transition into `sm.history` itself.
        sm.add_int("n", 10).unwrap();

        assert_eq!(sm.get_topic("n").unwrap().as_int().unwrap(), 10);
        assert!(sm.undo_last().unwrap());
        assert_eq!(sm.get_topic("n").unwrap().as_int().unwrap(), 0);
        assert!(sm.redo_next().unwrap());
        assert_eq!(sm.get_topic("n").unwrap().as_int().unwrap(), 10);
    }
}
