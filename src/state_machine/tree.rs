//! The transition tree: a value-typed arena recording every change applied
//! during the current recording scope, in the exact structure a reactive
//! cascade produced it (a change's `auto` listeners become its children).
//!
//! Nodes hold an index to their parent plus a `Vec<index>` of children —
//! there are no owning references back up the tree, so clearing a subtree is
//! a matter of walking indices, never following a reference cycle.

use crate::change::Change;

struct Node {
    change: Change,
    parent: Option<usize>,
    children: Vec<usize>,
}

#[derive(Default)]
pub struct TransitionTree {
    nodes: Vec<Option<Node>>,
    root_children: Vec<usize>,
}

impl TransitionTree {
    pub fn new() -> Self {
        TransitionTree::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root_children.is_empty()
    }

    /// Attach `change` as a new node under `parent` (or at the top level if
    /// `None`), returning its index.
    pub fn insert(&mut self, parent: Option<usize>, change: Change) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(Some(Node { change, parent, children: Vec::new() }));
        match parent {
            Some(p) => {
                if let Some(node) = self.nodes[p].as_mut() {
                    node.children.push(idx);
                }
            }
            None => self.root_children.push(idx),
        }
        idx
    }

    pub fn change(&self, idx: usize) -> &Change {
        &self.nodes[idx].as_ref().expect("live node").change
    }

    /// Overwrite a node's change in place, keeping its position in the tree.
    /// Used after a listener mutates bookkeeping fields (e.g. an event's
    /// `forward_info`) that must be reflected in the committed record.
    pub fn set_change(&mut self, idx: usize, change: Change) {
        if let Some(node) = self.nodes[idx].as_mut() {
            node.change = change;
        }
    }

    pub fn children(&self, idx: usize) -> Vec<usize> {
        self.nodes[idx]
            .as_ref()
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub fn top_level(&self) -> Vec<usize> {
        self.root_children.clone()
    }

    /// Detach `idx` from its parent (or the top level) and remove it from
    /// the arena, returning its change.
    pub fn remove(&mut self, idx: usize) -> Change {
        let node = self.nodes[idx].take().expect("live node");
        match node.parent {
            Some(parent) => {
                if let Some(p) = self.nodes[parent].as_mut() {
                    p.children.retain(|&c| c != idx);
                }
            }
            None => self.root_children.retain(|&c| c != idx),
        }
        node.change
    }

    /// The surviving changes in the exact pre-order a forward cascade
    /// recorded them: a node, then its children, before moving to the next
    /// sibling.
    pub fn pre_order(&self) -> Vec<Change> {
        let mut out = Vec::new();
        for &idx in &self.root_children {
            self.visit(idx, &mut out);
        }
        out
    }

    fn visit(&self, idx: usize, out: &mut Vec<Change>) {
        if let Some(node) = &self.nodes[idx] {
            out.push(node.change.clone());
            for &child in &node.children {
                self.visit(child, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeBody, IntKind};
    use crate::value::TopicType;

    fn c(n: i64) -> Change {
        Change::new("x".into(), TopicType::Int, ChangeBody::Int(IntKind::Add { value: n }))
    }

    #[test]
    fn pre_order_matches_insertion_for_nested_cascade() {
        let mut tree = TransitionTree::new();
        let a = tree.insert(None, c(1));
        let b = tree.insert(Some(a), c(2));
        let _c = tree.insert(Some(b), c(3));
        let d = tree.insert(None, c(4));
        let order: Vec<i64> = tree
            .pre_order()
            .into_iter()
            .map(|ch| match ch.body {
                ChangeBody::Int(IntKind::Add { value }) => value,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
        let _ = d;
    }

    #[test]
    fn remove_detaches_from_parent_and_pre_order() {
        let mut tree = TransitionTree::new();
        let a = tree.insert(None, c(1));
        let b = tree.insert(Some(a), c(2));
        tree.remove(b);
        let order: Vec<i64> = tree
            .pre_order()
            .into_iter()
            .map(|ch| match ch.body {
                ChangeBody::Int(IntKind::Add { value }) => value,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![1]);
    }
}
