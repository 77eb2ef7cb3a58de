//! Tree diffing
//!
//! Both trees are walked top-down in tandem as two ordered streams of leaves
//! and unexpanded subtrees. Whenever the heads of both streams are the same
//! subtree CID the whole subtree is skipped, so the cost is proportional to
//! the number of changed leaves, not the size of the trees.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use cid::Cid;
use serde::Serialize;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::RepoError;
use crate::store::BlockStore;
use super::node::{Leaf, NodeEntry};
use super::Mst;

/// Kind of change to a single key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Create => "create",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }
}

/// One changed key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub op: ChangeOp,
    pub key: String,
    pub old_value: Option<Cid>,
    pub new_value: Option<Cid>,
}

/// Ordered changes between two tree versions plus the blocks they touch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    /// Changes in ascending key order
    pub changes: Vec<Change>,
    /// Node and record CIDs referenced by the new tree but not the old one
    pub new_blocks: BTreeSet<Cid>,
    /// Node and record CIDs referenced by the old tree but not the new one
    pub removed_blocks: BTreeSet<Cid>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn creates(&self) -> impl Iterator<Item = &Change> {
        self.of_kind(ChangeOp::Create)
    }

    pub fn updates(&self) -> impl Iterator<Item = &Change> {
        self.of_kind(ChangeOp::Update)
    }

    pub fn deletes(&self) -> impl Iterator<Item = &Change> {
        self.of_kind(ChangeOp::Delete)
    }

    fn of_kind(&self, op: ChangeOp) -> impl Iterator<Item = &Change> {
        self.changes.iter().filter(move |c| c.op == op)
    }
}

enum Item {
    Leaf(Leaf),
    Tree { cid: Cid, layer: u32 },
}

/// One side of the tandem walk; the top of the stack is the next item in key order
struct Side<'m, 'a, S: BlockStore + ?Sized> {
    mst: &'m Mst<'a, S>,
    stack: Vec<Item>,
    expanded: BTreeSet<Cid>,
    cancel: &'m CancelToken,
}

impl<'m, 'a, S: BlockStore + ?Sized> Side<'m, 'a, S> {
    fn new(mst: &'m Mst<'a, S>, root: Option<&Cid>, cancel: &'m CancelToken) -> Result<Self, RepoError> {
        let mut side = Side {
            mst,
            stack: Vec::new(),
            expanded: BTreeSet::new(),
            cancel,
        };
        if let Some(root) = root {
            cancel.check()?;
            let layer = mst.layer(root)?;
            side.stack.push(Item::Tree { cid: *root, layer });
        }
        Ok(side)
    }

    /// Replace the subtree on top of the stack with its entries
    fn expand(&mut self) -> Result<(), RepoError> {
        let (cid, layer) = match self.stack.pop() {
            Some(Item::Tree { cid, layer }) => (cid, layer),
            Some(other) => {
                self.stack.push(other);
                return Ok(());
            }
            None => return Ok(()),
        };
        self.cancel.check()?;
        let node = self.mst.read_node(&cid, Some(layer))?;
        self.expanded.insert(cid);
        let child_layer = layer.saturating_sub(1);
        for entry in node.entries.into_iter().rev() {
            self.stack.push(match entry {
                NodeEntry::Leaf(leaf) => Item::Leaf(leaf),
                NodeEntry::Tree(cid) => Item::Tree {
                    cid,
                    layer: child_layer,
                },
            });
        }
        Ok(())
    }
}

impl<'a, S: BlockStore + ?Sized> Mst<'a, S> {
    /// Diff two tree versions. `old = None` treats every leaf of `new` as created.
    pub fn diff(&self, old: Option<&Cid>, new: &Cid) -> Result<Changeset, RepoError> {
        self.diff_with_cancel(old, new, &CancelToken::new())
    }

    /// Diff that stops with `Cancelled` once `cancel` fires
    pub fn diff_with_cancel(
        &self,
        old: Option<&Cid>,
        new: &Cid,
        cancel: &CancelToken,
    ) -> Result<Changeset, RepoError> {
        let mut changeset = Changeset::default();
        if old == Some(new) {
            return Ok(changeset);
        }

        let mut left = Side::new(self, old, cancel)?;
        let mut right = Side::new(self, Some(new), cancel)?;

        loop {
            match (left.stack.last(), right.stack.last()) {
                (None, None) => break,
                (Some(Item::Tree { .. }), None) => left.expand()?,
                (None, Some(Item::Tree { .. })) => right.expand()?,
                (Some(Item::Leaf(_)), None) => {
                    if let Some(Item::Leaf(leaf)) = left.stack.pop() {
                        push_delete(&mut changeset, leaf);
                    }
                }
                (None, Some(Item::Leaf(_))) => {
                    if let Some(Item::Leaf(leaf)) = right.stack.pop() {
                        push_create(&mut changeset, leaf);
                    }
                }
                (Some(Item::Leaf(l)), Some(Item::Leaf(r))) => match l.key.cmp(&r.key) {
                    Ordering::Less => {
                        if let Some(Item::Leaf(leaf)) = left.stack.pop() {
                            push_delete(&mut changeset, leaf);
                        }
                    }
                    Ordering::Greater => {
                        if let Some(Item::Leaf(leaf)) = right.stack.pop() {
                            push_create(&mut changeset, leaf);
                        }
                    }
                    Ordering::Equal => {
                        if let (Some(Item::Leaf(old_leaf)), Some(Item::Leaf(new_leaf))) =
                            (left.stack.pop(), right.stack.pop())
                        {
                            if old_leaf.value != new_leaf.value {
                                changeset.changes.push(Change {
                                    op: ChangeOp::Update,
                                    key: new_leaf.key,
                                    old_value: Some(old_leaf.value),
                                    new_value: Some(new_leaf.value),
                                });
                            }
                        }
                    }
                },
                (
                    Some(Item::Tree { cid: l, layer: l_layer }),
                    Some(Item::Tree { cid: r, layer: r_layer }),
                ) => {
                    if l == r {
                        left.stack.pop();
                        right.stack.pop();
                    } else {
                        let (l_layer, r_layer) = (*l_layer, *r_layer);
                        if l_layer >= r_layer {
                            left.expand()?;
                        }
                        if r_layer >= l_layer {
                            right.expand()?;
                        }
                    }
                }
                (Some(Item::Tree { .. }), Some(Item::Leaf(_))) => left.expand()?,
                (Some(Item::Leaf(_)), Some(Item::Tree { .. })) => right.expand()?,
            }
        }

        for change in &changeset.changes {
            if let Some(value) = change.new_value {
                changeset.new_blocks.insert(value);
            }
            if let Some(value) = change.old_value {
                changeset.removed_blocks.insert(value);
            }
        }
        changeset
            .new_blocks
            .extend(right.expanded.difference(&left.expanded).copied());
        changeset
            .removed_blocks
            .extend(left.expanded.difference(&right.expanded).copied());

        debug!(
            changes = changeset.changes.len(),
            new_blocks = changeset.new_blocks.len(),
            "computed tree diff"
        );
        Ok(changeset)
    }
}

fn push_create(changeset: &mut Changeset, leaf: Leaf) {
    changeset.changes.push(Change {
        op: ChangeOp::Create,
        key: leaf.key,
        old_value: None,
        new_value: Some(leaf.value),
    });
}

fn push_delete(changeset: &mut Changeset, leaf: Leaf) {
    changeset.changes.push(Change {
        op: ChangeOp::Delete,
        key: leaf.key,
        old_value: Some(leaf.value),
        new_value: None,
    });
}
