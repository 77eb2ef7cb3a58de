//! Merkle Search Tree engine
//!
//! A tree version is identified solely by its root CID. Every mutation reads
//! the nodes on the affected path, builds replacements, writes them to the
//! block store and returns the new root; untouched subtrees are reused by CID.
//!
//! The shape of the tree depends only on its key set: each key lives on the
//! layer given by the leading zero bits of `sha256(key)`, so two trees built
//! from the same keys in any order are byte-identical.

pub mod diff;
pub mod node;
pub mod walk;

use cid::Cid;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::codec;
use crate::error::RepoError;
use crate::store::{BlockMap, BlockStore};
use crate::types::key::ensure_valid_key;

pub use self::node::{KeyRange, Leaf, Node, NodeData, NodeEntry, TreeEntry};
pub use self::walk::LeafWalker;

/// Branching factor of the tree, stored as bits of hash per layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fanout(u32);

impl Fanout {
    /// Fanout 4 (2 bits per layer), used by the deployed network
    pub const DEFAULT: Fanout = Fanout(2);

    /// Accepts 2, 4, 8, 16, 32 or 64
    pub fn new(fanout: u32) -> Result<Self, RepoError> {
        match fanout {
            2 | 4 | 8 | 16 | 32 | 64 => Ok(Fanout(fanout.trailing_zeros())),
            other => Err(RepoError::InvalidArgs(format!(
                "fanout must be a power of two between 2 and 64, got {}",
                other
            ))),
        }
    }

    pub fn bits_per_layer(&self) -> u32 {
        self.0
    }

    pub fn value(&self) -> u32 {
        1 << self.0
    }

    /// Layer of a key: leading zero bits of its sha256, in groups of `bits_per_layer`
    pub fn layer_for_key(&self, key: &str) -> u32 {
        let hash = Sha256::digest(key.as_bytes());
        let mut zeros = 0;
        for byte in hash.iter() {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros / self.0
    }
}

impl Default for Fanout {
    fn default() -> Self {
        Fanout::DEFAULT
    }
}

/// Tree operations over a block store
pub struct Mst<'a, S: BlockStore + ?Sized> {
    store: &'a S,
    fanout: Fanout,
}

impl<'a, S: BlockStore + ?Sized> Clone for Mst<'a, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, S: BlockStore + ?Sized> Copy for Mst<'a, S> {}

impl<'a, S: BlockStore + ?Sized> Mst<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self::with_fanout(store, Fanout::default())
    }

    pub fn with_fanout(store: &'a S, fanout: Fanout) -> Self {
        Self { store, fanout }
    }

    pub fn store(&self) -> &'a S {
        self.store
    }

    pub fn fanout(&self) -> Fanout {
        self.fanout
    }

    /// Write the empty node and return its CID
    pub fn create_empty(&self) -> Result<Cid, RepoError> {
        self.persist(&Node::empty(0))
    }

    /// Build a tree from scratch out of key/value pairs
    pub fn build<I>(&self, leaves: I) -> Result<Cid, RepoError>
    where
        I: IntoIterator<Item = (String, Cid)>,
    {
        let mut root = self.create_empty()?;
        for (key, value) in leaves {
            root = self.insert(&root, &key, &value)?;
        }
        Ok(root)
    }

    /// Fetch and decode a node.
    ///
    /// `layer` is known for every node reached from a parent; for roots it is
    /// derived from the content. Every leaf must sit on the node's layer.
    pub fn read_node(&self, cid: &Cid, layer: Option<u32>) -> Result<Node, RepoError> {
        let bytes = self.store.get_required(cid)?;
        let data: NodeData = codec::decode(&bytes)
            .map_err(|e| RepoError::MalformedNode(format!("{}: {}", cid, e)))?;
        let entries = Node::entries_from_data(&data).map_err(|e| match e {
            RepoError::MalformedNode(reason) => RepoError::MalformedNode(format!("{}: {}", cid, reason)),
            other => other,
        })?;

        let first_leaf_layer = entries
            .iter()
            .find_map(NodeEntry::as_leaf)
            .map(|leaf| self.fanout.layer_for_key(&leaf.key));
        let layer = match (layer, first_leaf_layer) {
            (Some(layer), _) => layer,
            (None, Some(layer)) => layer,
            (None, None) => match entries.first() {
                Some(NodeEntry::Tree(child)) => self.read_node(child, None)?.layer + 1,
                _ => 0,
            },
        };

        for leaf in entries.iter().filter_map(NodeEntry::as_leaf) {
            let key_layer = self.fanout.layer_for_key(&leaf.key);
            if key_layer != layer {
                return Err(RepoError::MalformedNode(format!(
                    "{}: key {} belongs on layer {}, found on layer {}",
                    cid, leaf.key, key_layer, layer
                )));
            }
        }
        if layer == 0 && entries.iter().any(NodeEntry::is_tree) {
            return Err(RepoError::MalformedNode(format!(
                "{}: subtree pointer below layer 0",
                cid
            )));
        }

        Ok(Node { entries, layer })
    }

    /// [`Mst::read_node`] for a node whose keys must fall inside `range`
    pub fn read_node_in(
        &self,
        cid: &Cid,
        layer: Option<u32>,
        range: &KeyRange,
    ) -> Result<Node, RepoError> {
        let node = self.read_node(cid, layer)?;
        node.check_range(cid, range)?;
        Ok(node)
    }

    /// Follow the subtree just before `index`, checked against the bounds
    /// `parent` places on it
    fn descend(
        &self,
        parent: &Node,
        index: usize,
        range: &KeyRange,
    ) -> Result<Option<(Node, KeyRange)>, RepoError> {
        let Some(child) = parent.subtree_before(index) else {
            return Ok(None);
        };
        let layer = parent.layer.checked_sub(1).ok_or_else(|| {
            RepoError::MalformedNode(format!("{}: subtree pointer below layer 0", child))
        })?;
        let child_range = range.for_subtree(&parent.entries, index - 1);
        let node = self.read_node_in(&child, Some(layer), &child_range)?;
        Ok(Some((node, child_range)))
    }

    fn read_child(&self, cid: &Cid, parent_layer: u32) -> Result<Node, RepoError> {
        let layer = parent_layer.checked_sub(1).ok_or_else(|| {
            RepoError::MalformedNode(format!("{}: subtree pointer below layer 0", cid))
        })?;
        self.read_node(cid, Some(layer))
    }

    fn persist(&self, node: &Node) -> Result<Cid, RepoError> {
        let bytes = codec::encode(&node.to_data()?)?;
        self.store.put(bytes)
    }

    /// Layer of the root node
    pub fn layer(&self, root: &Cid) -> Result<u32, RepoError> {
        Ok(self.read_node(root, None)?.layer)
    }

    /// Point lookup
    pub fn get(&self, root: &Cid, key: &str) -> Result<Option<Cid>, RepoError> {
        let mut node = self.read_node(root, None)?;
        let mut range = KeyRange::unbounded();
        loop {
            let index = node.find_gt_or_equal_leaf_index(key);
            if let Some(NodeEntry::Leaf(found)) = node.entries.get(index) {
                if found.key == key {
                    return Ok(Some(found.value));
                }
            }
            match self.descend(&node, index, &range)? {
                Some((child, child_range)) => (node, range) = (child, child_range),
                None => return Ok(None),
            }
        }
    }

    /// Add a key. Re-inserting the same value returns `root` unchanged;
    /// a different value fails with `KeyExists`.
    pub fn insert(&self, root: &Cid, key: &str, value: &Cid) -> Result<Cid, RepoError> {
        ensure_valid_key(key)?;
        match self.get(root, key)? {
            Some(existing) if existing == *value => return Ok(*root),
            Some(_) => return Err(RepoError::KeyExists(key.to_string())),
            None => {}
        }

        let node = self.read_node(root, None)?;
        let key_layer = self.fanout.layer_for_key(key);
        let updated = self.add(node, key, *value, key_layer)?;
        let new_root = self.persist(&updated)?;
        debug!(%key, layer = key_layer, root = %new_root, "inserted key");
        Ok(new_root)
    }

    /// Replace the value of an existing key, `None` if the key is absent
    pub fn update(&self, root: &Cid, key: &str, value: &Cid) -> Result<Option<Cid>, RepoError> {
        ensure_valid_key(key)?;
        let node = self.read_node(root, None)?;
        match self.update_recurse(node, key, *value)? {
            Some(updated) => Ok(Some(self.persist(&updated)?)),
            None => Ok(None),
        }
    }

    /// Remove a key, `None` if the key is absent
    pub fn delete(&self, root: &Cid, key: &str) -> Result<Option<Cid>, RepoError> {
        ensure_valid_key(key)?;
        let node = self.read_node(root, None)?;
        match self.delete_recurse(node, key)? {
            Some(altered) => {
                let trimmed = self.trim_top(altered)?;
                let new_root = self.persist(&trimmed)?;
                debug!(%key, root = %new_root, "deleted key");
                Ok(Some(new_root))
            }
            None => Ok(None),
        }
    }

    fn add(&self, node: Node, key: &str, value: Cid, key_layer: u32) -> Result<Node, RepoError> {
        let Node { mut entries, layer } = node;
        let leaf = NodeEntry::Leaf(Leaf {
            key: key.to_string(),
            value,
        });
        let index = node::find_gt_or_equal_leaf_index(&entries, key);
        let prev_tree = match index.checked_sub(1).and_then(|i| entries.get(i)) {
            Some(NodeEntry::Tree(cid)) => Some(*cid),
            _ => None,
        };

        if key_layer == layer {
            if let Some(NodeEntry::Leaf(found)) = entries.get(index) {
                if found.key == key {
                    return Err(RepoError::KeyExists(key.to_string()));
                }
            }
            match prev_tree {
                Some(prev) => {
                    // the new leaf cuts the subtree to its left in two
                    let child = self.read_child(&prev, layer)?;
                    let (left, right) = self.split_around(child, key)?;
                    let mut replacement = Vec::with_capacity(3);
                    if let Some(left) = left {
                        replacement.push(NodeEntry::Tree(self.persist(&left)?));
                    }
                    replacement.push(leaf);
                    if let Some(right) = right {
                        replacement.push(NodeEntry::Tree(self.persist(&right)?));
                    }
                    entries.splice(index - 1..index, replacement);
                }
                None => entries.insert(index, leaf),
            }
            Ok(Node { entries, layer })
        } else if key_layer < layer {
            match prev_tree {
                Some(prev) => {
                    let child = self.read_child(&prev, layer)?;
                    let child = self.add(child, key, value, key_layer)?;
                    entries[index - 1] = NodeEntry::Tree(self.persist(&child)?);
                }
                None => {
                    let child = self.add(Node::empty(layer - 1), key, value, key_layer)?;
                    entries.insert(index, NodeEntry::Tree(self.persist(&child)?));
                }
            }
            Ok(Node { entries, layer })
        } else {
            // key belongs above this node: split it and grow new parents
            let (mut left, mut right) = self.split_around(Node { entries, layer }, key)?;
            for _ in 1..(key_layer - layer) {
                if let Some(node) = left.take() {
                    left = Some(self.create_parent(node)?);
                }
                if let Some(node) = right.take() {
                    right = Some(self.create_parent(node)?);
                }
            }
            let mut entries = Vec::with_capacity(3);
            if let Some(left) = left {
                entries.push(NodeEntry::Tree(self.persist(&left)?));
            }
            entries.push(leaf);
            if let Some(right) = right {
                entries.push(NodeEntry::Tree(self.persist(&right)?));
            }
            Ok(Node {
                entries,
                layer: key_layer,
            })
        }
    }

    fn create_parent(&self, node: Node) -> Result<Node, RepoError> {
        let layer = node.layer + 1;
        Ok(Node {
            entries: vec![NodeEntry::Tree(self.persist(&node)?)],
            layer,
        })
    }

    /// Split a node into the parts strictly below and above `key`
    fn split_around(&self, node: Node, key: &str) -> Result<(Option<Node>, Option<Node>), RepoError> {
        let Node { mut entries, layer } = node;
        let index = node::find_gt_or_equal_leaf_index(&entries, key);
        let mut right = entries.split_off(index);
        let mut left = entries;

        if let Some(NodeEntry::Tree(last)) = left.last().cloned() {
            left.pop();
            let child = self.read_child(&last, layer)?;
            let (split_left, split_right) = self.split_around(child, key)?;
            if let Some(split_left) = split_left {
                left.push(NodeEntry::Tree(self.persist(&split_left)?));
            }
            if let Some(split_right) = split_right {
                right.insert(0, NodeEntry::Tree(self.persist(&split_right)?));
            }
        }

        let wrap = |entries: Vec<NodeEntry>| {
            if entries.is_empty() {
                None
            } else {
                Some(Node { entries, layer })
            }
        };
        Ok((wrap(left), wrap(right)))
    }

    /// Concatenate two sibling nodes, merging the subtrees that meet in the middle
    fn append_merge(&self, left: Node, right: Node) -> Result<Node, RepoError> {
        if left.layer != right.layer {
            return Err(RepoError::MalformedNode(format!(
                "cannot merge nodes on layers {} and {}",
                left.layer, right.layer
            )));
        }
        let layer = left.layer;
        let mut entries = left.entries;
        let mut right_entries = right.entries;

        if let (Some(NodeEntry::Tree(l)), Some(NodeEntry::Tree(r))) =
            (entries.last().cloned(), right_entries.first().cloned())
        {
            entries.pop();
            right_entries.remove(0);
            let merged = self.append_merge(self.read_child(&l, layer)?, self.read_child(&r, layer)?)?;
            entries.push(NodeEntry::Tree(self.persist(&merged)?));
        }
        entries.extend(right_entries);
        Ok(Node { entries, layer })
    }

    fn update_recurse(&self, node: Node, key: &str, value: Cid) -> Result<Option<Node>, RepoError> {
        let Node { mut entries, layer } = node;
        let index = node::find_gt_or_equal_leaf_index(&entries, key);
        if let Some(NodeEntry::Leaf(found)) = entries.get_mut(index) {
            if found.key == key {
                found.value = value;
                return Ok(Some(Node { entries, layer }));
            }
        }
        let prev = match index.checked_sub(1).and_then(|i| entries.get(i)) {
            Some(NodeEntry::Tree(cid)) => *cid,
            _ => return Ok(None),
        };
        let child = self.read_child(&prev, layer)?;
        match self.update_recurse(child, key, value)? {
            Some(child) => {
                entries[index - 1] = NodeEntry::Tree(self.persist(&child)?);
                Ok(Some(Node { entries, layer }))
            }
            None => Ok(None),
        }
    }

    fn delete_recurse(&self, node: Node, key: &str) -> Result<Option<Node>, RepoError> {
        let Node { mut entries, layer } = node;
        let index = node::find_gt_or_equal_leaf_index(&entries, key);

        if let Some(NodeEntry::Leaf(found)) = entries.get(index) {
            if found.key == key {
                let prev = index.checked_sub(1).and_then(|i| entries.get(i)).cloned();
                let next = entries.get(index + 1).cloned();
                match (prev, next) {
                    (Some(NodeEntry::Tree(prev)), Some(NodeEntry::Tree(next))) => {
                        // removing the leaf makes its two neighbours adjacent
                        let merged = self.append_merge(
                            self.read_child(&prev, layer)?,
                            self.read_child(&next, layer)?,
                        )?;
                        let merged = NodeEntry::Tree(self.persist(&merged)?);
                        entries.splice(index - 1..index + 2, std::iter::once(merged));
                    }
                    _ => {
                        entries.remove(index);
                    }
                }
                return Ok(Some(Node { entries, layer }));
            }
        }

        let prev = match index.checked_sub(1).and_then(|i| entries.get(i)) {
            Some(NodeEntry::Tree(cid)) => *cid,
            _ => return Ok(None),
        };
        let child = self.read_child(&prev, layer)?;
        match self.delete_recurse(child, key)? {
            Some(child) if child.is_empty() => {
                entries.remove(index - 1);
                Ok(Some(Node { entries, layer }))
            }
            Some(child) => {
                entries[index - 1] = NodeEntry::Tree(self.persist(&child)?);
                Ok(Some(Node { entries, layer }))
            }
            None => Ok(None),
        }
    }

    /// Drop root nodes that hold nothing but a single subtree
    fn trim_top(&self, mut node: Node) -> Result<Node, RepoError> {
        while node.entries.len() == 1 {
            let child = match &node.entries[0] {
                NodeEntry::Tree(cid) => *cid,
                NodeEntry::Leaf(_) => break,
            };
            node = self.read_child(&child, node.layer)?;
        }
        Ok(node)
    }

    /// Lazy, ordered walk over leaves with key >= `from`
    pub fn walk_from(&self, root: &Cid, from: Option<&str>) -> Result<LeafWalker<'a, S>, RepoError> {
        LeafWalker::seek(*self, root, from)
    }

    /// Ordered listing with an exclusive `after` cursor and exclusive `before` bound
    pub fn list(
        &self,
        root: &Cid,
        limit: usize,
        after: Option<&str>,
        before: Option<&str>,
    ) -> Result<Vec<Leaf>, RepoError> {
        let mut out = Vec::new();
        for leaf in self.walk_from(root, after)? {
            let leaf = leaf?;
            if Some(leaf.key.as_str()) == after {
                continue;
            }
            if let Some(before) = before {
                if leaf.key.as_str() >= before {
                    break;
                }
            }
            if out.len() >= limit {
                break;
            }
            out.push(leaf);
        }
        Ok(out)
    }

    /// Leaves whose keys start with `prefix`, e.g. one collection
    pub fn list_prefix(
        &self,
        root: &Cid,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Leaf>, RepoError> {
        let mut out = Vec::new();
        for leaf in self.walk_from(root, Some(prefix))? {
            let leaf = leaf?;
            if !leaf.key.starts_with(prefix) || limit.is_some_and(|l| out.len() >= l) {
                break;
            }
            out.push(leaf);
        }
        Ok(out)
    }

    pub fn leaves(&self, root: &Cid) -> Result<Vec<Leaf>, RepoError> {
        self.walk_from(root, None)?.collect()
    }

    pub fn leaf_count(&self, root: &Cid) -> Result<usize, RepoError> {
        let mut count = 0;
        for leaf in self.walk_from(root, None)? {
            leaf?;
            count += 1;
        }
        Ok(count)
    }

    /// CIDs of every node in the tree, parents before children
    pub fn walk_nodes(&self, root: &Cid) -> Result<Vec<Cid>, RepoError> {
        let mut out = Vec::new();
        let mut stack = vec![(*root, None, KeyRange::unbounded())];
        while let Some((cid, layer, range)) = stack.pop() {
            let node = self.read_node_in(&cid, layer, &range)?;
            out.push(cid);
            let child_layer = node.layer.checked_sub(1);
            for (index, entry) in node.entries.iter().enumerate().rev() {
                if let NodeEntry::Tree(child) = entry {
                    stack.push((*child, child_layer, range.for_subtree(&node.entries, index)));
                }
            }
        }
        Ok(out)
    }

    /// Node CIDs from the root down to where `key` lives or would live,
    /// followed by the value CID when the key is present.
    pub fn cids_for_path(&self, root: &Cid, key: &str) -> Result<Vec<Cid>, RepoError> {
        let mut cids = vec![*root];
        let mut node = self.read_node(root, None)?;
        let mut range = KeyRange::unbounded();
        loop {
            let index = node.find_gt_or_equal_leaf_index(key);
            if let Some(NodeEntry::Leaf(found)) = node.entries.get(index) {
                if found.key == key {
                    cids.push(found.value);
                    return Ok(cids);
                }
            }
            let Some(child) = node.subtree_before(index) else {
                return Ok(cids);
            };
            cids.push(child);
            let Some((next, next_range)) = self.descend(&node, index, &range)? else {
                return Ok(cids);
            };
            (node, range) = (next, next_range);
        }
    }

    /// Node blocks proving the presence or absence of `key`
    pub fn proof_blocks(&self, root: &Cid, key: &str) -> Result<BlockMap, RepoError> {
        let mut blocks = BlockMap::new();
        let value = self.get(root, key)?;
        for cid in self.cids_for_path(root, key)? {
            if Some(cid) == value {
                continue;
            }
            blocks.set(cid, self.store.get_required(&cid)?);
        }
        Ok(blocks)
    }
}
