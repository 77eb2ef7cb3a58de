//! Tree node wire format and its in-memory form
//!
//! On the wire a node is `{e: [{k, p, t, v}], l}`: keys are prefix-compressed
//! against the previous entry, `l` points at the subtree left of the first
//! entry and each `t` at the subtree right of its entry. In memory a node is a
//! flat list alternating leaves and subtree pointers.

use std::fmt;

use cid::Cid;
use serde::{Deserialize, Serialize};

use crate::error::RepoError;
use crate::types::key::is_valid_key;

/// Serialized node. Fields are declared in canonical DAG-CBOR key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(rename = "e")]
    pub entries: Vec<TreeEntry>,
    #[serde(rename = "l")]
    pub left: Option<Cid>,
}

/// Serialized entry. Fields are declared in canonical DAG-CBOR key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    #[serde(rename = "k", with = "serde_bytes")]
    pub key_suffix: Vec<u8>,
    #[serde(rename = "p")]
    pub prefix_len: u64,
    #[serde(rename = "t")]
    pub tree: Option<Cid>,
    #[serde(rename = "v")]
    pub value: Cid,
}

/// A key/value pair stored in the tree
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Leaf {
    pub key: String,
    pub value: Cid,
}

/// One slot of an in-memory node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEntry {
    Leaf(Leaf),
    Tree(Cid),
}

impl NodeEntry {
    pub fn is_tree(&self) -> bool {
        matches!(self, NodeEntry::Tree(_))
    }

    pub fn as_leaf(&self) -> Option<&Leaf> {
        match self {
            NodeEntry::Leaf(leaf) => Some(leaf),
            NodeEntry::Tree(_) => None,
        }
    }
}

/// Exclusive key bounds that every key under a subtree must fall within.
///
/// A subtree between two leaves of its parent may only hold keys strictly
/// between them; at either end of a node the parent's own bound applies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Option<String>,
    pub upper: Option<String>,
}

impl KeyRange {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lower.as_deref().map_or(true, |lower| key > lower)
            && self.upper.as_deref().map_or(true, |upper| key < upper)
    }

    /// Bounds for the subtree at `entries[index]` of a node bounded by
    /// `self`: its neighbouring leaves, or `self` at either end of the node
    pub fn for_subtree(&self, entries: &[NodeEntry], index: usize) -> KeyRange {
        let lower = match index.checked_sub(1).and_then(|i| entries.get(i)) {
            Some(NodeEntry::Leaf(leaf)) => Some(leaf.key.clone()),
            _ => self.lower.clone(),
        };
        let upper = match entries.get(index + 1) {
            Some(NodeEntry::Leaf(leaf)) => Some(leaf.key.clone()),
            _ => self.upper.clone(),
        };
        KeyRange { lower, upper }
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {})",
            self.lower.as_deref().unwrap_or(".."),
            self.upper.as_deref().unwrap_or("..")
        )
    }
}

/// A decoded node together with the layer it sits on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub entries: Vec<NodeEntry>,
    pub layer: u32,
}

impl Node {
    pub fn empty(layer: u32) -> Self {
        Self {
            entries: Vec::new(),
            layer,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn leaves(&self) -> impl DoubleEndedIterator<Item = &Leaf> {
        self.entries.iter().filter_map(NodeEntry::as_leaf)
    }

    pub fn subtrees(&self) -> impl DoubleEndedIterator<Item = &Cid> {
        self.entries.iter().filter_map(|e| match e {
            NodeEntry::Tree(cid) => Some(cid),
            NodeEntry::Leaf(_) => None,
        })
    }

    /// Index of the first leaf whose key is >= `key`, or `entries.len()`
    pub fn find_gt_or_equal_leaf_index(&self, key: &str) -> usize {
        find_gt_or_equal_leaf_index(&self.entries, key)
    }

    /// The entry just before `index` when it is a subtree pointer
    pub fn subtree_before(&self, index: usize) -> Option<Cid> {
        match index.checked_sub(1).and_then(|i| self.entries.get(i)) {
            Some(NodeEntry::Tree(cid)) => Some(*cid),
            _ => None,
        }
    }

    /// Check that every leaf of this node lies inside `range`
    pub fn check_range(&self, cid: &Cid, range: &KeyRange) -> Result<(), RepoError> {
        // leaves are already sorted, so only the ends can escape
        let first = self.leaves().next();
        let last = self.leaves().next_back();
        for leaf in first.into_iter().chain(last) {
            if !range.contains(&leaf.key) {
                return Err(RepoError::MalformedNode(format!(
                    "{}: key {} outside its parent's range {}",
                    cid, leaf.key, range
                )));
            }
        }
        Ok(())
    }

    /// Convert to wire form, prefix-compressing keys
    pub fn to_data(&self) -> Result<NodeData, RepoError> {
        let mut data = NodeData {
            entries: Vec::with_capacity(self.entries.len()),
            left: None,
        };

        let mut iter = self.entries.iter().peekable();
        if let Some(NodeEntry::Tree(cid)) = iter.peek() {
            data.left = Some(*cid);
            iter.next();
        }

        let mut last_key: &str = "";
        while let Some(entry) = iter.next() {
            let leaf = match entry {
                NodeEntry::Leaf(leaf) => leaf,
                NodeEntry::Tree(_) => {
                    return Err(RepoError::MalformedNode(
                        "two subtrees next to each other".to_string(),
                    ))
                }
            };
            let tree = match iter.peek() {
                Some(NodeEntry::Tree(cid)) => {
                    let cid = *cid;
                    iter.next();
                    Some(cid)
                }
                _ => None,
            };
            let prefix_len = common_prefix_len(last_key, &leaf.key);
            data.entries.push(TreeEntry {
                key_suffix: leaf.key.as_bytes()[prefix_len..].to_vec(),
                prefix_len: prefix_len as u64,
                tree,
                value: leaf.value,
            });
            last_key = &leaf.key;
        }

        Ok(data)
    }

    /// Rebuild the flat entry list from wire form.
    ///
    /// Checks that keys are valid and strictly increasing and that prefix
    /// lengths stay within the previous key. Layer checks need the fanout
    /// and happen in the tree engine.
    pub fn entries_from_data(data: &NodeData) -> Result<Vec<NodeEntry>, RepoError> {
        let mut entries = Vec::with_capacity(data.entries.len() * 2 + 1);
        if let Some(left) = data.left {
            entries.push(NodeEntry::Tree(left));
        }

        let mut last_key: Vec<u8> = Vec::new();
        for (i, entry) in data.entries.iter().enumerate() {
            let prefix_len = usize::try_from(entry.prefix_len).unwrap_or(usize::MAX);
            if prefix_len > last_key.len() {
                return Err(RepoError::MalformedNode(format!(
                    "entry {} prefix length {} exceeds previous key length {}",
                    i,
                    entry.prefix_len,
                    last_key.len()
                )));
            }
            let mut key_bytes = last_key[..prefix_len].to_vec();
            key_bytes.extend_from_slice(&entry.key_suffix);
            let key = String::from_utf8(key_bytes.clone()).map_err(|_| {
                RepoError::MalformedNode(format!("entry {} key is not UTF-8", i))
            })?;
            if !is_valid_key(&key) {
                return Err(RepoError::MalformedNode(format!("invalid key {:?}", key)));
            }
            if i > 0 && key_bytes <= last_key {
                return Err(RepoError::MalformedNode(format!(
                    "keys out of order at {:?}",
                    key
                )));
            }

            entries.push(NodeEntry::Leaf(Leaf {
                key,
                value: entry.value,
            }));
            if let Some(tree) = entry.tree {
                entries.push(NodeEntry::Tree(tree));
            }
            last_key = key_bytes;
        }

        Ok(entries)
    }
}

pub(crate) fn find_gt_or_equal_leaf_index(entries: &[NodeEntry], key: &str) -> usize {
    entries
        .iter()
        .position(|entry| matches!(entry, NodeEntry::Leaf(leaf) if leaf.key.as_str() >= key))
        .unwrap_or(entries.len())
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}
