use cid::Cid;

use crate::error::RepoError;
use crate::store::BlockStore;
use super::node::{find_gt_or_equal_leaf_index, KeyRange, Leaf, NodeEntry};
use super::Mst;

struct Frame {
    entries: Vec<NodeEntry>,
    layer: u32,
    range: KeyRange,
    pos: usize,
}

/// Lazy in-order iterator over the leaves of a tree.
///
/// Nodes are fetched only when the walk reaches them. Seeding with a key
/// skips every subtree that lies entirely before it, so a listing can be
/// resumed from a cursor without rescanning. Every node reached is checked
/// against the key range its parent allows.
pub struct LeafWalker<'a, S: BlockStore + ?Sized> {
    mst: Mst<'a, S>,
    stack: Vec<Frame>,
    failed: bool,
}

impl<'a, S: BlockStore + ?Sized> LeafWalker<'a, S> {
    pub(crate) fn seek(mst: Mst<'a, S>, root: &Cid, from: Option<&str>) -> Result<Self, RepoError> {
        let mut stack = Vec::new();
        let mut node = mst.read_node(root, None)?;
        let mut range = KeyRange::unbounded();
        loop {
            let pos = match from {
                Some(key) => find_gt_or_equal_leaf_index(&node.entries, key),
                None => 0,
            };
            // with a seek key, the subtree left of `pos` may still hold keys >= from
            let descend = match from {
                Some(_) => node.subtree_before(pos),
                None => None,
            };
            let layer = node.layer;
            let next_range = descend.map(|_| range.for_subtree(&node.entries, pos - 1));
            stack.push(Frame {
                entries: node.entries,
                layer,
                range,
                pos,
            });
            match (descend, next_range) {
                (Some(child), Some(next_range)) => {
                    let child_layer = layer.checked_sub(1).ok_or_else(|| {
                        RepoError::MalformedNode(format!("{}: subtree pointer below layer 0", child))
                    })?;
                    node = mst.read_node_in(&child, Some(child_layer), &next_range)?;
                    range = next_range;
                }
                _ => break,
            }
        }
        Ok(Self {
            mst,
            stack,
            failed: false,
        })
    }
}

impl<'a, S: BlockStore + ?Sized> Iterator for LeafWalker<'a, S> {
    type Item = Result<Leaf, RepoError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let frame = self.stack.last_mut()?;
            if frame.pos >= frame.entries.len() {
                self.stack.pop();
                continue;
            }
            let index = frame.pos;
            let entry = frame.entries[index].clone();
            frame.pos += 1;
            let layer = frame.layer;

            match entry {
                NodeEntry::Leaf(leaf) => return Some(Ok(leaf)),
                NodeEntry::Tree(cid) => {
                    let range = frame.range.for_subtree(&frame.entries, index);
                    let child = layer
                        .checked_sub(1)
                        .ok_or_else(|| {
                            RepoError::MalformedNode(format!("{}: subtree pointer below layer 0", cid))
                        })
                        .and_then(|child_layer| self.mst.read_node_in(&cid, Some(child_layer), &range));
                    match child {
                        Ok(node) => self.stack.push(Frame {
                            entries: node.entries,
                            layer: node.layer,
                            range,
                            pos: 0,
                        }),
                        Err(e) => {
                            self.failed = true;
                            return Some(Err(e));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::codec;
    use crate::mst::Mst;
    use crate::store::MemoryBlockStore;
    use crate::error::RepoError;
    use crate::BlockStore;

    #[test]
    fn test_walker_is_lazy_and_restartable() {
        let store = MemoryBlockStore::new();
        let mst = Mst::new(&store);
        let pairs: Vec<_> = (0..80)
            .map(|i| (format!("app.post/{:04}", i), codec::cid_for_value(&i).unwrap().0))
            .collect();
        let root = mst.build(pairs.clone()).unwrap();

        let mut walker = mst.walk_from(&root, None).unwrap();
        let first: Vec<String> = walker.by_ref().take(10).map(|l| l.unwrap().key).collect();
        assert_eq!(first.last().unwrap(), "app.post/0009");

        // resume from the last key seen
        let resumed = mst.list(&root, 10, Some(first.last().unwrap()), None).unwrap();
        assert_eq!(resumed[0].key, "app.post/0010");
        assert_eq!(walker.next().unwrap().unwrap().key, "app.post/0010");
    }

    #[test]
    fn test_walker_reports_missing_block() {
        let store = MemoryBlockStore::new();
        let mst = Mst::new(&store);
        let pairs: Vec<_> = (0..60)
            .map(|i| (format!("app.post/{:04}", i), codec::cid_for_value(&i).unwrap().0))
            .collect();
        let root = mst.build(pairs).unwrap();

        // copy only the root node into a fresh store
        let partial = MemoryBlockStore::new();
        partial.put_keyed(root, store.get(&root).unwrap().unwrap()).unwrap();
        let partial_mst = Mst::new(&partial);
        if partial_mst.read_node(&root, None).unwrap().subtrees().next().is_none() {
            return;
        }
        let results: Vec<_> = partial_mst.walk_from(&root, None).unwrap().collect();
        assert!(matches!(results.last(), Some(Err(RepoError::BlockNotFound(_)))));
    }
}
