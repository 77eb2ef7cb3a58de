//! Content-addressed block storage
//!
//! The core only depends on the [`BlockStore`] trait. [`RepoStore`] adds the
//! per-account head pointer with update-if-match semantics.

pub mod memory;
pub mod sled;
pub mod staged;

use std::collections::BTreeMap;
use std::sync::Arc;

use cid::Cid;
use serde::Serialize;

use crate::codec;
use crate::error::RepoError;

pub use self::memory::MemoryBlockStore;
pub use self::sled::{LockedStore, SledBlockStore, StoreStats};
pub use self::staged::StagedStore;

/// Content-addressed block storage.
///
/// `get` and `put` are the only suspension points of the core. They are
/// fallible and never retried.
pub trait BlockStore: Send + Sync {
    /// Fetch a block, `None` when absent
    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, RepoError>;

    fn has(&self, cid: &Cid) -> Result<bool, RepoError>;

    /// Store bytes under a precomputed CID
    fn put_keyed(&self, cid: Cid, bytes: Vec<u8>) -> Result<(), RepoError>;

    /// Store a DAG-CBOR block and return its CID
    fn put(&self, bytes: Vec<u8>) -> Result<Cid, RepoError> {
        let cid = codec::cid_for_cbor(&bytes)?;
        self.put_keyed(cid, bytes)?;
        Ok(cid)
    }

    fn put_many(&self, blocks: BlockMap) -> Result<(), RepoError> {
        for (cid, bytes) in blocks {
            self.put_keyed(cid, bytes)?;
        }
        Ok(())
    }

    /// Fetch a block that must exist
    fn get_required(&self, cid: &Cid) -> Result<Vec<u8>, RepoError> {
        self.get(cid)?.ok_or(RepoError::BlockNotFound(*cid))
    }
}

/// A block store that also tracks the head commit of each account
pub trait RepoStore: BlockStore {
    fn head(&self, account_id: &str) -> Result<Option<Cid>, RepoError>;

    /// Move the head to `new` only if it currently equals `expected`.
    ///
    /// Fails with `PreviousMismatch` when another writer got there first.
    fn swap_head(
        &self,
        account_id: &str,
        expected: Option<&Cid>,
        new: &Cid,
    ) -> Result<(), RepoError>;

    /// Accounts with a head, in ascending order
    fn accounts(&self) -> Result<Vec<String>, RepoError>;
}

impl<T: BlockStore + ?Sized> BlockStore for Arc<T> {
    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, RepoError> {
        (**self).get(cid)
    }

    fn has(&self, cid: &Cid) -> Result<bool, RepoError> {
        (**self).has(cid)
    }

    fn put_keyed(&self, cid: Cid, bytes: Vec<u8>) -> Result<(), RepoError> {
        (**self).put_keyed(cid, bytes)
    }
}

impl<T: RepoStore + ?Sized> RepoStore for Arc<T> {
    fn head(&self, account_id: &str) -> Result<Option<Cid>, RepoError> {
        (**self).head(account_id)
    }

    fn swap_head(
        &self,
        account_id: &str,
        expected: Option<&Cid>,
        new: &Cid,
    ) -> Result<(), RepoError> {
        (**self).swap_head(account_id, expected, new)
    }

    fn accounts(&self) -> Result<Vec<String>, RepoError> {
        (**self).accounts()
    }
}

pub(crate) fn head_mismatch(expected: Option<&Cid>, actual: Option<Cid>) -> RepoError {
    RepoError::PreviousMismatch {
        expected: expected.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()),
        actual: actual.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()),
    }
}

/// An ordered, in-memory set of blocks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMap {
    blocks: BTreeMap<Cid, Vec<u8>>,
}

impl BlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a value, store it, and return its CID
    pub fn add<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<Cid, RepoError> {
        let (cid, bytes) = codec::cid_for_value(value)?;
        self.blocks.insert(cid, bytes);
        Ok(cid)
    }

    pub fn set(&mut self, cid: Cid, bytes: Vec<u8>) {
        self.blocks.insert(cid, bytes);
    }

    pub fn get(&self, cid: &Cid) -> Option<&[u8]> {
        self.blocks.get(cid).map(|b| b.as_slice())
    }

    pub fn has(&self, cid: &Cid) -> bool {
        self.blocks.contains_key(cid)
    }

    pub fn remove(&mut self, cid: &Cid) -> Option<Vec<u8>> {
        self.blocks.remove(cid)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn cids(&self) -> Vec<Cid> {
        self.blocks.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Cid, &Vec<u8>)> {
        self.blocks.iter()
    }

    pub fn extend(&mut self, other: BlockMap) {
        self.blocks.extend(other.blocks);
    }

    /// Total payload size in bytes
    pub fn byte_size(&self) -> usize {
        self.blocks.values().map(|b| b.len()).sum()
    }
}

impl IntoIterator for BlockMap {
    type Item = (Cid, Vec<u8>);
    type IntoIter = std::collections::btree_map::IntoIter<Cid, Vec<u8>>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

impl FromIterator<(Cid, Vec<u8>)> for BlockMap {
    fn from_iter<I: IntoIterator<Item = (Cid, Vec<u8>)>>(iter: I) -> Self {
        Self {
            blocks: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_map_add_and_get() {
        let mut map = BlockMap::new();
        let cid = map.add("hello").unwrap();
        assert!(map.has(&cid));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&cid).unwrap(), codec::encode("hello").unwrap().as_slice());

        // same content, same CID
        assert_eq!(map.add("hello").unwrap(), cid);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_block_map_extend() {
        let mut a = BlockMap::new();
        let mut b = BlockMap::new();
        let one = a.add(&1u8).unwrap();
        let two = b.add(&2u8).unwrap();
        a.extend(b);
        assert_eq!(a.cids().len(), 2);
        assert!(a.has(&one) && a.has(&two));
        assert_eq!(a.byte_size(), 2);
    }
}
