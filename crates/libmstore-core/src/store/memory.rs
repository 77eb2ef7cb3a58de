use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use cid::Cid;

use crate::error::RepoError;
use super::{head_mismatch, BlockMap, BlockStore, RepoStore};

/// Thread-safe in-memory block store
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Cid, Vec<u8>>>,
    heads: RwLock<BTreeMap<String, Cid>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a read-mostly store from a set of blocks, e.g. a proof
    pub fn from_blocks(blocks: BlockMap) -> Self {
        Self {
            blocks: RwLock::new(blocks.into_iter().collect()),
            heads: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.read_blocks().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy every block out into a `BlockMap`
    pub fn snapshot(&self) -> Result<BlockMap, RepoError> {
        let blocks = self.read_blocks()?;
        Ok(blocks.iter().map(|(cid, bytes)| (*cid, bytes.clone())).collect())
    }

    /// Overwrite a block without any hash check, to simulate damage
    #[cfg(any(test, feature = "test-util"))]
    pub fn corrupt(&self, cid: &Cid, bytes: Vec<u8>) -> Result<(), RepoError> {
        self.write_blocks()?.insert(*cid, bytes);
        Ok(())
    }

    fn read_blocks(&self) -> Result<RwLockReadGuard<'_, HashMap<Cid, Vec<u8>>>, RepoError> {
        self.blocks
            .read()
            .map_err(|_| RepoError::Internal("block map lock poisoned".to_string()))
    }

    fn write_blocks(&self) -> Result<RwLockWriteGuard<'_, HashMap<Cid, Vec<u8>>>, RepoError> {
        self.blocks
            .write()
            .map_err(|_| RepoError::Internal("block map lock poisoned".to_string()))
    }
}

impl BlockStore for MemoryBlockStore {
    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, RepoError> {
        Ok(self.read_blocks()?.get(cid).cloned())
    }

    fn has(&self, cid: &Cid) -> Result<bool, RepoError> {
        Ok(self.read_blocks()?.contains_key(cid))
    }

    fn put_keyed(&self, cid: Cid, bytes: Vec<u8>) -> Result<(), RepoError> {
        self.write_blocks()?.entry(cid).or_insert(bytes);
        Ok(())
    }
}

impl RepoStore for MemoryBlockStore {
    fn head(&self, account_id: &str) -> Result<Option<Cid>, RepoError> {
        let heads = self
            .heads
            .read()
            .map_err(|_| RepoError::Internal("head map lock poisoned".to_string()))?;
        Ok(heads.get(account_id).copied())
    }

    fn swap_head(
        &self,
        account_id: &str,
        expected: Option<&Cid>,
        new: &Cid,
    ) -> Result<(), RepoError> {
        let mut heads = self
            .heads
            .write()
            .map_err(|_| RepoError::Internal("head map lock poisoned".to_string()))?;
        let current = heads.get(account_id).copied();
        if current.as_ref() != expected {
            return Err(head_mismatch(expected, current));
        }
        heads.insert(account_id.to_string(), *new);
        Ok(())
    }

    fn accounts(&self) -> Result<Vec<String>, RepoError> {
        let heads = self
            .heads
            .read()
            .map_err(|_| RepoError::Internal("head map lock poisoned".to_string()))?;
        Ok(heads.keys().cloned().collect())
    }
}
