use std::collections::HashSet;
use std::sync::RwLock;

use cid::Cid;
use tracing::debug;

use crate::codec;
use crate::error::RepoError;
use super::{BlockMap, BlockStore};

/// Write-back overlay over another block store.
///
/// Writes land in memory; reads fall through to the inner store. `flush`
/// persists only the staged blocks reachable from the given roots, so the
/// intermediate nodes produced while mutating a tree are never written.
pub struct StagedStore<'a, S: BlockStore + ?Sized> {
    inner: &'a S,
    staged: RwLock<BlockMap>,
}

impl<'a, S: BlockStore + ?Sized> StagedStore<'a, S> {
    pub fn new(inner: &'a S) -> Self {
        Self {
            inner,
            staged: RwLock::new(BlockMap::new()),
        }
    }

    pub fn staged_len(&self) -> usize {
        self.staged.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Persist staged blocks reachable from `roots` that the inner store lacks.
    ///
    /// Returns the blocks that were written.
    pub fn flush(&self, roots: &[Cid]) -> Result<BlockMap, RepoError> {
        let staged = self
            .staged
            .read()
            .map_err(|_| RepoError::Internal("staged map lock poisoned".to_string()))?;

        let mut written = BlockMap::new();
        let mut seen = HashSet::new();
        let mut queue: Vec<Cid> = roots.to_vec();

        while let Some(cid) = queue.pop() {
            if !seen.insert(cid) {
                continue;
            }
            // unstaged blocks are already persisted along with their children
            let Some(bytes) = staged.get(&cid) else {
                continue;
            };
            if self.inner.has(&cid)? {
                continue;
            }
            queue.extend(codec::block_links(&cid, bytes)?);
            written.set(cid, bytes.to_vec());
        }

        debug!(
            staged = staged.len(),
            written = written.len(),
            "flushing staged blocks"
        );
        self.inner.put_many(written.clone())?;
        Ok(written)
    }
}

impl<'a, S: BlockStore + ?Sized> BlockStore for StagedStore<'a, S> {
    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, RepoError> {
        {
            let staged = self
                .staged
                .read()
                .map_err(|_| RepoError::Internal("staged map lock poisoned".to_string()))?;
            if let Some(bytes) = staged.get(cid) {
                return Ok(Some(bytes.to_vec()));
            }
        }
        self.inner.get(cid)
    }

    fn has(&self, cid: &Cid) -> Result<bool, RepoError> {
        let in_stage = self
            .staged
            .read()
            .map_err(|_| RepoError::Internal("staged map lock poisoned".to_string()))?
            .has(cid);
        Ok(in_stage || self.inner.has(cid)?)
    }

    fn put_keyed(&self, cid: Cid, bytes: Vec<u8>) -> Result<(), RepoError> {
        self.staged
            .write()
            .map_err(|_| RepoError::Internal("staged map lock poisoned".to_string()))?
            .set(cid, bytes);
        Ok(())
    }
}
