use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use cid::Cid;
use fs2::FileExt;
use tracing::debug;

use crate::error::RepoError;
use super::{head_mismatch, BlockStore, RepoStore};

/// Longest pause between attempts to take a held store lock
const MAX_LOCK_BACKOFF: Duration = Duration::from_millis(200);

/// Size and content counts of a block store
#[derive(Debug)]
pub struct StoreStats {
    pub path: String,
    /// Bytes sled occupies on disk, including its logs
    pub size_bytes: u64,
    pub block_count: usize,
    /// Sum of stored block lengths
    pub block_bytes: u64,
    pub account_count: usize,
}

/// Persistent block store backed by sled. Blocks live in the `blocks` tree
/// keyed by CID bytes; account heads live in the `heads` tree.
pub struct SledBlockStore {
    path: PathBuf,
    db: ::sled::Db,
    blocks: ::sled::Tree,
    heads: ::sled::Tree,
}

impl std::fmt::Debug for SledBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledBlockStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// A [`SledBlockStore`] owned by this process until dropped.
///
/// The lock file next to the store records the owner's process id so a
/// second writer can say who it is waiting on.
pub struct LockedStore {
    _lock: File,
    store: SledBlockStore,
}

impl std::fmt::Debug for LockedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedStore")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl std::ops::Deref for LockedStore {
    type Target = SledBlockStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

impl SledBlockStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path) -> Result<Self, RepoError> {
        let db = ::sled::open(path)?;
        let blocks = db.open_tree("blocks")?;
        let heads = db.open_tree("heads")?;
        debug!(path = %path.display(), blocks = blocks.len(), "opened block store");

        Ok(Self {
            path: path.to_path_buf(),
            db,
            blocks,
            heads,
        })
    }

    /// Open the store for exclusive use by this process.
    ///
    /// While another process holds `<path>.lock`, retries with backoff for up
    /// to `wait` (zero tries once) and then fails with `DbBusy`.
    pub fn open_locked(path: &Path, wait: Duration) -> Result<LockedStore, RepoError> {
        let lock_path = path.with_extension("lock");
        let mut lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let start = Instant::now();
        let mut delay = Duration::from_millis(10);
        while lock.try_lock_exclusive().is_err() {
            if start.elapsed() >= wait {
                return Err(RepoError::DbBusy(format!(
                    "block store {} is in use by {}",
                    path.display(),
                    lock_holder(&mut lock)
                )));
            }
            std::thread::sleep(delay);
            delay = (delay * 2).min(MAX_LOCK_BACKOFF);
        }

        lock.set_len(0)?;
        lock.rewind()?;
        write!(lock, "{}", std::process::id())?;
        lock.flush()?;
        debug!(path = %path.display(), waited_ms = start.elapsed().as_millis() as u64, "locked block store");

        Ok(LockedStore {
            _lock: lock,
            store: Self::open(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> Result<StoreStats, RepoError> {
        let mut block_bytes = 0u64;
        for value in self.blocks.iter().values() {
            block_bytes += value?.len() as u64;
        }
        Ok(StoreStats {
            path: self.path.to_string_lossy().to_string(),
            size_bytes: self.db.size_on_disk()?,
            block_count: self.blocks.len(),
            block_bytes,
            account_count: self.heads.len(),
        })
    }

    /// Iterate over every stored CID
    pub fn cids(&self) -> impl Iterator<Item = Result<Cid, RepoError>> + '_ {
        self.blocks.iter().keys().map(|key| {
            let key = key?;
            Cid::try_from(key.as_ref()).map_err(|e| RepoError::Internal(format!("bad CID key: {}", e)))
        })
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), RepoError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Who holds a store lock, as recorded in the lock file
fn lock_holder(lock: &mut File) -> String {
    let mut pid = String::new();
    match lock.rewind().and_then(|_| lock.read_to_string(&mut pid)) {
        Ok(_) if !pid.trim().is_empty() => format!("mstore process {}", pid.trim()),
        _ => "another mstore process".to_string(),
    }
}

impl BlockStore for SledBlockStore {
    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, RepoError> {
        Ok(self.blocks.get(cid.to_bytes())?.map(|v| v.to_vec()))
    }

    fn has(&self, cid: &Cid) -> Result<bool, RepoError> {
        Ok(self.blocks.contains_key(cid.to_bytes())?)
    }

    fn put_keyed(&self, cid: Cid, bytes: Vec<u8>) -> Result<(), RepoError> {
        self.blocks.insert(cid.to_bytes(), bytes)?;
        Ok(())
    }
}

impl RepoStore for SledBlockStore {
    fn head(&self, account_id: &str) -> Result<Option<Cid>, RepoError> {
        match self.heads.get(account_id.as_bytes())? {
            Some(bytes) => Ok(Some(parse_head(&bytes)?)),
            None => Ok(None),
        }
    }

    fn swap_head(
        &self,
        account_id: &str,
        expected: Option<&Cid>,
        new: &Cid,
    ) -> Result<(), RepoError> {
        let old = expected.map(|c| c.to_bytes());
        let result = self
            .heads
            .compare_and_swap(account_id.as_bytes(), old, Some(new.to_bytes()))?;
        match result {
            Ok(()) => {
                self.db.flush()?;
                Ok(())
            }
            Err(cas) => {
                let actual = cas.current.map(|bytes| parse_head(&bytes)).transpose()?;
                Err(head_mismatch(expected, actual))
            }
        }
    }

    fn accounts(&self) -> Result<Vec<String>, RepoError> {
        let mut accounts = Vec::new();
        for key in self.heads.iter().keys() {
            let key = key?;
            accounts.push(String::from_utf8_lossy(&key).to_string());
        }
        Ok(accounts)
    }
}

impl BlockStore for LockedStore {
    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, RepoError> {
        self.store.get(cid)
    }

    fn has(&self, cid: &Cid) -> Result<bool, RepoError> {
        self.store.has(cid)
    }

    fn put_keyed(&self, cid: Cid, bytes: Vec<u8>) -> Result<(), RepoError> {
        self.store.put_keyed(cid, bytes)
    }
}

impl RepoStore for LockedStore {
    fn head(&self, account_id: &str) -> Result<Option<Cid>, RepoError> {
        self.store.head(account_id)
    }

    fn swap_head(
        &self,
        account_id: &str,
        expected: Option<&Cid>,
        new: &Cid,
    ) -> Result<(), RepoError> {
        self.store.swap_head(account_id, expected, new)
    }

    fn accounts(&self) -> Result<Vec<String>, RepoError> {
        self.store.accounts()
    }
}

fn parse_head(bytes: &[u8]) -> Result<Cid, RepoError> {
    Cid::try_from(bytes).map_err(|e| RepoError::Internal(format!("bad head CID: {}", e)))
}
