//! Per-account repository: a chain of signed commits over tree roots
//!
//! Writes are staged in memory, turned into a new tree root and a signed
//! commit, flushed to the store, and published by moving the account head
//! with update-if-match. A writer that lost the race gets `PreviousMismatch`
//! and must reload before retrying.

use std::collections::HashSet;
use std::io::Write;

use cid::Cid;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::car::{self, CarWriter};
use crate::codec;
use crate::commit::{create_commit, verify_commit_with, Commit};
use crate::error::RepoError;
use crate::mst::diff::Changeset;
use crate::mst::{Fanout, Leaf, Mst};
use crate::signing::{DefaultVerifier, PublicKey, Signer, VerificationPolicy, Verifier};
use crate::store::{BlockMap, BlockStore, RepoStore, StagedStore};
use crate::types::key::RecordKey;
use crate::types::tid::Tid;

/// One write in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordWrite {
    Create { key: RecordKey, value: Vec<u8> },
    Update { key: RecordKey, value: Vec<u8> },
    Delete { key: RecordKey },
}

impl RecordWrite {
    pub fn create(key: &str, value: Vec<u8>) -> Result<Self, RepoError> {
        Ok(RecordWrite::Create {
            key: RecordKey::parse(key)?,
            value,
        })
    }

    pub fn update(key: &str, value: Vec<u8>) -> Result<Self, RepoError> {
        Ok(RecordWrite::Update {
            key: RecordKey::parse(key)?,
            value,
        })
    }

    pub fn delete(key: &str) -> Result<Self, RepoError> {
        Ok(RecordWrite::Delete {
            key: RecordKey::parse(key)?,
        })
    }

    pub fn key(&self) -> &RecordKey {
        match self {
            RecordWrite::Create { key, .. }
            | RecordWrite::Update { key, .. }
            | RecordWrite::Delete { key } => key,
        }
    }
}

/// Everything produced by one successful batch of writes
#[derive(Debug, Clone)]
pub struct CommitData {
    pub cid: Cid,
    pub commit: Commit,
    /// Head the commit was built on
    pub previous: Option<Cid>,
    pub changeset: Changeset,
    /// Blocks written to the store for this commit, including the commit itself
    pub blocks: BlockMap,
}

/// A commit with its changeset against its predecessor and the blocks it added
pub(crate) struct CommitDiff {
    pub cid: Cid,
    pub commit: Commit,
    pub changeset: Changeset,
    pub blocks: BlockMap,
}

/// A repository pinned to one commit
pub struct Repository<'a, S: RepoStore + ?Sized> {
    store: &'a S,
    fanout: Fanout,
    commit_cid: Cid,
    commit: Commit,
}

impl<'a, S: RepoStore + ?Sized> Repository<'a, S> {
    /// Start a new repository: empty tree, first commit, head set from nothing
    pub fn create(store: &'a S, account_id: &str, signer: &dyn Signer) -> Result<Self, RepoError> {
        let staged = StagedStore::new(store);
        let root = Mst::new(&staged).create_empty()?;
        let commit = create_commit(account_id, root, None, signer)?;
        let commit_cid = staged.put(commit.to_bytes()?)?;
        staged.flush(&[commit_cid])?;
        store.swap_head(account_id, None, &commit_cid)?;

        info!(account = %account_id, commit = %commit_cid, "created repository");
        Ok(Self {
            store,
            fanout: Fanout::default(),
            commit_cid,
            commit,
        })
    }

    /// Open the repository at the account's current head
    pub fn load(store: &'a S, account_id: &str) -> Result<Self, RepoError> {
        let head = store
            .head(account_id)?
            .ok_or_else(|| RepoError::RepoNotFound(account_id.to_string()))?;
        let repo = Self::load_commit(store, &head)?;
        if repo.commit.account_id != account_id {
            return Err(RepoError::AccountMismatch {
                expected: account_id.to_string(),
                actual: repo.commit.account_id,
            });
        }
        Ok(repo)
    }

    /// Open the repository as of a specific commit
    pub fn load_commit(store: &'a S, commit_cid: &Cid) -> Result<Self, RepoError> {
        let commit = Commit::from_bytes(&store.get_required(commit_cid)?)?;
        Ok(Self {
            store,
            fanout: Fanout::default(),
            commit_cid: *commit_cid,
            commit,
        })
    }

    pub fn with_fanout(mut self, fanout: Fanout) -> Self {
        self.fanout = fanout;
        self
    }

    /// Move to the account's current head
    pub fn refresh(&mut self) -> Result<(), RepoError> {
        let fresh = Self::load(self.store, &self.commit.account_id)?;
        self.commit_cid = fresh.commit_cid;
        self.commit = fresh.commit;
        Ok(())
    }

    pub fn store(&self) -> &'a S {
        self.store
    }

    pub fn fanout(&self) -> Fanout {
        self.fanout
    }

    pub fn account_id(&self) -> &str {
        &self.commit.account_id
    }

    pub fn head(&self) -> &Commit {
        &self.commit
    }

    pub fn head_cid(&self) -> Cid {
        self.commit_cid
    }

    pub fn data_root(&self) -> Cid {
        self.commit.data
    }

    pub fn mst(&self) -> Mst<'a, S> {
        Mst::with_fanout(self.store, self.fanout)
    }

    pub fn get_record_cid(&self, key: &str) -> Result<Option<Cid>, RepoError> {
        self.mst().get(&self.commit.data, key)
    }

    /// Record payload, `None` when the key is absent
    pub fn get_record(&self, key: &str) -> Result<Option<Vec<u8>>, RepoError> {
        match self.get_record_cid(key)? {
            Some(cid) => Ok(Some(self.store.get_required(&cid)?)),
            None => Ok(None),
        }
    }

    /// Every record of one collection, in key order
    pub fn list_records(&self, collection: &str) -> Result<Vec<Leaf>, RepoError> {
        self.mst()
            .list_prefix(&self.commit.data, &format!("{}/", collection), None)
    }

    /// One page of records across all collections, after an exclusive cursor
    pub fn list(&self, limit: usize, after: Option<&str>) -> Result<Vec<Leaf>, RepoError> {
        self.mst().list(&self.commit.data, limit, after, None)
    }

    /// Apply a batch of writes as a single signed commit
    pub fn apply_writes(
        &mut self,
        writes: &[RecordWrite],
        signer: &dyn Signer,
    ) -> Result<CommitData, RepoError> {
        if writes.is_empty() {
            return Err(RepoError::InvalidArgs("empty write batch".to_string()));
        }

        let staged = StagedStore::new(self.store);
        let mst = Mst::with_fanout(&staged, self.fanout);
        let mut root = self.commit.data;

        for write in writes {
            let key = write.key().as_str();
            root = match write {
                RecordWrite::Create { value, .. } => {
                    if mst.get(&root, key)?.is_some() {
                        return Err(RepoError::RecordExists(key.to_string()));
                    }
                    let cid = codec::cid_for_record(value)?;
                    staged.put_keyed(cid, value.clone())?;
                    mst.insert(&root, key, &cid)?
                }
                RecordWrite::Update { value, .. } => {
                    let cid = codec::cid_for_record(value)?;
                    staged.put_keyed(cid, value.clone())?;
                    mst.update(&root, key, &cid)?
                        .ok_or_else(|| RepoError::RecordNotFound(key.to_string()))?
                }
                RecordWrite::Delete { .. } => mst
                    .delete(&root, key)?
                    .ok_or_else(|| RepoError::RecordNotFound(key.to_string()))?,
            };
        }

        let changeset = mst.diff(Some(&self.commit.data), &root)?;
        let data = self.publish(&staged, root, changeset, signer)?;
        info!(
            account = %data.commit.account_id,
            commit = %data.cid,
            rev = %data.commit.revision,
            writes = writes.len(),
            changes = data.changeset.len(),
            "applied writes"
        );
        Ok(data)
    }

    /// Put the records back the way they stood `count` commits before the
    /// pinned head.
    ///
    /// The rollback is itself a new signed commit over the older tree, so the
    /// revision keeps moving forward and replicas see an ordinary change.
    pub fn revert(&mut self, count: usize, signer: &dyn Signer) -> Result<CommitData, RepoError> {
        if count == 0 {
            return Err(RepoError::InvalidArgs("revert count must be at least 1".to_string()));
        }
        let history = self.history(Some(count + 1))?;
        let Some((target_cid, target)) = history.get(count) else {
            return Err(RepoError::InvalidArgs(format!(
                "cannot revert {} commit(s): only {} earlier commit(s) held locally",
                count,
                history.len().saturating_sub(1)
            )));
        };
        let (target_cid, root) = (*target_cid, target.data);

        let staged = StagedStore::new(self.store);
        let changeset = Mst::with_fanout(&staged, self.fanout).diff(Some(&self.commit.data), &root)?;
        let data = self.publish(&staged, root, changeset, signer)?;
        info!(
            account = %data.commit.account_id,
            commit = %data.cid,
            rev = %data.commit.revision,
            restored = %target_cid,
            changes = data.changeset.len(),
            "reverted commits"
        );
        Ok(data)
    }

    /// Sign a commit over `root`, flush it with its staged blocks and move the head
    fn publish(
        &mut self,
        staged: &StagedStore<'_, S>,
        root: Cid,
        changeset: Changeset,
        signer: &dyn Signer,
    ) -> Result<CommitData, RepoError> {
        let commit = create_commit(&self.commit.account_id, root, Some(&self.commit), signer)?;
        let commit_cid = staged.put(commit.to_bytes()?)?;
        debug!(staged = staged.staged_len(), "staged commit blocks");
        let blocks = staged.flush(&[commit_cid])?;

        self.store
            .swap_head(&commit.account_id, Some(&self.commit_cid), &commit_cid)?;

        let previous = Some(self.commit_cid);
        self.commit_cid = commit_cid;
        self.commit = commit.clone();
        Ok(CommitData {
            cid: commit_cid,
            commit,
            previous,
            changeset,
            blocks,
        })
    }

    /// Commits from the pinned head backwards, newest first
    pub fn history(&self, limit: Option<usize>) -> Result<Vec<(Cid, Commit)>, RepoError> {
        let mut out = Vec::new();
        let mut next = Some((self.commit_cid, self.commit.clone()));
        while let Some((cid, commit)) = next {
            if limit.is_some_and(|l| out.len() >= l) {
                break;
            }
            next = load_previous(self.store, &commit)?;
            out.push((cid, commit));
        }
        Ok(out)
    }

    /// Commits with a revision after `since`, oldest first.
    ///
    /// `since` must be the revision of a commit in the local history;
    /// anything else fails with `NoSharedHistory`.
    pub fn commits_since(&self, since: Option<&Tid>) -> Result<Vec<(Cid, Commit)>, RepoError> {
        let mut out = Vec::new();
        let mut next = Some((self.commit_cid, self.commit.clone()));
        let mut found = since.is_none();
        while let Some((cid, commit)) = next {
            if let Some(since) = since {
                let rev = commit.revision()?;
                if rev <= *since {
                    found = rev == *since;
                    break;
                }
            }
            next = load_previous(self.store, &commit)?;
            out.push((cid, commit));
        }
        if let (Some(since), false) = (since, found) {
            return Err(RepoError::NoSharedHistory(format!(
                "revision {} is not in the local history of {}",
                since, self.commit.account_id
            )));
        }
        out.reverse();
        Ok(out)
    }

    /// Checkout archive: the pinned commit, its whole tree and every record
    pub fn export_car<W: Write>(&self, out: W, cancel: &CancelToken) -> Result<usize, RepoError> {
        let mut writer = CarWriter::new(out, &[self.commit_cid])?;
        writer.write_block(&self.commit_cid, &self.store.get_required(&self.commit_cid)?)?;
        let mut seen = HashSet::from([self.commit_cid]);
        car::write_reachable(self.store, &[self.commit.data], &mut writer, &mut seen, cancel)?;
        let count = writer.blocks_written();
        writer.finish()?;
        Ok(count)
    }

    /// Commits after `since` together with the blocks each one introduced
    pub fn export_diff_car<W: Write>(
        &self,
        since: Option<&Tid>,
        out: W,
        cancel: &CancelToken,
    ) -> Result<usize, RepoError> {
        let mut writer = CarWriter::new(out, &[self.commit_cid])?;
        let mut seen = HashSet::new();
        for (cid, blocks) in self.commit_blocks_since(since, cancel)? {
            debug!(commit = %cid, blocks = blocks.len(), "exporting commit diff");
            for (block_cid, bytes) in blocks {
                if seen.insert(block_cid) {
                    writer.write_block(&block_cid, &bytes)?;
                }
            }
        }
        let count = writer.blocks_written();
        writer.finish()?;
        Ok(count)
    }

    /// For each commit after `since`: its CID, and the commit block plus every
    /// block its changeset added
    pub fn commit_blocks_since(
        &self,
        since: Option<&Tid>,
        cancel: &CancelToken,
    ) -> Result<Vec<(Cid, BlockMap)>, RepoError> {
        Ok(self
            .changesets_since(since, cancel)?
            .into_iter()
            .map(|diff| (diff.cid, diff.blocks))
            .collect())
    }

    pub(crate) fn changesets_since(
        &self,
        since: Option<&Tid>,
        cancel: &CancelToken,
    ) -> Result<Vec<CommitDiff>, RepoError> {
        let mst = self.mst();
        let mut out = Vec::new();
        for (cid, commit) in self.commits_since(since)? {
            cancel.check()?;
            let prev_data = load_previous(self.store, &commit)?.map(|(_, prev)| prev.data);
            let changeset = mst.diff_with_cancel(prev_data.as_ref(), &commit.data, cancel)?;

            let mut blocks = BlockMap::new();
            blocks.set(cid, self.store.get_required(&cid)?);
            if prev_data.is_none() {
                // the first local commit also carries its (possibly empty) root
                blocks.set(commit.data, self.store.get_required(&commit.data)?);
            }
            for block in &changeset.new_blocks {
                blocks.set(*block, self.store.get_required(block)?);
            }
            out.push(CommitDiff {
                cid,
                commit,
                changeset,
                blocks,
            });
        }
        Ok(out)
    }

    /// Restore a repository from a checkout archive.
    ///
    /// The archive must have exactly one root, a commit whose tree is
    /// complete and well formed. The head only moves forward: an archive
    /// older than the current head fails with `RevisionNotMonotonic`.
    ///
    /// Only the head commit travels in the archive, so the imported commit
    /// becomes the start of local history.
    pub fn import(
        store: &'a S,
        bytes: &[u8],
        fanout: Fanout,
        policy: VerificationPolicy,
        key: Option<&PublicKey>,
    ) -> Result<Self, RepoError> {
        Self::import_with_verifier(store, bytes, fanout, policy, key, &DefaultVerifier)
    }

    /// [`Repository::import`] with a caller-supplied signature verifier
    pub fn import_with_verifier(
        store: &'a S,
        bytes: &[u8],
        fanout: Fanout,
        policy: VerificationPolicy,
        key: Option<&PublicKey>,
        verifier: &dyn Verifier,
    ) -> Result<Self, RepoError> {
        let (roots, blocks) = car::read_car(bytes)?;
        let commit_cid = match roots.as_slice() {
            [root] => *root,
            other => {
                return Err(RepoError::InvalidCar(format!(
                    "expected one root, found {}",
                    other.len()
                )))
            }
        };
        let commit = Commit::from_bytes(
            blocks
                .get(&commit_cid)
                .ok_or(RepoError::BlockNotFound(commit_cid))?,
        )?;

        check_import_signature(&commit, policy, key, verifier)?;
        car::check_complete(store, &blocks, &[commit.data])?;

        let staged = StagedStore::new(store);
        for (cid, block) in blocks {
            staged.put_keyed(cid, block)?;
        }
        let records = Mst::with_fanout(&staged, fanout).leaf_count(&commit.data)?;

        let current = store.head(&commit.account_id)?;
        if current == Some(commit_cid) {
            debug!(commit = %commit_cid, "import matches current head");
        } else {
            if let Some(current) = current {
                let existing = Commit::from_bytes(&store.get_required(&current)?)?;
                if commit.revision()? <= existing.revision()? {
                    return Err(RepoError::RevisionNotMonotonic {
                        prior: existing.revision,
                        next: commit.revision,
                    });
                }
            }
            staged.flush(&[commit_cid])?;
            store.swap_head(&commit.account_id, current.as_ref(), &commit_cid)?;
        }

        info!(
            account = %commit.account_id,
            commit = %commit_cid,
            records,
            "imported repository"
        );
        Ok(Self {
            store,
            fanout,
            commit_cid,
            commit,
        })
    }
}

/// The commit `commit` links back to, `None` at the start of local history.
///
/// A checkout import holds its head commit without the commits before it,
/// so a `previous` link whose block is absent marks where local history begins.
pub(crate) fn load_previous<S: BlockStore + ?Sized>(
    store: &S,
    commit: &Commit,
) -> Result<Option<(Cid, Commit)>, RepoError> {
    let Some(prev) = commit.previous else {
        return Ok(None);
    };
    match store.get(&prev)? {
        Some(bytes) => Ok(Some((prev, Commit::from_bytes(&bytes)?))),
        None => {
            debug!(rev = %commit.revision, previous = %prev, "local history starts here");
            Ok(None)
        }
    }
}

fn check_import_signature(
    commit: &Commit,
    policy: VerificationPolicy,
    key: Option<&PublicKey>,
    verifier: &dyn Verifier,
) -> Result<(), RepoError> {
    let result = match key {
        Some(key) => verify_commit_with(commit, key, verifier),
        None => Err(RepoError::SignatureInvalid(
            "no public key configured for verification".to_string(),
        )),
    };
    match (policy, result) {
        (VerificationPolicy::Off, _) | (_, Ok(())) => Ok(()),
        (VerificationPolicy::Warn, Err(e)) => {
            warn!(rev = %commit.revision, error = %e, "importing commit with unverified signature");
            Ok(())
        }
        (VerificationPolicy::Require, Err(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mst::diff::ChangeOp;
    use crate::commit::verify_commit;
    use crate::signing::{Ed25519Signer, SigningError};
    use crate::store::MemoryBlockStore;

    const ALICE: &str = "did:example:alice";

    fn record(text: &str) -> Vec<u8> {
        codec::json_to_record(&serde_json::json!({ "text": text })).unwrap()
    }

    #[test]
    fn test_create_and_load() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        let repo = Repository::create(&store, ALICE, &signer).unwrap();
        assert_eq!(store.head(ALICE).unwrap(), Some(repo.head_cid()));
        assert_eq!(repo.mst().leaf_count(&repo.data_root()).unwrap(), 0);
        verify_commit(repo.head(), &signer.public_key()).unwrap();

        let loaded = Repository::load(&store, ALICE).unwrap();
        assert_eq!(loaded.head_cid(), repo.head_cid());

        assert!(matches!(
            Repository::load(&store, "did:example:nobody"),
            Err(RepoError::RepoNotFound(_))
        ));
        // a second create loses the head race
        assert!(matches!(
            Repository::create(&store, ALICE, &signer),
            Err(RepoError::PreviousMismatch { .. })
        ));
    }

    #[test]
    fn test_apply_writes() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        let mut repo = Repository::create(&store, ALICE, &signer).unwrap();
        let first = repo.head_cid();

        let data = repo
            .apply_writes(
                &[
                    RecordWrite::create("app.post/3jzfcijpj2z2a", record("one")).unwrap(),
                    RecordWrite::create("app.post/3jzfcijpj2z2b", record("two")).unwrap(),
                    RecordWrite::create("app.like/3jzfcijpj2z2c", record("like")).unwrap(),
                ],
                &signer,
            )
            .unwrap();

        assert_eq!(data.previous, Some(first));
        assert_eq!(data.commit.previous, Some(first));
        assert_eq!(data.changeset.len(), 3);
        assert!(data.changeset.changes.iter().all(|c| c.op == ChangeOp::Create));
        assert!(data.blocks.has(&data.cid));
        assert_eq!(store.head(ALICE).unwrap(), Some(data.cid));

        assert_eq!(repo.get_record("app.post/3jzfcijpj2z2a").unwrap(), Some(record("one")));
        assert_eq!(repo.get_record("app.post/missing").unwrap(), None);
        assert_eq!(repo.list_records("app.post").unwrap().len(), 2);
        assert_eq!(repo.list(10, None).unwrap().len(), 3);
    }

    #[test]
    fn test_write_conflicts() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        let mut repo = Repository::create(&store, ALICE, &signer).unwrap();
        repo.apply_writes(&[RecordWrite::create("app.post/a", record("a")).unwrap()], &signer)
            .unwrap();
        let head = repo.head_cid();

        assert!(matches!(
            repo.apply_writes(&[RecordWrite::create("app.post/a", record("b")).unwrap()], &signer),
            Err(RepoError::RecordExists(_))
        ));
        assert!(matches!(
            repo.apply_writes(&[RecordWrite::update("app.post/b", record("b")).unwrap()], &signer),
            Err(RepoError::RecordNotFound(_))
        ));
        assert!(matches!(
            repo.apply_writes(&[RecordWrite::delete("app.post/b").unwrap()], &signer),
            Err(RepoError::RecordNotFound(_))
        ));
        assert!(matches!(repo.apply_writes(&[], &signer), Err(RepoError::InvalidArgs(_))));
        // failed batches leave the head alone
        assert_eq!(store.head(ALICE).unwrap(), Some(head));
        assert!(RecordWrite::create("no-slash", record("x")).is_err());
    }

    #[test]
    fn test_stale_writer_is_rejected() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        Repository::create(&store, ALICE, &signer).unwrap();

        let mut first = Repository::load(&store, ALICE).unwrap();
        let mut second = Repository::load(&store, ALICE).unwrap();
        first
            .apply_writes(&[RecordWrite::create("app.post/a", record("a")).unwrap()], &signer)
            .unwrap();

        let err = second
            .apply_writes(&[RecordWrite::create("app.post/b", record("b")).unwrap()], &signer)
            .unwrap_err();
        assert!(matches!(err, RepoError::PreviousMismatch { .. }));
        assert!(err.is_retryable());

        second.refresh().unwrap();
        second
            .apply_writes(&[RecordWrite::create("app.post/b", record("b")).unwrap()], &signer)
            .unwrap();
        assert_eq!(Repository::load(&store, ALICE).unwrap().list(10, None).unwrap().len(), 2);
    }

    #[test]
    fn test_history_and_commits_since() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        let mut repo = Repository::create(&store, ALICE, &signer).unwrap();
        let mut revs = vec![repo.head().revision()];
        for i in 0..4 {
            let key = format!("app.post/{}", i);
            repo.apply_writes(&[RecordWrite::create(&key, record("x")).unwrap()], &signer)
                .unwrap();
            revs.push(repo.head().revision());
        }
        let revs: Vec<Tid> = revs.into_iter().map(|r| r.unwrap()).collect();

        let history = repo.history(None).unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].0, repo.head_cid());
        assert_eq!(repo.history(Some(2)).unwrap().len(), 2);

        let since = repo.commits_since(Some(&revs[2])).unwrap();
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].1.revision, revs[3].to_string());
        assert_eq!(repo.commits_since(None).unwrap().len(), 5);
    }

    #[test]
    fn test_update_and_delete_changesets() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        let mut repo = Repository::create(&store, ALICE, &signer).unwrap();
        repo.apply_writes(
            &[
                RecordWrite::create("app.post/a", record("a")).unwrap(),
                RecordWrite::create("app.post/b", record("b")).unwrap(),
            ],
            &signer,
        )
        .unwrap();

        let data = repo
            .apply_writes(
                &[
                    RecordWrite::update("app.post/a", record("a2")).unwrap(),
                    RecordWrite::delete("app.post/b").unwrap(),
                ],
                &signer,
            )
            .unwrap();
        let ops: Vec<(ChangeOp, &str)> =
            data.changeset.changes.iter().map(|c| (c.op, c.key.as_str())).collect();
        assert_eq!(ops, vec![(ChangeOp::Update, "app.post/a"), (ChangeOp::Delete, "app.post/b")]);
        assert_eq!(repo.get_record("app.post/a").unwrap(), Some(record("a2")));
    }

    #[test]
    fn test_checkout_export_import() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        let mut repo = Repository::create(&store, ALICE, &signer).unwrap();
        for i in 0..3 {
            let writes: Vec<RecordWrite> = (0..10)
                .map(|j| RecordWrite::create(&format!("app.post/{}-{}", i, j), record("x")).unwrap())
                .collect();
            repo.apply_writes(&writes, &signer).unwrap();
        }

        let mut bytes = Vec::new();
        repo.export_car(&mut bytes, &CancelToken::new()).unwrap();

        let target = MemoryBlockStore::new();
        let imported = Repository::import(
            &target,
            &bytes,
            Fanout::default(),
            VerificationPolicy::Require,
            Some(&signer.public_key()),
        )
        .unwrap();
        assert_eq!(imported.head_cid(), repo.head_cid());
        assert_eq!(imported.data_root(), repo.data_root());
        assert_eq!(imported.list(100, None).unwrap(), repo.list(100, None).unwrap());
        assert_eq!(target.head(ALICE).unwrap(), Some(repo.head_cid()));
    }

    #[test]
    fn test_import_signature_policy() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        let repo = Repository::create(&store, ALICE, &signer).unwrap();
        let mut bytes = Vec::new();
        repo.export_car(&mut bytes, &CancelToken::new()).unwrap();
        let stranger = Ed25519Signer::generate().public_key();

        let target = MemoryBlockStore::new();
        assert!(matches!(
            Repository::import(&target, &bytes, Fanout::default(), VerificationPolicy::Require, Some(&stranger)),
            Err(RepoError::SignatureInvalid(_))
        ));
        assert_eq!(target.head(ALICE).unwrap(), None);
        Repository::import(&target, &bytes, Fanout::default(), VerificationPolicy::Warn, None).unwrap();
        assert_eq!(target.head(ALICE).unwrap(), Some(repo.head_cid()));
    }

    #[test]
    fn test_import_never_moves_head_backwards() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        let mut repo = Repository::create(&store, ALICE, &signer).unwrap();
        let mut old = Vec::new();
        repo.export_car(&mut old, &CancelToken::new()).unwrap();
        repo.apply_writes(&[RecordWrite::create("app.post/a", record("a")).unwrap()], &signer)
            .unwrap();

        assert!(matches!(
            Repository::import(&store, &old, Fanout::default(), VerificationPolicy::Off, None),
            Err(RepoError::RevisionNotMonotonic { .. })
        ));
    }

    #[test]
    fn test_diff_export_carries_new_blocks() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        let mut repo = Repository::create(&store, ALICE, &signer).unwrap();
        repo.apply_writes(&[RecordWrite::create("app.post/a", record("a")).unwrap()], &signer)
            .unwrap();
        let since = repo.head().revision().unwrap();
        let data = repo
            .apply_writes(&[RecordWrite::create("app.post/b", record("b")).unwrap()], &signer)
            .unwrap();

        let mut bytes = Vec::new();
        repo.export_diff_car(Some(&since), &mut bytes, &CancelToken::new()).unwrap();
        let (roots, blocks) = car::read_car(&bytes).unwrap();
        assert_eq!(roots, vec![data.cid]);
        assert!(blocks.has(&data.cid));
        assert!(blocks.has(&data.commit.data));
        assert!(data.changeset.new_blocks.iter().all(|cid| blocks.has(cid)));
    }

    #[test]
    fn test_unknown_since_has_no_shared_history() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        let mut repo = Repository::create(&store, ALICE, &signer).unwrap();
        repo.apply_writes(&[RecordWrite::create("app.post/a", record("a")).unwrap()], &signer)
            .unwrap();

        // a revision from some other history
        let foreign = Tid::next(Some(&repo.head().revision().unwrap()));
        assert!(matches!(
            repo.commits_since(Some(&foreign)),
            Err(RepoError::NoSharedHistory(_))
        ));
        let before_genesis = Tid::parse("2222222222222").unwrap();
        assert!(matches!(
            repo.commits_since(Some(&before_genesis)),
            Err(RepoError::NoSharedHistory(_))
        ));
        let mut out = Vec::new();
        assert!(matches!(
            repo.export_diff_car(Some(&foreign), &mut out, &CancelToken::new()),
            Err(RepoError::NoSharedHistory(_))
        ));
    }

    #[test]
    fn test_imported_checkout_starts_local_history() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        let mut repo = Repository::create(&store, ALICE, &signer).unwrap();
        for i in 0..3 {
            let key = format!("app.post/{}", i);
            repo.apply_writes(&[RecordWrite::create(&key, record(&key)).unwrap()], &signer)
                .unwrap();
        }
        let mut bytes = Vec::new();
        repo.export_car(&mut bytes, &CancelToken::new()).unwrap();

        let target = MemoryBlockStore::new();
        let mut imported = Repository::import(
            &target,
            &bytes,
            Fanout::default(),
            VerificationPolicy::Require,
            Some(&signer.public_key()),
        )
        .unwrap();
        assert!(imported.head().previous.is_some());

        let history = imported.history(None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].0, repo.head_cid());

        let all = imported.commits_since(None).unwrap();
        assert_eq!(all.len(), 1);
        let boundary = imported.head().revision().unwrap();
        assert!(imported.commits_since(Some(&boundary)).unwrap().is_empty());

        // the boundary commit diffs against nothing
        let diffs = imported.changesets_since(None, &CancelToken::new()).unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].changeset.len(), 3);
        assert!(diffs[0].blocks.has(&imported.data_root()));

        // new writes chain onto the imported head
        imported
            .apply_writes(&[RecordWrite::create("app.post/9", record("nine")).unwrap()], &signer)
            .unwrap();
        let since = imported.commits_since(Some(&boundary)).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(imported.history(None).unwrap().len(), 2);
        assert!(matches!(imported.revert(2, &signer), Err(RepoError::InvalidArgs(_))));
    }

    #[test]
    fn test_revert_restores_earlier_tree() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        let mut repo = Repository::create(&store, ALICE, &signer).unwrap();
        repo.apply_writes(&[RecordWrite::create("app.post/a", record("a")).unwrap()], &signer)
            .unwrap();
        let kept_root = repo.data_root();
        repo.apply_writes(&[RecordWrite::update("app.post/a", record("a2")).unwrap()], &signer)
            .unwrap();
        repo.apply_writes(&[RecordWrite::create("app.post/b", record("b")).unwrap()], &signer)
            .unwrap();
        let before = repo.head().clone();

        let data = repo.revert(2, &signer).unwrap();
        assert_eq!(repo.data_root(), kept_root);
        assert_eq!(data.commit.previous, Some(before.cid().unwrap()));
        assert!(data.commit.revision().unwrap() > before.revision().unwrap());
        assert_eq!(store.head(ALICE).unwrap(), Some(data.cid));
        assert_eq!(repo.get_record("app.post/a").unwrap(), Some(record("a")));
        assert_eq!(repo.get_record("app.post/b").unwrap(), None);

        let ops: Vec<(ChangeOp, &str)> =
            data.changeset.changes.iter().map(|c| (c.op, c.key.as_str())).collect();
        assert_eq!(ops, vec![(ChangeOp::Update, "app.post/a"), (ChangeOp::Delete, "app.post/b")]);
        assert_eq!(repo.history(None).unwrap().len(), 5);

        assert!(matches!(repo.revert(0, &signer), Err(RepoError::InvalidArgs(_))));
        assert!(matches!(repo.revert(5, &signer), Err(RepoError::InvalidArgs(_))));
    }

    #[test]
    fn test_import_uses_supplied_verifier() {
        struct RejectAll;
        impl Verifier for RejectAll {
            fn verify(&self, _: &[u8], _: &[u8], _: &PublicKey) -> Result<(), SigningError> {
                Err(SigningError::InvalidSignature)
            }
        }

        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        let repo = Repository::create(&store, ALICE, &signer).unwrap();
        let mut bytes = Vec::new();
        repo.export_car(&mut bytes, &CancelToken::new()).unwrap();

        let target = MemoryBlockStore::new();
        let key = signer.public_key();
        assert!(matches!(
            Repository::import_with_verifier(
                &target,
                &bytes,
                Fanout::default(),
                VerificationPolicy::Require,
                Some(&key),
                &RejectAll,
            ),
            Err(RepoError::SignatureInvalid(_))
        ));
        assert_eq!(target.head(ALICE).unwrap(), None);
    }

    #[test]
    fn test_import_rejects_subtree_outside_parent_range() {
        use crate::mst::{Node, NodeEntry};

        let signer = Ed25519Signer::generate();
        let mut blocks = BlockMap::new();
        let mut leaf = |key: &str| {
            let bytes = record(key);
            let value = codec::cid_for_record(&bytes).unwrap();
            blocks.set(value, bytes);
            NodeEntry::Leaf(Leaf { key: key.to_string(), value })
        };
        let child = Node { entries: vec![leaf("app.post/00012")], layer: 0 };
        let upper = leaf("app.post/00011");
        let child_cid = blocks.add(&child.to_data().unwrap()).unwrap();
        let root = Node { entries: vec![NodeEntry::Tree(child_cid), upper], layer: 1 };
        let root_cid = blocks.add(&root.to_data().unwrap()).unwrap();
        let commit = create_commit(ALICE, root_cid, None, &signer).unwrap();
        let commit_cid = blocks.add(&commit).unwrap();
        let bytes = car::write_car(&[commit_cid], &blocks).unwrap();

        let target = MemoryBlockStore::new();
        assert!(matches!(
            Repository::import(
                &target,
                &bytes,
                Fanout::default(),
                VerificationPolicy::Require,
                Some(&signer.public_key()),
            ),
            Err(RepoError::MalformedNode(_))
        ));
        assert_eq!(target.head(ALICE).unwrap(), None);
        assert!(!target.has(&commit_cid).unwrap());
    }
}
