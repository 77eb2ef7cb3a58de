//! Read-side replication surface
//!
//! Shapes the repository for downstream consumers: the current head, a
//! record with the blocks proving it, and the stream of commit events a
//! firehose would carry.

use cid::Cid;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::car::write_car;
use crate::codec;
use crate::commit::{verify_commit_with, Commit};
use crate::error::RepoError;
use crate::mst::diff::ChangeOp;
use crate::mst::{Fanout, Mst};
use crate::repo::{load_previous, Repository};
use crate::signing::{DefaultVerifier, PublicKey, Verifier};
use crate::store::{BlockMap, MemoryBlockStore, RepoStore};
use crate::types::tid::Tid;

/// A record (or its absence) at the head, with the blocks that prove it
#[derive(Debug, Clone)]
pub struct RecordProof {
    pub commit_cid: Cid,
    pub commit: Commit,
    pub key: String,
    /// Record CID, `None` when the key is absent
    pub cid: Option<Cid>,
    pub value: Option<Vec<u8>>,
    /// Commit block, node path and record block
    pub blocks: BlockMap,
}

impl RecordProof {
    pub fn to_car(&self) -> Result<Vec<u8>, RepoError> {
        write_car(&[self.commit_cid], &self.blocks)
    }
}

/// One operation inside a commit event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoOp {
    pub action: ChangeOp,
    pub path: String,
    /// New record CID, `None` for deletes
    pub cid: Option<Cid>,
    /// Previous record CID, `None` for creates
    pub prev: Option<Cid>,
}

/// A commit as published to downstream consumers
#[derive(Debug, Clone)]
pub struct CommitEvent {
    pub repo: String,
    pub commit: Cid,
    pub rev: String,
    /// Revision of the preceding commit
    pub since: Option<String>,
    pub ops: Vec<RepoOp>,
    /// Commit block plus every block the commit introduced
    pub blocks: BlockMap,
}

impl CommitEvent {
    pub fn to_car(&self) -> Result<Vec<u8>, RepoError> {
        write_car(&[self.commit], &self.blocks)
    }
}

/// Sync queries over a repository store
pub struct SyncService<'a, S: RepoStore + ?Sized> {
    store: &'a S,
    fanout: Fanout,
    verifier: &'a dyn Verifier,
}

impl<'a, S: RepoStore + ?Sized> SyncService<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self::with_fanout(store, Fanout::default())
    }

    pub fn with_fanout(store: &'a S, fanout: Fanout) -> Self {
        Self {
            store,
            fanout,
            verifier: &DefaultVerifier,
        }
    }

    /// Check commit signatures in proofs with `verifier`
    pub fn with_verifier(mut self, verifier: &'a dyn Verifier) -> Self {
        self.verifier = verifier;
        self
    }

    fn repo(&self, account_id: &str) -> Result<Repository<'a, S>, RepoError> {
        Ok(Repository::load(self.store, account_id)?.with_fanout(self.fanout))
    }

    /// Current head commit of an account
    pub fn get_head(&self, account_id: &str) -> Result<(Cid, Commit), RepoError> {
        let repo = self.repo(account_id)?;
        Ok((repo.head_cid(), repo.head().clone()))
    }

    /// A record at the head with its inclusion (or absence) proof
    pub fn get_record(&self, account_id: &str, key: &str) -> Result<RecordProof, RepoError> {
        let repo = self.repo(account_id)?;
        let commit_cid = repo.head_cid();
        let commit = repo.head().clone();

        let mut blocks = repo.mst().proof_blocks(&commit.data, key)?;
        blocks.set(commit_cid, self.store.get_required(&commit_cid)?);

        let cid = repo.get_record_cid(key)?;
        let value = match cid {
            Some(cid) => {
                let value = self.store.get_required(&cid)?;
                blocks.set(cid, value.clone());
                Some(value)
            }
            None => None,
        };

        Ok(RecordProof {
            commit_cid,
            commit,
            key: key.to_string(),
            cid,
            value,
            blocks,
        })
    }

    /// Commit events after `since`, oldest first
    pub fn get_repo_range(
        &self,
        account_id: &str,
        since: Option<&Tid>,
    ) -> Result<Vec<CommitEvent>, RepoError> {
        self.get_repo_range_with_cancel(account_id, since, &CancelToken::new())
    }

    pub fn get_repo_range_with_cancel(
        &self,
        account_id: &str,
        since: Option<&Tid>,
        cancel: &CancelToken,
    ) -> Result<Vec<CommitEvent>, RepoError> {
        let repo = self.repo(account_id)?;
        let mut events = Vec::new();
        let mut prior_rev: Option<String> = None;
        for diff in repo.changesets_since(since, cancel)? {
            let since_rev = match prior_rev.take() {
                Some(rev) => Some(rev),
                None => load_previous(self.store, &diff.commit)?.map(|(_, prev)| prev.revision),
            };

            let ops = diff
                .changeset
                .changes
                .into_iter()
                .map(|change| RepoOp {
                    action: change.op,
                    path: change.key,
                    cid: change.new_value,
                    prev: change.old_value,
                })
                .collect();

            prior_rev = Some(diff.commit.revision.clone());
            events.push(CommitEvent {
                repo: diff.commit.account_id,
                commit: diff.cid,
                rev: diff.commit.revision,
                since: since_rev,
                ops,
                blocks: diff.blocks,
            });
        }
        debug!(account = %account_id, events = events.len(), "built repo range");
        Ok(events)
    }

    /// Check a proof using only its own blocks.
    ///
    /// Verifies every block hash, the commit signature, that the claimed
    /// value hashes to the claimed CID, and that walking the tree from the
    /// commit's root for `key` yields that CID. Returns the proven record CID.
    pub fn verify_record_proof(
        &self,
        proof: &RecordProof,
        key: &str,
        public_key: &PublicKey,
    ) -> Result<Option<Cid>, RepoError> {
        if proof.key != key {
            return Err(RepoError::InvalidArgs(format!(
                "proof is for {}, not {}",
                proof.key, key
            )));
        }
        for (cid, bytes) in proof.blocks.iter() {
            codec::verify_block(cid, bytes)
                .map_err(|e| RepoError::ProofInvalid(format!("block {}: {}", cid, e)))?;
        }

        let commit_bytes = proof
            .blocks
            .get(&proof.commit_cid)
            .ok_or_else(|| RepoError::ProofInvalid(format!("commit {} not included", proof.commit_cid)))?;
        let commit = Commit::from_bytes(commit_bytes)?;
        verify_commit_with(&commit, public_key, self.verifier)?;

        match (&proof.cid, &proof.value) {
            (Some(cid), Some(value)) => {
                if codec::cid_for_record(value)? != *cid {
                    return Err(RepoError::ProofInvalid(format!(
                        "value for {} does not hash to {}",
                        key, cid
                    )));
                }
            }
            (None, None) => {}
            _ => {
                return Err(RepoError::ProofInvalid(format!(
                    "record CID and value for {} disagree on presence",
                    key
                )))
            }
        }

        let proof_store = MemoryBlockStore::from_blocks(proof.blocks.clone());
        let found = match Mst::with_fanout(&proof_store, self.fanout).get(&commit.data, key) {
            Ok(found) => found,
            Err(RepoError::BlockNotFound(cid)) => {
                return Err(RepoError::ProofInvalid(format!(
                    "node {} on the path to {} not included",
                    cid, key
                )))
            }
            Err(RepoError::MalformedNode(reason)) => {
                return Err(RepoError::ProofInvalid(format!("path to {}: {}", key, reason)))
            }
            Err(e) => return Err(e),
        };
        if found != proof.cid {
            return Err(RepoError::ProofInvalid(format!(
                "tree under {} does not hold the claimed value for {}",
                commit.data, key
            )));
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::read_car;
    use crate::repo::RecordWrite;
    use crate::signing::{Ed25519Signer, Signer, SigningError, VerificationPolicy};
    use crate::store::BlockStore;

    const ALICE: &str = "did:example:alice";

    fn record(text: &str) -> Vec<u8> {
        codec::json_to_record(&serde_json::json!({ "text": text })).unwrap()
    }

    fn populated(store: &MemoryBlockStore, signer: &Ed25519Signer) -> Vec<Tid> {
        let mut repo = Repository::create(store, ALICE, signer).unwrap();
        let mut revs = vec![repo.head().revision().unwrap()];
        for batch in 0..3 {
            let writes: Vec<RecordWrite> = (0..5)
                .map(|i| {
                    let key = format!("app.post/{}{}", batch, i);
                    RecordWrite::create(&key, record(&format!("post {}", key))).unwrap()
                })
                .collect();
            repo.apply_writes(&writes, signer).unwrap();
            revs.push(repo.head().revision().unwrap());
        }
        revs
    }

    #[test]
    fn test_get_head() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        populated(&store, &signer);
        let sync = SyncService::new(&store);

        let (cid, commit) = sync.get_head(ALICE).unwrap();
        assert_eq!(Some(cid), store.head(ALICE).unwrap());
        assert_eq!(commit.account_id, ALICE);
        assert!(matches!(sync.get_head("did:example:bob"), Err(RepoError::RepoNotFound(_))));
    }

    #[test]
    fn test_record_proof_verifies() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        populated(&store, &signer);
        let sync = SyncService::new(&store);

        let proof = sync.get_record(ALICE, "app.post/12").unwrap();
        assert_eq!(proof.value, Some(record("post app.post/12")));
        let proven = sync
            .verify_record_proof(&proof, "app.post/12", &signer.public_key())
            .unwrap();
        assert_eq!(proven, proof.cid);

        // the proof travels as a CAR rooted at the commit
        let (roots, blocks) = read_car(&proof.to_car().unwrap()).unwrap();
        assert_eq!(roots, vec![proof.commit_cid]);
        assert_eq!(blocks, proof.blocks);
    }

    #[test]
    fn test_absence_proof() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        populated(&store, &signer);
        let sync = SyncService::new(&store);

        let proof = sync.get_record(ALICE, "app.post/99").unwrap();
        assert_eq!(proof.cid, None);
        assert_eq!(
            sync.verify_record_proof(&proof, "app.post/99", &signer.public_key()).unwrap(),
            None
        );
    }

    #[test]
    fn test_forged_proof_rejected() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        populated(&store, &signer);
        let sync = SyncService::new(&store);
        let key = signer.public_key();
        let other = sync.get_record(ALICE, "app.post/13").unwrap();
        assert_ne!(other.cid, sync.get_record(ALICE, "app.post/12").unwrap().cid);

        // another record's CID, with or without its value
        let mut proof = sync.get_record(ALICE, "app.post/12").unwrap();
        proof.cid = other.cid;
        assert!(matches!(
            sync.verify_record_proof(&proof, "app.post/12", &key),
            Err(RepoError::ProofInvalid(_))
        ));
        proof.value = other.value.clone();
        proof.blocks.extend(other.blocks.clone());
        assert!(matches!(
            sync.verify_record_proof(&proof, "app.post/12", &key),
            Err(RepoError::ProofInvalid(_))
        ));

        // claiming absence for a present key
        let mut proof = sync.get_record(ALICE, "app.post/12").unwrap();
        proof.cid = None;
        proof.value = None;
        assert!(matches!(
            sync.verify_record_proof(&proof, "app.post/12", &key),
            Err(RepoError::ProofInvalid(_))
        ));

        // tampered node bytes
        let mut proof = sync.get_record(ALICE, "app.post/12").unwrap();
        let root = proof.commit.data;
        proof.blocks.set(root, other.value.clone().unwrap());
        assert!(matches!(
            sync.verify_record_proof(&proof, "app.post/12", &key),
            Err(RepoError::ProofInvalid(_))
        ));

        // node missing from the path
        let mut proof = sync.get_record(ALICE, "app.post/12").unwrap();
        proof.blocks.remove(&root);
        assert!(matches!(
            sync.verify_record_proof(&proof, "app.post/12", &key),
            Err(RepoError::ProofInvalid(_))
        ));

        let proof = sync.get_record(ALICE, "app.post/12").unwrap();
        let stranger = Ed25519Signer::generate().public_key();
        assert!(matches!(
            sync.verify_record_proof(&proof, "app.post/12", &stranger),
            Err(RepoError::SignatureInvalid(_))
        ));
        assert!(matches!(
            sync.verify_record_proof(&proof, "app.post/13", &key),
            Err(RepoError::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_proof_uses_configured_verifier() {
        struct RejectAll;
        impl Verifier for RejectAll {
            fn verify(&self, _: &[u8], _: &[u8], _: &PublicKey) -> Result<(), SigningError> {
                Err(SigningError::InvalidSignature)
            }
        }

        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        populated(&store, &signer);
        let proof = SyncService::new(&store).get_record(ALICE, "app.post/12").unwrap();

        let strict = SyncService::new(&store).with_verifier(&RejectAll);
        assert!(matches!(
            strict.verify_record_proof(&proof, "app.post/12", &signer.public_key()),
            Err(RepoError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_range_after_checkout_import() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        populated(&store, &signer);
        let mut bytes = Vec::new();
        Repository::load(&store, ALICE)
            .unwrap()
            .export_car(&mut bytes, &CancelToken::new())
            .unwrap();

        let replica = MemoryBlockStore::new();
        let mut repo = Repository::import(
            &replica,
            &bytes,
            Fanout::default(),
            VerificationPolicy::Require,
            Some(&signer.public_key()),
        )
        .unwrap();
        let boundary = repo.head().revision().unwrap();
        let sync = SyncService::new(&replica);

        let events = sync.get_repo_range(ALICE, None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].since, None);
        assert_eq!(events[0].ops.len(), 15);

        repo.apply_writes(&[RecordWrite::delete("app.post/00").unwrap()], &signer)
            .unwrap();
        let events = sync.get_repo_range(ALICE, Some(&boundary)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].since, Some(boundary.to_string()));
        assert_eq!(events[0].ops[0].action, ChangeOp::Delete);

        let proof = sync.get_record(ALICE, "app.post/21").unwrap();
        assert!(sync.verify_record_proof(&proof, "app.post/21", &signer.public_key()).unwrap().is_some());
    }

    #[test]
    fn test_repo_range() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        let revs = populated(&store, &signer);
        let sync = SyncService::new(&store);

        let all = sync.get_repo_range(ALICE, None).unwrap();
        assert_eq!(all.len(), 4);
        assert!(all[0].ops.is_empty());
        assert_eq!(all[0].since, None);
        for window in all.windows(2) {
            assert_eq!(window[1].since.as_deref(), Some(window[0].rev.as_str()));
        }

        let recent = sync.get_repo_range(ALICE, Some(&revs[1])).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].since, Some(revs[1].to_string()));
        assert_eq!(recent[0].ops.len(), 5);
        assert!(recent[0].ops.iter().all(|op| op.action == ChangeOp::Create && op.prev.is_none()));
        assert!(recent[0].ops.iter().all(|op| op.path.starts_with("app.post/1")));

        // every event is self-contained for a consumer holding the prior state
        let event = &recent[1];
        assert!(event.blocks.has(&event.commit));
        for op in &event.ops {
            assert!(event.blocks.has(&op.cid.unwrap()) || store.has(&op.cid.unwrap()).unwrap());
        }
        assert!(sync.get_repo_range(ALICE, Some(&revs[3])).unwrap().is_empty());
    }

    #[test]
    fn test_replaying_events_rebuilds_repo() {
        let store = MemoryBlockStore::new();
        let signer = Ed25519Signer::generate();
        populated(&store, &signer);
        let sync = SyncService::new(&store);

        let replica = MemoryBlockStore::new();
        let mut expected_prev = None;
        for event in sync.get_repo_range(ALICE, None).unwrap() {
            crate::car::import_car(&replica, &event.to_car().unwrap(), Default::default()).unwrap();
            replica.swap_head(ALICE, expected_prev.as_ref(), &event.commit).unwrap();
            expected_prev = Some(event.commit);
        }

        let source = Repository::load(&store, ALICE).unwrap();
        let copy = Repository::load(&replica, ALICE).unwrap();
        assert_eq!(copy.head_cid(), source.head_cid());
        assert_eq!(copy.list(100, None).unwrap(), source.list(100, None).unwrap());
    }
}
