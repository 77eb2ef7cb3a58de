//! Signed commits over tree roots
//!
//! A commit binds an account to a tree root at a revision and links to the
//! commit it supersedes. The signature covers the DAG-CBOR encoding of the
//! commit without its `sig` field.

use cid::Cid;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::codec;
use crate::error::RepoError;
use crate::signing::{DefaultVerifier, PublicKey, Signer, Verifier};
use crate::types::tid::Tid;

/// Commit format version written by this crate
pub const COMMIT_VERSION: u64 = 3;

/// A signed commit. Fields are declared in canonical DAG-CBOR key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    #[serde(rename = "did")]
    pub account_id: String,
    #[serde(rename = "rev")]
    pub revision: String,
    #[serde(rename = "sig", with = "serde_bytes")]
    pub signature: Vec<u8>,
    pub data: Cid,
    #[serde(rename = "prev")]
    pub previous: Option<Cid>,
    pub version: u64,
}

/// The signed portion of a commit
#[derive(Serialize)]
struct UnsignedCommit<'a> {
    did: &'a str,
    rev: &'a str,
    data: &'a Cid,
    prev: &'a Option<Cid>,
    version: u64,
}

impl Commit {
    /// Canonical encoding of every field except the signature
    pub fn unsigned_bytes(&self) -> Result<Vec<u8>, RepoError> {
        codec::encode(&UnsignedCommit {
            did: &self.account_id,
            rev: &self.revision,
            data: &self.data,
            prev: &self.previous,
            version: self.version,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RepoError> {
        codec::encode(self)
    }

    pub fn cid(&self) -> Result<Cid, RepoError> {
        codec::cid_for_cbor(&self.to_bytes()?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RepoError> {
        let commit: Commit =
            codec::decode(bytes).map_err(|e| RepoError::MalformedCommit(e.to_string()))?;
        if commit.version != COMMIT_VERSION {
            return Err(RepoError::MalformedCommit(format!(
                "unsupported commit version {}",
                commit.version
            )));
        }
        commit.revision()?;
        Ok(commit)
    }

    /// Revision parsed as a TID
    pub fn revision(&self) -> Result<Tid, RepoError> {
        Tid::parse(&self.revision)
            .map_err(|e| RepoError::MalformedCommit(format!("revision {:?}: {}", self.revision, e)))
    }
}

/// Build and sign the commit that follows `prev` with tree root `data`
pub fn create_commit(
    account_id: &str,
    data: Cid,
    prev: Option<&Commit>,
    signer: &dyn Signer,
) -> Result<Commit, RepoError> {
    let previous = prev.map(|p| p.cid()).transpose()?;
    let prior_rev = prev.map(|p| p.revision()).transpose()?;
    let revision = Tid::next(prior_rev.as_ref());

    let mut commit = Commit {
        account_id: account_id.to_string(),
        revision: revision.to_string(),
        signature: Vec::new(),
        data,
        previous,
        version: COMMIT_VERSION,
    };
    commit.signature = signer.sign(&commit.unsigned_bytes()?)?;

    info!(
        account = %account_id,
        rev = %commit.revision,
        data = %data,
        "created commit"
    );
    Ok(commit)
}

/// Check the commit signature against `key`
pub fn verify_commit(commit: &Commit, key: &PublicKey) -> Result<(), RepoError> {
    verify_commit_with(commit, key, &DefaultVerifier)
}

/// Check the commit signature against `key` using `verifier`
pub fn verify_commit_with(
    commit: &Commit,
    key: &PublicKey,
    verifier: &dyn Verifier,
) -> Result<(), RepoError> {
    verifier
        .verify(&commit.unsigned_bytes()?, &commit.signature, key)
        .map_err(|e| RepoError::SignatureInvalid(format!("commit rev {}: {}", commit.revision, e)))
}

/// Check that `next` validly follows `prior`: same account, linked by
/// `previous`, strictly greater revision, and a good signature.
pub fn verify_successor(prior: &Commit, next: &Commit, key: &PublicKey) -> Result<(), RepoError> {
    verify_successor_with(prior, next, key, &DefaultVerifier)
}

pub fn verify_successor_with(
    prior: &Commit,
    next: &Commit,
    key: &PublicKey,
    verifier: &dyn Verifier,
) -> Result<(), RepoError> {
    verify_commit_with(next, key, verifier)?;

    if prior.account_id != next.account_id {
        return Err(RepoError::AccountMismatch {
            expected: prior.account_id.clone(),
            actual: next.account_id.clone(),
        });
    }

    let prior_cid = prior.cid()?;
    if next.previous != Some(prior_cid) {
        return Err(RepoError::PreviousMismatch {
            expected: prior_cid.to_string(),
            actual: next
                .previous
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string()),
        });
    }

    if next.revision()? <= prior.revision()? {
        return Err(RepoError::RevisionNotMonotonic {
            prior: prior.revision.clone(),
            next: next.revision.clone(),
        });
    }
    Ok(())
}
