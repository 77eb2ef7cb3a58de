//! Integrity checking for repositories
//!
//! Re-hashes every block reachable from an account's commit chain, decodes
//! every node and commit, and verifies signatures and chain linkage.
//! Problems are collected rather than stopping at the first one. A chain
//! whose earliest commits were never imported ends cleanly at the first
//! commit held locally.

use std::collections::HashSet;

use cid::Cid;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::codec;
use crate::commit::{verify_commit_with, Commit};
use crate::error::RepoError;
use crate::mst::{Fanout, KeyRange, Mst, NodeEntry};
use crate::signing::{DefaultVerifier, PublicKey, Verifier};
use crate::store::RepoStore;

/// Result of an integrity check
#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub commits_checked: usize,
    pub nodes_checked: usize,
    pub records_checked: usize,
    /// Signatures verified (zero without a public key)
    pub signatures_checked: usize,
    /// Earliest local commit, set when the commits before it are not held
    pub history_start: Option<Cid>,
    pub problems: Vec<IntegrityProblem>,
}

/// A block that failed a check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityProblem {
    pub cid: Cid,
    pub kind: ProblemKind,
    pub detail: String,
}

/// Types of integrity problems
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemKind {
    /// Stored bytes do not hash to their CID
    HashMismatch,
    /// Node fails to decode or violates tree invariants
    MalformedNode,
    /// Commit fails to decode
    MalformedCommit,
    /// Referenced block is absent
    MissingBlock,
    /// Commit signature does not verify
    SignatureInvalid,
    /// Commit does not follow its predecessor
    ChainBroken,
}

impl ProblemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemKind::HashMismatch => "hash_mismatch",
            ProblemKind::MalformedNode => "malformed_node",
            ProblemKind::MalformedCommit => "malformed_commit",
            ProblemKind::MissingBlock => "missing_block",
            ProblemKind::SignatureInvalid => "signature_invalid",
            ProblemKind::ChainBroken => "chain_broken",
        }
    }
}

impl IntegrityReport {
    /// Check if the report indicates all is well
    pub fn is_healthy(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn problem_count(&self) -> usize {
        self.problems.len()
    }

    fn problem(&mut self, cid: Cid, kind: ProblemKind, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(%cid, kind = kind.as_str(), %detail, "integrity problem");
        self.problems.push(IntegrityProblem { cid, kind, detail });
    }
}

/// Check everything reachable from an account's head.
///
/// Fails only when the account has no head or the walk is cancelled; every
/// other defect becomes a problem in the report.
pub fn check_repo_integrity<S: RepoStore + ?Sized>(
    store: &S,
    account_id: &str,
    public_key: Option<&PublicKey>,
    fanout: Fanout,
    cancel: &CancelToken,
) -> Result<IntegrityReport, RepoError> {
    check_repo_integrity_with(store, account_id, public_key, &DefaultVerifier, fanout, cancel)
}

/// [`check_repo_integrity`] with a caller-supplied signature verifier
pub fn check_repo_integrity_with<S: RepoStore + ?Sized>(
    store: &S,
    account_id: &str,
    public_key: Option<&PublicKey>,
    verifier: &dyn Verifier,
    fanout: Fanout,
    cancel: &CancelToken,
) -> Result<IntegrityReport, RepoError> {
    let head = store
        .head(account_id)?
        .ok_or_else(|| RepoError::RepoNotFound(account_id.to_string()))?;

    let mut report = IntegrityReport::default();
    let mut seen = HashSet::new();
    let mst = Mst::with_fanout(store, fanout);

    let mut next: Option<(Cid, Option<Commit>)> = Some((head, None));
    while let Some((cid, child)) = next.take() {
        cancel.check()?;
        let Some(commit) = load_commit(store, &cid, &mut report)? else {
            break;
        };
        report.commits_checked += 1;

        if commit.account_id != account_id {
            report.problem(
                cid,
                ProblemKind::ChainBroken,
                format!("commit belongs to {}", commit.account_id),
            );
        }
        if let Some(key) = public_key {
            report.signatures_checked += 1;
            if let Err(e) = verify_commit_with(&commit, key, verifier) {
                report.problem(cid, ProblemKind::SignatureInvalid, e.to_string());
            }
        }
        if let Some(child) = &child {
            match (child.revision(), commit.revision()) {
                (Ok(later), Ok(earlier)) if later <= earlier => report.problem(
                    cid,
                    ProblemKind::ChainBroken,
                    format!("revision {} is not before {}", commit.revision, child.revision),
                ),
                (Ok(_), Ok(_)) => {}
                (_, Err(e)) | (Err(e), _) => {
                    report.problem(cid, ProblemKind::MalformedCommit, e.to_string())
                }
            }
        }

        check_tree(&mst, &commit.data, &mut seen, &mut report, cancel)?;
        let previous = commit.previous;
        next = match previous {
            Some(prev) if store.has(&prev)? => Some((prev, Some(commit))),
            Some(prev) => {
                debug!(commit = %cid, previous = %prev, "history starts at imported commit");
                report.history_start = Some(cid);
                None
            }
            None => None,
        };
    }

    debug!(
        account = %account_id,
        commits = report.commits_checked,
        nodes = report.nodes_checked,
        records = report.records_checked,
        problems = report.problems.len(),
        "integrity check finished"
    );
    Ok(report)
}

/// Fetch and hash-check a block, recording problems. `None` when unusable.
fn load_block<S: RepoStore + ?Sized>(
    store: &S,
    cid: &Cid,
    report: &mut IntegrityReport,
) -> Result<Option<Vec<u8>>, RepoError> {
    let Some(bytes) = store.get(cid)? else {
        report.problem(*cid, ProblemKind::MissingBlock, "block not in store");
        return Ok(None);
    };
    match codec::verify_block(cid, &bytes) {
        Ok(()) => Ok(Some(bytes)),
        Err(e) => {
            report.problem(*cid, ProblemKind::HashMismatch, e.to_string());
            Ok(None)
        }
    }
}

fn load_commit<S: RepoStore + ?Sized>(
    store: &S,
    cid: &Cid,
    report: &mut IntegrityReport,
) -> Result<Option<Commit>, RepoError> {
    let Some(bytes) = load_block(store, cid, report)? else {
        return Ok(None);
    };
    match Commit::from_bytes(&bytes) {
        Ok(commit) => Ok(Some(commit)),
        Err(e) => {
            report.problem(*cid, ProblemKind::MalformedCommit, e.to_string());
            Ok(None)
        }
    }
}

fn check_tree<S: RepoStore + ?Sized>(
    mst: &Mst<'_, S>,
    root: &Cid,
    seen: &mut HashSet<Cid>,
    report: &mut IntegrityReport,
    cancel: &CancelToken,
) -> Result<(), RepoError> {
    let store = mst.store();
    let mut stack: Vec<(Cid, Option<u32>, KeyRange)> = vec![(*root, None, KeyRange::unbounded())];
    while let Some((cid, layer, range)) = stack.pop() {
        if !seen.insert(cid) {
            continue;
        }
        cancel.check()?;
        if load_block(store, &cid, report)?.is_none() {
            continue;
        }
        let node = match mst.read_node_in(&cid, layer, &range) {
            Ok(node) => node,
            Err(e) => {
                report.problem(cid, ProblemKind::MalformedNode, e.to_string());
                continue;
            }
        };
        report.nodes_checked += 1;

        let child_layer = node.layer.checked_sub(1);
        for (index, entry) in node.entries.iter().enumerate() {
            match entry {
                NodeEntry::Tree(child) => {
                    stack.push((*child, child_layer, range.for_subtree(&node.entries, index)))
                }
                NodeEntry::Leaf(leaf) => {
                    if seen.insert(leaf.value) {
                        report.records_checked += 1;
                        load_block(store, &leaf.value, report)?;
                    }
                }
            }
        }
    }
    Ok(())
}
