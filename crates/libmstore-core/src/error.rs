use cid::Cid;
use thiserror::Error;

use crate::signing::SigningError;
use crate::types::tid::TidParseError;

/// Main error type for repository operations
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("block not found: {0}")]
    BlockNotFound(Cid),

    #[error("hash mismatch for block {cid}: content hashes to {computed}")]
    HashMismatch { cid: Cid, computed: Cid },

    #[error("unsupported multihash code 0x{0:x}")]
    UnsupportedHash(u64),

    #[error("malformed node: {0}")]
    MalformedNode(String),

    #[error("malformed commit: {0}")]
    MalformedCommit(String),

    #[error("malformed block {cid}: {reason}")]
    MalformedBlock { cid: Cid, reason: String },

    #[error("proof does not hold: {0}")]
    ProofInvalid(String),

    #[error("no shared history: {0}")]
    NoSharedHistory(String),

    #[error("invalid CAR archive: {0}")]
    InvalidCar(String),

    #[error("previous commit mismatch: expected {expected}, found {actual}")]
    PreviousMismatch { expected: String, actual: String },

    #[error("revision {next} is not greater than {prior}")]
    RevisionNotMonotonic { prior: String, next: String },

    #[error("account mismatch: expected {expected}, found {actual}")]
    AccountMismatch { expected: String, actual: String },

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("invalid record key: {0}")]
    InvalidKey(String),

    #[error("key already mapped to a different value: {0}")]
    KeyExists(String),

    #[error("record already exists: {0}")]
    RecordExists(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("integrity check found {0} problem(s)")]
    IntegrityCheckFailed(usize),

    #[error("CBOR encode error: {0}")]
    Encode(String),

    #[error("CBOR decode error: {0}")]
    Decode(String),

    #[error("database busy: {0}")]
    DbBusy(String),

    #[error("revision parse error: {0}")]
    Tid(#[from] TidParseError),

    #[error("signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error classes, each with its own recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Data does not match its hash or shape. Never repaired, never retried.
    Integrity,
    /// Head moved underneath the writer. Re-read the head and retry.
    Consistency,
    /// A referenced block is missing from the store.
    Availability,
    /// Signature does not verify.
    Verification,
    /// Bad input from the caller.
    Usage,
    /// Backing storage or filesystem failure.
    Storage,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Integrity => "integrity",
            ErrorClass::Consistency => "consistency",
            ErrorClass::Availability => "availability",
            ErrorClass::Verification => "verification",
            ErrorClass::Usage => "usage",
            ErrorClass::Storage => "storage",
        }
    }
}

impl RepoError {
    pub fn error_class(&self) -> ErrorClass {
        match self {
            RepoError::HashMismatch { .. }
            | RepoError::UnsupportedHash(_)
            | RepoError::MalformedNode(_)
            | RepoError::MalformedCommit(_)
            | RepoError::MalformedBlock { .. }
            | RepoError::InvalidCar(_)
            | RepoError::ProofInvalid(_)
            | RepoError::IntegrityCheckFailed(_)
            | RepoError::Decode(_) => ErrorClass::Integrity,
            RepoError::PreviousMismatch { .. }
            | RepoError::RevisionNotMonotonic { .. }
            | RepoError::RecordExists(_)
            | RepoError::RecordNotFound(_)
            | RepoError::KeyExists(_)
            | RepoError::NoSharedHistory(_) => ErrorClass::Consistency,
            RepoError::BlockNotFound(_) | RepoError::RepoNotFound(_) => ErrorClass::Availability,
            RepoError::SignatureInvalid(_)
            | RepoError::AccountMismatch { .. }
            | RepoError::Signing(_) => ErrorClass::Verification,
            RepoError::InvalidKey(_)
            | RepoError::InvalidArgs(_)
            | RepoError::Tid(_)
            | RepoError::Json(_)
            | RepoError::TomlParse(_)
            | RepoError::Cancelled => ErrorClass::Usage,
            RepoError::DbBusy(_)
            | RepoError::Io(_)
            | RepoError::Sled(_)
            | RepoError::Encode(_)
            | RepoError::TomlSerialize(_)
            | RepoError::Internal(_) => ErrorClass::Storage,
        }
    }

    /// Whether re-reading the head and retrying can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RepoError::PreviousMismatch { .. } | RepoError::RevisionNotMonotonic { .. }
        )
    }

    /// Get the error code for JSON output
    pub fn error_code(&self) -> &'static str {
        match self {
            RepoError::BlockNotFound(_) => "block_not_found",
            RepoError::HashMismatch { .. } => "hash_mismatch",
            RepoError::UnsupportedHash(_) => "unsupported_hash",
            RepoError::MalformedNode(_) => "malformed_node",
            RepoError::MalformedCommit(_) => "malformed_commit",
            RepoError::MalformedBlock { .. } => "malformed_block",
            RepoError::InvalidCar(_) => "invalid_car",
            RepoError::ProofInvalid(_) => "proof_invalid",
            RepoError::NoSharedHistory(_) => "no_shared_history",
            RepoError::IntegrityCheckFailed(_) => "integrity_failed",
            RepoError::PreviousMismatch { .. } => "previous_mismatch",
            RepoError::RevisionNotMonotonic { .. } => "revision_not_monotonic",
            RepoError::AccountMismatch { .. } => "account_mismatch",
            RepoError::SignatureInvalid(_) | RepoError::Signing(_) => "signature_invalid",
            RepoError::InvalidKey(_) => "invalid_key",
            RepoError::KeyExists(_) | RepoError::RecordExists(_) => "conflict",
            RepoError::RecordNotFound(_) | RepoError::RepoNotFound(_) => "not_found",
            RepoError::InvalidArgs(_) | RepoError::Tid(_) | RepoError::TomlParse(_) => {
                "invalid_args"
            }
            RepoError::Cancelled => "cancelled",
            RepoError::DbBusy(_) => "db_busy",
            RepoError::Io(_) => "io_error",
            RepoError::Sled(_) => "db_error",
            RepoError::Json(_) => "invalid_args",
            RepoError::Encode(_) | RepoError::Decode(_) => "codec_error",
            RepoError::TomlSerialize(_) | RepoError::Internal(_) => "internal_error",
        }
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        match self.error_class() {
            ErrorClass::Usage => 2,
            ErrorClass::Availability => 3,
            ErrorClass::Consistency => 4,
            ErrorClass::Storage => 5,
            ErrorClass::Integrity => 6,
            ErrorClass::Verification => 7,
        }
    }

    /// Get actionable suggestions for fixing the error
    pub fn suggestions(&self) -> Vec<&'static str> {
        match self {
            RepoError::RepoNotFound(_) => vec!["Run 'mstore init' to create a repository"],
            RepoError::RecordNotFound(_) => vec!["Run 'mstore ls' to see existing records"],
            RepoError::RecordExists(_) => vec!["Use 'mstore put --update' to replace the record"],
            RepoError::InvalidKey(_) => vec![
                "Keys have the form <collection>/<record-id>",
                "Allowed characters: A-Z a-z 0-9 . - _ : ~",
            ],
            RepoError::DbBusy(_) => vec!["Wait for the other mstore process to finish"],
            RepoError::PreviousMismatch { .. } => {
                vec!["Another writer moved the head; retry the command"]
            }
            RepoError::IntegrityCheckFailed(_) => {
                vec!["Restore the damaged blocks with 'mstore import' from a good archive"]
            }
            RepoError::HashMismatch { .. } | RepoError::MalformedNode(_) => {
                vec!["Run 'mstore verify' to inspect the repository"]
            }
            RepoError::NoSharedHistory(_) => vec![
                "Run 'mstore log' to list the revisions this store holds",
                "Fetch a full archive with 'mstore export' instead of a delta",
            ],
            RepoError::Sled(_) => vec!["Check disk space and permissions on the data directory"],
            _ => vec![],
        }
    }
}

pub(crate) fn encode_err<E: std::fmt::Display>(err: E) -> RepoError {
    RepoError::Encode(err.to_string())
}

pub(crate) fn decode_err<E: std::fmt::Display>(err: E) -> RepoError {
    RepoError::Decode(err.to_string())
}
