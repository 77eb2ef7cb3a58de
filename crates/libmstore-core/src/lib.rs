pub mod types;
pub mod codec;
pub mod store;
pub mod mst;
pub mod signing;
pub mod commit;
pub mod car;
pub mod repo;
pub mod sync;
pub mod integrity;
pub mod config;
pub mod cancel;
pub mod error;

pub use cid::Cid;
pub use error::{ErrorClass, RepoError};
pub use types::key::RecordKey;
pub use types::tid::Tid;
pub use store::{BlockMap, BlockStore, RepoStore, StagedStore};
pub use store::memory::MemoryBlockStore;
pub use store::sled::{LockedStore, SledBlockStore, StoreStats};
pub use mst::{Fanout, KeyRange, Leaf, Mst};
pub use mst::diff::{Change, ChangeOp, Changeset};
pub use signing::{
    DefaultVerifier, Ed25519Signer, PublicKey, SignatureAlgorithm, Signer, SigningError,
    VerificationPolicy, Verifier,
};
pub use commit::{
    create_commit, verify_commit, verify_commit_with, verify_successor, verify_successor_with, Commit,
};
pub use car::{export_car, import_car, read_car, write_car, ImportOptions, ImportSummary};
pub use repo::{CommitData, RecordWrite, Repository};
pub use sync::{CommitEvent, RecordProof, RepoOp, SyncService};
pub use integrity::{
    check_repo_integrity, check_repo_integrity_with, IntegrityProblem, IntegrityReport, ProblemKind,
};
pub use cancel::CancelToken;
pub use config::{RepoConfig, load_repo_config, save_repo_config};
