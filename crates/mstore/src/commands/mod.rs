pub mod diff;
pub mod export;
pub mod import;
pub mod init;
pub mod log;
pub mod record;
pub mod revert;
pub mod stats;
pub mod verify;

use libmstore_core::{RepoError, Tid};

/// Parse an optional `--since` revision
pub(crate) fn parse_since(since: Option<&str>) -> Result<Option<Tid>, RepoError> {
    since.map(Tid::parse).transpose().map_err(RepoError::from)
}
