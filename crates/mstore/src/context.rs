use std::path::PathBuf;
use std::time::Duration;

use libmstore_core::config::{load_repo_config, store_path};
use libmstore_core::{Ed25519Signer, Fanout, LockedStore, RepoConfig, RepoError, SledBlockStore};

use crate::cli::Cli;

/// How long a command waits for another process to release the store
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolved data directory and configuration for a command
pub struct MstoreContext {
    pub data_dir: PathBuf,
    pub config: RepoConfig,
    account_override: Option<String>,
}

impl MstoreContext {
    /// Data directory resolution order:
    /// 1. --data-dir
    /// 2. MSTORE_DIR
    /// 3. ./.mstore
    pub fn data_dir(cli: &Cli) -> PathBuf {
        if let Some(ref dir) = cli.data_dir {
            return dir.clone();
        }
        if let Ok(dir) = std::env::var("MSTORE_DIR") {
            return PathBuf::from(dir);
        }
        PathBuf::from(".mstore")
    }

    /// Resolve an initialized data directory
    pub fn resolve(cli: &Cli) -> Result<Self, RepoError> {
        let data_dir = Self::data_dir(cli);
        let config = load_repo_config(&data_dir)?.ok_or_else(|| {
            RepoError::RepoNotFound(format!("no repository in {}", data_dir.display()))
        })?;
        Ok(Self {
            data_dir,
            config,
            account_override: cli.account.clone(),
        })
    }

    /// Account the command operates on
    pub fn account(&self) -> Result<&str, RepoError> {
        self.account_override
            .as_deref()
            .or(self.config.account.as_deref())
            .ok_or_else(|| RepoError::InvalidArgs("no account configured; pass --account".to_string()))
    }

    pub fn fanout(&self) -> Result<Fanout, RepoError> {
        self.config.fanout()
    }

    pub fn signer(&self) -> Result<Ed25519Signer, RepoError> {
        self.config
            .signer()?
            .ok_or_else(|| RepoError::InvalidArgs("no signing key in config.toml".to_string()))
    }

    /// Open the store, waiting up to a few seconds for another process's lock
    pub fn open_store(&self) -> Result<LockedStore, RepoError> {
        SledBlockStore::open_locked(&store_path(&self.data_dir), LOCK_TIMEOUT)
    }
}
