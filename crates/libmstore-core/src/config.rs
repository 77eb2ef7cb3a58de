use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::RepoError;
use crate::mst::Fanout;
use crate::signing::{Ed25519Signer, PublicKey, VerificationPolicy};

/// Repository configuration stored in `<data dir>/config.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Account identifier the repository belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    /// Tree fanout: 2, 4, 8, 16, 32 or 64 (default 4)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fanout: Option<u32>,
    /// Signature policy for imported commits: "off", "warn", or "require"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_imports: Option<String>,
    /// Ed25519 seed (hex)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,
    /// Public key in `alg:hex` form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl RepoConfig {
    pub fn fanout(&self) -> Result<Fanout, RepoError> {
        match self.fanout {
            Some(value) => Fanout::new(value),
            None => Ok(Fanout::default()),
        }
    }

    pub fn verification_policy(&self) -> Result<VerificationPolicy, RepoError> {
        match self.verify_imports.as_deref() {
            None => Ok(VerificationPolicy::default()),
            Some(s) => VerificationPolicy::from_str(s).ok_or_else(|| {
                RepoError::InvalidArgs(format!("unknown verify_imports policy: {}", s))
            }),
        }
    }

    pub fn signer(&self) -> Result<Option<Ed25519Signer>, RepoError> {
        self.signing_key
            .as_deref()
            .map(Ed25519Signer::from_seed_hex)
            .transpose()
            .map_err(RepoError::from)
    }

    pub fn public_key(&self) -> Result<Option<PublicKey>, RepoError> {
        self.public_key
            .as_deref()
            .map(str::parse::<PublicKey>)
            .transpose()
            .map_err(RepoError::from)
    }
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Location of the sled database inside a data directory
pub fn store_path(data_dir: &Path) -> PathBuf {
    data_dir.join("sled")
}

/// Load repo config from `<data dir>/config.toml`
pub fn load_repo_config(data_dir: &Path) -> Result<Option<RepoConfig>, RepoError> {
    let config_path = config_path(data_dir);
    if !config_path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&config_path)?;
    let config: RepoConfig = toml::from_str(&content)?;
    Ok(Some(config))
}

/// Save repo config to `<data dir>/config.toml`
pub fn save_repo_config(data_dir: &Path, config: &RepoConfig) -> Result<(), RepoError> {
    std::fs::create_dir_all(data_dir)?;
    let content = toml::to_string_pretty(config)?;
    std::fs::write(config_path(data_dir), content)?;
    Ok(())
}
