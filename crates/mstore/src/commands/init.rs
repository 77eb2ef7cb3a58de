use libmstore_core::config::{config_path, save_repo_config};
use libmstore_core::{Ed25519Signer, Fanout, RepoConfig, RepoError, Repository, Signer};
use serde::Serialize;

use crate::cli::Cli;
use crate::context::MstoreContext;
use crate::output::{output_success, print_human};

#[derive(Serialize)]
struct InitOutput {
    account: String,
    data_dir: String,
    fanout: u32,
    commit: String,
    rev: String,
    public_key: String,
}

pub fn run(cli: &Cli, did: &str, fanout: Option<u32>) -> Result<(), RepoError> {
    let data_dir = MstoreContext::data_dir(cli);
    if config_path(&data_dir).exists() {
        return Err(RepoError::InvalidArgs(format!(
            "{} already holds a repository",
            data_dir.display()
        )));
    }
    if did.is_empty() || did.contains(char::is_whitespace) {
        return Err(RepoError::InvalidArgs(format!("invalid account identifier: {:?}", did)));
    }
    let fanout_value = fanout.map(Fanout::new).transpose()?.unwrap_or_default();

    let signer = Ed25519Signer::generate();
    let config = RepoConfig {
        account: Some(did.to_string()),
        fanout: fanout.map(|_| fanout_value.value()),
        verify_imports: None,
        signing_key: Some(signer.seed_hex()),
        public_key: Some(signer.public_key().to_string()),
    };
    save_repo_config(&data_dir, &config)?;

    let ctx = MstoreContext::resolve(cli)?;
    let store = ctx.open_store()?;
    let repo = Repository::create(&store, did, &signer)?;

    output_success(
        cli,
        InitOutput {
            account: did.to_string(),
            data_dir: data_dir.to_string_lossy().to_string(),
            fanout: fanout_value.value(),
            commit: repo.head_cid().to_string(),
            rev: repo.head().revision.clone(),
            public_key: signer.public_key().to_string(),
        },
    );
    print_human(
        cli,
        &format!("Initialized repository for {} in {}", did, data_dir.display()),
    );
    Ok(())
}
