use std::path::Path;

use libmstore_core::{PublicKey, RepoError, Repository, VerificationPolicy};
use serde::Serialize;

use crate::cli::{Cli, PolicyArg};
use crate::context::MstoreContext;
use crate::output::{output_success, print_human};

#[derive(Serialize)]
struct ImportOutput {
    account: String,
    commit: String,
    rev: String,
    records: usize,
    verification: &'static str,
}

impl From<PolicyArg> for VerificationPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Off => VerificationPolicy::Off,
            PolicyArg::Warn => VerificationPolicy::Warn,
            PolicyArg::Require => VerificationPolicy::Require,
        }
    }
}

pub fn run(
    cli: &Cli,
    file: &Path,
    verify: Option<PolicyArg>,
    public_key: Option<&str>,
) -> Result<(), RepoError> {
    let ctx = MstoreContext::resolve(cli)?;
    let policy = match verify {
        Some(arg) => arg.into(),
        None => ctx.config.verification_policy()?,
    };
    let key = match public_key {
        Some(text) => Some(text.parse::<PublicKey>()?),
        None => ctx.config.public_key()?,
    };
    let bytes = std::fs::read(file)?;

    let store = ctx.open_store()?;
    let repo = Repository::import(&store, &bytes, ctx.fanout()?, policy, key.as_ref())?;
    let records = repo.mst().leaf_count(&repo.data_root())?;

    output_success(
        cli,
        ImportOutput {
            account: repo.account_id().to_string(),
            commit: repo.head_cid().to_string(),
            rev: repo.head().revision.clone(),
            records,
            verification: policy.as_str(),
        },
    );
    print_human(
        cli,
        &format!(
            "Imported {} at rev {} ({} records)",
            repo.account_id(),
            repo.head().revision,
            records
        ),
    );
    Ok(())
}
