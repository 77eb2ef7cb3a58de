use libmstore_core::{RepoError, Repository};
use serde::Serialize;

use crate::cli::Cli;
use crate::context::MstoreContext;
use crate::output::{output_success, print_human};

#[derive(Serialize)]
struct RevertedKey {
    action: &'static str,
    key: String,
}

#[derive(Serialize)]
struct RevertOutput {
    commit: String,
    rev: String,
    /// Tree root the head now points at
    data: String,
    reverted: usize,
    changes: Vec<RevertedKey>,
}

pub fn run(cli: &Cli, count: usize) -> Result<(), RepoError> {
    let ctx = MstoreContext::resolve(cli)?;
    let signer = ctx.signer()?;
    let store = ctx.open_store()?;
    let mut repo = Repository::load(&store, ctx.account()?)?.with_fanout(ctx.fanout()?);

    let data = repo.revert(count, &signer)?;
    let changes: Vec<RevertedKey> = data
        .changeset
        .changes
        .iter()
        .map(|change| RevertedKey {
            action: change.op.as_str(),
            key: change.key.clone(),
        })
        .collect();

    for change in &changes {
        print_human(cli, &format!("{:<7} {}", change.action, change.key));
    }
    print_human(
        cli,
        &format!(
            "reverted {} commit(s) at rev {} ({} change(s))",
            count,
            data.commit.revision,
            changes.len()
        ),
    );
    output_success(
        cli,
        RevertOutput {
            commit: data.cid.to_string(),
            rev: data.commit.revision.clone(),
            data: data.commit.data.to_string(),
            reverted: count,
            changes,
        },
    );
    Ok(())
}
