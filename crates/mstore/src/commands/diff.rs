use libmstore_core::{RepoError, SyncService};
use serde::Serialize;

use super::parse_since;
use crate::cli::Cli;
use crate::context::MstoreContext;
use crate::output::{output_success, print_human};

#[derive(Serialize)]
struct OpOutput {
    action: &'static str,
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev: Option<String>,
}

#[derive(Serialize)]
struct CommitOutput {
    commit: String,
    rev: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    since: Option<String>,
    blocks: usize,
    ops: Vec<OpOutput>,
}

#[derive(Serialize)]
struct DiffOutput {
    account: String,
    commits: Vec<CommitOutput>,
}

pub fn run(cli: &Cli, since: Option<&str>) -> Result<(), RepoError> {
    let since = parse_since(since)?;
    let ctx = MstoreContext::resolve(cli)?;
    let store = ctx.open_store()?;
    let account = ctx.account()?;

    let events = SyncService::with_fanout(&*store, ctx.fanout()?).get_repo_range(account, since.as_ref())?;

    let mut commits = Vec::with_capacity(events.len());
    for event in events {
        print_human(cli, &format!("commit {} (rev {})", event.commit, event.rev));
        let ops: Vec<OpOutput> = event
            .ops
            .into_iter()
            .map(|op| {
                print_human(cli, &format!("  {:<6} {}", op.action.as_str(), op.path));
                OpOutput {
                    action: op.action.as_str(),
                    path: op.path,
                    cid: op.cid.map(|c| c.to_string()),
                    prev: op.prev.map(|c| c.to_string()),
                }
            })
            .collect();
        commits.push(CommitOutput {
            commit: event.commit.to_string(),
            rev: event.rev,
            since: event.since,
            blocks: event.blocks.len(),
            ops,
        });
    }

    output_success(
        cli,
        DiffOutput {
            account: account.to_string(),
            commits,
        },
    );
    Ok(())
}
