use chrono::SecondsFormat;
use libmstore_core::{RepoError, Repository};
use serde::Serialize;

use crate::cli::Cli;
use crate::context::MstoreContext;
use crate::output::{output_success, print_human};

#[derive(Serialize)]
struct LogEntry {
    commit: String,
    rev: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<String>,
    data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev: Option<String>,
    sig: String,
}

#[derive(Serialize)]
struct LogOutput {
    account: String,
    commits: Vec<LogEntry>,
}

pub fn run(cli: &Cli, limit: Option<usize>) -> Result<(), RepoError> {
    let ctx = MstoreContext::resolve(cli)?;
    let store = ctx.open_store()?;
    let account = ctx.account()?;
    let repo = Repository::load(&store, account)?;

    let mut commits = Vec::new();
    for (cid, commit) in repo.history(limit)? {
        let time = commit
            .revision()?
            .to_datetime()
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true));
        print_human(
            cli,
            &format!(
                "{}  {}  {}",
                commit.revision,
                time.as_deref().unwrap_or("-"),
                cid
            ),
        );
        commits.push(LogEntry {
            commit: cid.to_string(),
            rev: commit.revision,
            time,
            data: commit.data.to_string(),
            prev: commit.previous.map(|p| p.to_string()),
            sig: hex::encode(&commit.signature),
        });
    }

    output_success(
        cli,
        LogOutput {
            account: account.to_string(),
            commits,
        },
    );
    Ok(())
}
