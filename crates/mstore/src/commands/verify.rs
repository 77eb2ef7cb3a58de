use libmstore_core::{check_repo_integrity, CancelToken, RepoError};
use serde::Serialize;

use crate::cli::Cli;
use crate::context::MstoreContext;
use crate::output::{output_success, print_human};

#[derive(Serialize)]
struct ProblemOutput {
    cid: String,
    kind: &'static str,
    detail: String,
}

#[derive(Serialize)]
struct VerifyOutput {
    account: String,
    healthy: bool,
    commits_checked: usize,
    nodes_checked: usize,
    records_checked: usize,
    signatures_checked: usize,
    /// Earliest commit held locally, when older history was never imported
    #[serde(skip_serializing_if = "Option::is_none")]
    history_start: Option<String>,
    problems: Vec<ProblemOutput>,
}

pub fn run(cli: &Cli) -> Result<(), RepoError> {
    let ctx = MstoreContext::resolve(cli)?;
    let store = ctx.open_store()?;
    let account = ctx.account()?;
    // the configured key only vouches for the configured account
    let key = if Some(account) == ctx.config.account.as_deref() {
        ctx.config.public_key()?
    } else {
        None
    };

    let report = check_repo_integrity(&store, account, key.as_ref(), ctx.fanout()?, &CancelToken::new())?;

    for problem in &report.problems {
        print_human(
            cli,
            &format!("{:<18} {}  {}", problem.kind.as_str(), problem.cid, problem.detail),
        );
    }
    if let Some(start) = &report.history_start {
        print_human(cli, &format!("history starts at {}", start));
    }
    print_human(
        cli,
        &format!(
            "Checked {} commits, {} nodes, {} records: {} problem(s)",
            report.commits_checked,
            report.nodes_checked,
            report.records_checked,
            report.problem_count()
        ),
    );

    let problem_count = report.problem_count();
    output_success(
        cli,
        VerifyOutput {
            account: account.to_string(),
            healthy: report.is_healthy(),
            commits_checked: report.commits_checked,
            nodes_checked: report.nodes_checked,
            records_checked: report.records_checked,
            signatures_checked: report.signatures_checked,
            history_start: report.history_start.map(|c| c.to_string()),
            problems: report
                .problems
                .into_iter()
                .map(|p| ProblemOutput {
                    cid: p.cid.to_string(),
                    kind: p.kind.as_str(),
                    detail: p.detail,
                })
                .collect(),
        },
    );

    if problem_count > 0 {
        return Err(RepoError::IntegrityCheckFailed(problem_count));
    }
    Ok(())
}
