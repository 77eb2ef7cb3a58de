use libmstore_core::{RepoError, RepoStore};
use serde::Serialize;

use crate::cli::Cli;
use crate::context::MstoreContext;
use crate::output::{output_success, print_human};

#[derive(Serialize)]
struct StatsOutput {
    path: String,
    size_bytes: u64,
    block_count: usize,
    block_bytes: u64,
    account_count: usize,
    accounts: Vec<String>,
}

pub fn run(cli: &Cli) -> Result<(), RepoError> {
    let ctx = MstoreContext::resolve(cli)?;
    let store = ctx.open_store()?;
    let stats = store.stats()?;
    let accounts = store.accounts()?;

    print_human(cli, &format!("path:     {}", stats.path));
    print_human(cli, &format!("size:     {} bytes", stats.size_bytes));
    print_human(cli, &format!("blocks:   {} ({} bytes)", stats.block_count, stats.block_bytes));
    print_human(cli, &format!("accounts: {}", accounts.join(", ")));

    output_success(
        cli,
        StatsOutput {
            path: stats.path,
            size_bytes: stats.size_bytes,
            block_count: stats.block_count,
            block_bytes: stats.block_bytes,
            account_count: stats.account_count,
            accounts,
        },
    );
    Ok(())
}
