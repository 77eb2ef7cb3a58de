use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use libmstore_core::{CancelToken, RepoError, Repository};
use serde::Serialize;
use tracing::debug;

use super::parse_since;
use crate::cli::Cli;
use crate::context::MstoreContext;
use crate::output::{output_success, print_human};

#[derive(Serialize)]
struct ExportOutput {
    path: String,
    kind: &'static str,
    blocks: usize,
    commit: String,
    rev: String,
}

pub fn run(cli: &Cli, output: Option<&Path>, since: Option<&str>) -> Result<(), RepoError> {
    if output.is_none() && cli.json {
        return Err(RepoError::InvalidArgs(
            "--json needs --output; stdout carries the archive".to_string(),
        ));
    }
    let since = parse_since(since)?;
    let ctx = MstoreContext::resolve(cli)?;
    let store = ctx.open_store()?;
    let repo = Repository::load(&store, ctx.account()?)?.with_fanout(ctx.fanout()?);
    let cancel = CancelToken::new();

    let write = |out: &mut dyn Write| -> Result<usize, RepoError> {
        match since {
            Some(ref since) => repo.export_diff_car(Some(since), out, &cancel),
            None => repo.export_car(out, &cancel),
        }
    };

    let Some(path) = output else {
        let stdout = std::io::stdout();
        let mut out = BufWriter::new(stdout.lock());
        let blocks = write(&mut out)?;
        out.flush()?;
        debug!(blocks, "archive written to stdout");
        return Ok(());
    };

    let mut out = BufWriter::new(File::create(path)?);
    let blocks = write(&mut out)?;
    out.flush()?;

    output_success(
        cli,
        ExportOutput {
            path: path.display().to_string(),
            kind: if since.is_some() { "diff" } else { "checkout" },
            blocks,
            commit: repo.head_cid().to_string(),
            rev: repo.head().revision.clone(),
        },
    );
    print_human(cli, &format!("Wrote {} blocks to {}", blocks, path.display()));
    Ok(())
}
