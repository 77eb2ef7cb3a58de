use std::path::Path;

use libmstore_core::codec::{json_to_record, record_to_json};
use libmstore_core::{LockedStore, RecordWrite, RepoError, Repository};
use serde::Serialize;

use crate::cli::Cli;
use crate::context::MstoreContext;
use crate::output::{output_success, print_human};

#[derive(Serialize)]
struct WriteOutput {
    key: String,
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cid: Option<String>,
    commit: String,
    rev: String,
}

#[derive(Serialize)]
struct RecordOutput {
    key: String,
    cid: String,
    value: serde_json::Value,
}

#[derive(Serialize)]
struct ListEntry {
    key: String,
    cid: String,
}

#[derive(Serialize)]
struct ListOutput {
    records: Vec<ListEntry>,
    count: usize,
}

fn open_repo<'a>(
    ctx: &MstoreContext,
    store: &'a LockedStore,
) -> Result<Repository<'a, LockedStore>, RepoError> {
    Ok(Repository::load(store, ctx.account()?)?.with_fanout(ctx.fanout()?))
}

fn apply_one(cli: &Cli, write: RecordWrite, action: &'static str) -> Result<(), RepoError> {
    let ctx = MstoreContext::resolve(cli)?;
    let signer = ctx.signer()?;
    let store = ctx.open_store()?;
    let mut repo = open_repo(&ctx, &store)?;

    let key = write.key().to_string();
    let data = repo.apply_writes(&[write], &signer)?;
    let cid = data
        .changeset
        .changes
        .iter()
        .find(|change| change.key == key)
        .and_then(|change| change.new_value);

    output_success(
        cli,
        WriteOutput {
            key: key.clone(),
            action,
            cid: cid.map(|c| c.to_string()),
            commit: data.cid.to_string(),
            rev: data.commit.revision.clone(),
        },
    );
    print_human(cli, &format!("{} {} at rev {}", action, key, data.commit.revision));
    Ok(())
}

pub fn put(
    cli: &Cli,
    key: &str,
    value: Option<&str>,
    file: Option<&Path>,
    update: bool,
) -> Result<(), RepoError> {
    let bytes = match (value, file) {
        (Some(json), None) => json_to_record(&serde_json::from_str(json)?)?,
        (None, Some(path)) => std::fs::read(path)?,
        _ => {
            return Err(RepoError::InvalidArgs(
                "provide a JSON value or --file".to_string(),
            ))
        }
    };
    if update {
        apply_one(cli, RecordWrite::update(key, bytes)?, "updated")
    } else {
        apply_one(cli, RecordWrite::create(key, bytes)?, "created")
    }
}

pub fn rm(cli: &Cli, key: &str) -> Result<(), RepoError> {
    apply_one(cli, RecordWrite::delete(key)?, "deleted")
}

pub fn get(cli: &Cli, key: &str) -> Result<(), RepoError> {
    let ctx = MstoreContext::resolve(cli)?;
    let store = ctx.open_store()?;
    let repo = open_repo(&ctx, &store)?;

    let cid = repo
        .get_record_cid(key)?
        .ok_or_else(|| RepoError::RecordNotFound(key.to_string()))?;
    let value = record_to_json(&repo.get_record(key)?.ok_or(RepoError::BlockNotFound(cid))?);

    if !cli.json && !cli.quiet {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    output_success(
        cli,
        RecordOutput {
            key: key.to_string(),
            cid: cid.to_string(),
            value,
        },
    );
    Ok(())
}

pub fn ls(
    cli: &Cli,
    collection: Option<&str>,
    after: Option<&str>,
    limit: usize,
) -> Result<(), RepoError> {
    let ctx = MstoreContext::resolve(cli)?;
    let store = ctx.open_store()?;
    let repo = open_repo(&ctx, &store)?;

    let leaves = match collection {
        Some(collection) => repo
            .list_records(collection)?
            .into_iter()
            .filter(|leaf| after.map_or(true, |after| leaf.key.as_str() > after))
            .take(limit)
            .collect(),
        None => repo.list(limit, after)?,
    };

    for leaf in &leaves {
        print_human(cli, &format!("{}  {}", leaf.value, leaf.key));
    }
    let records: Vec<ListEntry> = leaves
        .into_iter()
        .map(|leaf| ListEntry {
            key: leaf.key,
            cid: leaf.value.to_string(),
        })
        .collect();
    output_success(
        cli,
        ListOutput {
            count: records.len(),
            records,
        },
    );
    Ok(())
}
