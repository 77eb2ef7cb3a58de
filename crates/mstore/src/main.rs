mod cli;
mod commands;
mod context;
mod output;

use clap::Parser;
use cli::{Cli, Command};
use libmstore_core::RepoError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run_command(&cli) {
        output::output_error(&cli, &e);
        std::process::exit(e.exit_code());
    }
}

/// Logs go to stderr so that stdout stays clean for data and archives
fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_command(cli: &Cli) -> Result<(), RepoError> {
    match &cli.command {
        Command::Init { did, fanout } => commands::init::run(cli, did, *fanout),
        Command::Put { key, value, file, update } => {
            commands::record::put(cli, key, value.as_deref(), file.as_deref(), *update)
        }
        Command::Get { key } => commands::record::get(cli, key),
        Command::Rm { key } => commands::record::rm(cli, key),
        Command::Ls { collection, after, limit } => {
            commands::record::ls(cli, collection.as_deref(), after.as_deref(), *limit)
        }
        Command::Log { limit } => commands::log::run(cli, *limit),
        Command::Revert { count } => commands::revert::run(cli, *count),
        Command::Diff { since } => commands::diff::run(cli, since.as_deref()),
        Command::Export { output, since } => {
            commands::export::run(cli, output.as_deref(), since.as_deref())
        }
        Command::Import { file, verify, public_key } => {
            commands::import::run(cli, file, *verify, public_key.as_deref())
        }
        Command::Verify => commands::verify::run(cli),
        Command::Stats => commands::stats::run(cli),
    }
}
