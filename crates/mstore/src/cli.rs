use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mstore", about = "Signed Merkle Search Tree repositories", version)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress human-readable output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Override the data directory (default: $MSTORE_DIR or ./.mstore)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Operate on another account held in the same store
    #[arg(long, global = true)]
    pub account: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a repository and a signing key in the data directory
    Init {
        /// Account identifier the repository belongs to
        #[arg(long = "did")]
        did: String,

        /// Tree fanout (2, 4, 8, 16, 32 or 64)
        #[arg(long)]
        fanout: Option<u32>,
    },

    /// Create or replace a record
    Put {
        /// Record key: <collection>/<record-id>
        key: String,

        /// Record value as JSON
        #[arg(conflicts_with = "file")]
        value: Option<String>,

        /// Read the record from a file instead (stored as-is)
        #[arg(long)]
        file: Option<PathBuf>,

        /// Replace an existing record instead of creating a new one
        #[arg(long)]
        update: bool,
    },

    /// Show a record
    Get {
        key: String,
    },

    /// Delete a record
    Rm {
        key: String,
    },

    /// List records in key order
    Ls {
        /// Only records in this collection
        #[arg(long)]
        collection: Option<String>,

        /// Start after this key
        #[arg(long)]
        after: Option<String>,

        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Show the commit history, newest first
    Log {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Put the records back as they were some commits ago, as a new commit
    Revert {
        /// Number of commits to undo
        #[arg(default_value_t = 1)]
        count: usize,
    },

    /// Show record operations of the commits after a revision
    Diff {
        /// Revision to start after (default: the whole history)
        #[arg(long)]
        since: Option<String>,
    },

    /// Write the repository as a CAR archive
    Export {
        /// Output file (default: stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Only commits after this revision and the blocks they added
        #[arg(long)]
        since: Option<String>,
    },

    /// Restore a repository from a checkout CAR archive
    Import {
        /// Archive to read
        file: PathBuf,

        /// Signature policy (overrides verify_imports in the config)
        #[arg(long, value_enum)]
        verify: Option<PolicyArg>,

        /// Public key of the archive's signer, as alg:hex
        #[arg(long)]
        public_key: Option<String>,
    },

    /// Re-hash and check every block reachable from the head
    Verify,

    /// Show store statistics
    Stats,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum PolicyArg {
    Off,
    Warn,
    Require,
}
