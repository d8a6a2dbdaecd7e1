mod batch;
mod commit;
mod keys;
mod repo;
mod shell_completions;
mod ssh;
mod verify;

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// A git sub-command to check that commits are signed by trusted keys
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Increase logging verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// The action to execute
    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Verify that commits carry a PGP or SSH signature from a trusted key
    Verify {
        /// Trusted public key files, or directories holding them
        #[arg(
            short = 'k',
            long = "key",
            env = "GIT_TRUSTED_KEYS",
            value_delimiter = ',',
            required = true
        )]
        keys: Vec<PathBuf>,

        /// Verify the commits reachable from HEAD but not from this revision
        #[arg(short, long, env = "GIT_VERIFY_BASE", conflicts_with = "commits")]
        base: Option<String>,

        /// Only verify commits touching this path
        #[arg(short, long, env = "GIT_VERIFY_PATH", requires = "base")]
        path: Option<PathBuf>,

        /// The ssh-keygen program used to check SSH signatures
        #[arg(long, env = "SSH_KEYGEN", default_value = "ssh-keygen")]
        ssh_keygen: PathBuf,

        /// The git revisions to verify (defaults to HEAD)
        commits: Vec<String>,
    },
    /// Print the signed payload of a commit
    Parse {
        /// Print the embedded signature instead
        #[arg(short, long)]
        signature: bool,

        /// The git revision to parse
        git_rev: String,
    },
    /// List the identities found in trusted public keys
    Keys {
        /// Trusted public key files, or directories holding them
        #[arg(
            short = 'k',
            long = "key",
            env = "GIT_TRUSTED_KEYS",
            value_delimiter = ',',
            required = true
        )]
        keys: Vec<PathBuf>,
    },
    /// Generate shell completions
    ShellCompletions {
        /// Write the completion script into this directory
        #[arg(short, long)]
        out_dir: Option<PathBuf>,

        /// The shell to generate completions for
        shell: clap_complete::aot::Shell,
    },
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(action: Action) -> Result<()> {
    match action {
        Action::Verify {
            keys,
            base,
            path,
            ssh_keygen,
            commits,
        } => {
            let selection = match base {
                Some(base) => batch::Selection::Since { base, path },
                None => batch::Selection::Explicit(commits),
            };
            batch::command(keys, selection, ssh_keygen)
        }
        Action::Parse { signature, git_rev } => commit::command(git_rev, signature),
        Action::Keys { keys } => keys::command(keys),
        Action::ShellCompletions { shell, out_dir } => shell_completions::command(shell, out_dir),
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args.action) {
        error!("{e:#}");
        std::process::exit(1);
    }
}
