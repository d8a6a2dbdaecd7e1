//! Generate shell completions.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::aot::{generate, generate_to, Shell};
use tracing::info;

use super::Args;

const BIN_NAME: &str = "git-sigcheck";

/// Execute the `shell-completions` command, writing to stdout unless an
/// output directory is given.
pub fn command(shell: Shell, out_dir: Option<PathBuf>) -> Result<()> {
    let mut cmd = Args::command();
    match out_dir {
        Some(dir) => {
            let path = generate_to(shell, &mut cmd, BIN_NAME, &dir).with_context(|| {
                format!("Failed to write {shell} completions to {}", dir.display())
            })?;
            info!("Wrote completions to {}", path.display());
        }
        None => generate(shell, &mut cmd, BIN_NAME, &mut io::stdout()),
    }
    Ok(())
}
