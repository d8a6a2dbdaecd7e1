//! Repository access: raw commit records and commit selection.

#[cfg(test)]
use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use git2::{DiffOptions, Oid, Repository, RepositoryOpenFlags, Sort};

/// Something that can hand out the raw serialized record of a commit.
pub trait CommitSource {
    /// Return the raw record of the commit named by `rev`.
    fn raw_commit(&self, rev: &str) -> Result<String>;
}

impl CommitSource for Repository {
    fn raw_commit(&self, rev: &str) -> Result<String> {
        let commit = self
            .revparse_single(rev)
            .with_context(|| format!("Failed to look-up git revision {rev}"))?
            .peel_to_commit()
            .with_context(|| format!("Revision {rev} does not point to a commit"))?;
        let odb = self.odb().context("Failed to open the git object database")?;
        let object = odb
            .read(commit.id())
            .with_context(|| format!("Failed to read commit object {}", commit.id()))?;
        String::from_utf8(object.data().to_vec())
            .with_context(|| format!("Commit object {} is not valid UTF-8", commit.id()))
    }
}

#[cfg(test)]
impl CommitSource for HashMap<String, String> {
    fn raw_commit(&self, rev: &str) -> Result<String> {
        self.get(rev)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown commit {rev}"))
    }
}

/// Try to find and open a git repository.
pub fn open_repository() -> Result<Repository> {
    Repository::open_ext(
        ".",
        RepositoryOpenFlags::empty(),
        &[] as &[&std::ffi::OsStr],
    )
    .context("Failed to open git repository")
}

/// Return the commits reachable from `HEAD` but not from `base`, newest
/// first, optionally keeping only those that modify something under `path`.
pub fn select_commits(repo: &Repository, base: &str, path: Option<&Path>) -> Result<Vec<Oid>> {
    let base_oid = repo
        .revparse_single(base)
        .with_context(|| format!("Failed to look-up base reference {base}"))?
        .peel_to_commit()
        .with_context(|| format!("Base reference {base} does not point to a commit"))?
        .id();

    let mut walk = repo.revwalk().context("Failed to create revision walker")?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)
        .context("Failed to configure revision walker")?;
    walk.push_head().context("Failed to push HEAD to revision walker")?;
    walk.hide(base_oid)
        .with_context(|| format!("Failed to hide {base} from revision walker"))?;

    let mut selected = Vec::new();
    for oid in walk {
        let oid = oid.context("Failed to walk commit history")?;
        match path {
            Some(path) if !touches_path(repo, oid, path)? => continue,
            _ => selected.push(oid),
        }
    }
    Ok(selected)
}

/// Check whether the commit `oid` changes anything under `path`, compared
/// to its first parent (or to the empty tree for a root commit).
fn touches_path(repo: &Repository, oid: Oid, path: &Path) -> Result<bool> {
    let commit = repo
        .find_commit(oid)
        .with_context(|| format!("Failed to find commit {oid}"))?;
    let tree = commit
        .tree()
        .with_context(|| format!("Failed to find tree of commit {oid}"))?;
    let parent_tree = match commit.parents().next() {
        Some(parent) => Some(
            parent
                .tree()
                .with_context(|| format!("Failed to find tree of parent of {oid}"))?,
        ),
        None => None,
    };

    let mut opts = DiffOptions::new();
    opts.pathspec(path);
    let diff = repo
        .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))
        .with_context(|| format!("Failed to diff commit {oid}"))?;
    Ok(diff.deltas().next().is_some())
}
