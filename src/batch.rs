//! Verify a batch of commits and reduce the outcomes to a single verdict.

use std::path::PathBuf;

use anyhow::{bail, Result};
use tracing::{error, info, warn};

use crate::commit::ParsedCommit;
use crate::keys::KeyRegistry;
use crate::repo::{self, CommitSource};
use crate::ssh::{SshKeygen, SshSignatureCheck};
use crate::verify::{Outcome, Reason, SignatureVerifier};

/// Outcome of one commit in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub commit: String,
    pub outcome: Outcome,
}

/// Outcomes of a whole batch, in input order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: Vec<CommitOutcome>,
}

impl BatchReport {
    /// Whether every commit in the batch was verified.
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_verified())
    }

    /// The commits that were not verified.
    pub fn failures(&self) -> impl Iterator<Item = &CommitOutcome> {
        self.results.iter().filter(|r| !r.outcome.is_verified())
    }
}

/// Verify every commit in `commits`, in order. A failure on one commit
/// never prevents the others from being checked.
pub fn run<S, C>(commits: &[String], source: &S, registry: &KeyRegistry, ssh: &C) -> BatchReport
where
    S: CommitSource + ?Sized,
    C: SshSignatureCheck + ?Sized,
{
    let verifier = SignatureVerifier::new(registry, ssh);

    let results = commits
        .iter()
        .map(|commit| {
            let outcome = match source.raw_commit(commit) {
                Ok(record) => verifier.verify(&ParsedCommit::parse(&record)),
                Err(e) => {
                    warn!("{e:#}");
                    Outcome::Rejected(Reason::Unreadable)
                }
            };
            match &outcome {
                Outcome::Verified { identity } => {
                    info!("Commit {commit} is signed by {identity}")
                }
                Outcome::Rejected(reason) => error!("Commit {commit}: {reason}"),
            }
            CommitOutcome {
                commit: commit.clone(),
                outcome,
            }
        })
        .collect();

    BatchReport { results }
}

/// Which commits the `verify` command checks.
pub enum Selection {
    /// An explicit list of revisions.
    Explicit(Vec<String>),
    /// Commits reachable from `HEAD` but not from `base`.
    Since {
        base: String,
        path: Option<PathBuf>,
    },
}

/// Execute the `verify` command.
pub fn command(key_paths: Vec<PathBuf>, selection: Selection, ssh_keygen: PathBuf) -> Result<()> {
    let registry = KeyRegistry::load(&key_paths)?;
    if registry.is_empty() {
        warn!("No identity was found in the trusted keys");
    }

    let repo = repo::open_repository()?;
    let commits = match selection {
        Selection::Explicit(revs) if revs.is_empty() => vec!["HEAD".to_owned()],
        Selection::Explicit(revs) => revs,
        Selection::Since { base, path } => {
            repo::select_commits(&repo, &base, path.as_deref())?
                .into_iter()
                .map(|oid| oid.to_string())
                .collect()
        }
    };
    if commits.is_empty() {
        info!("No commits to verify");
        return Ok(());
    }

    let report = run(&commits, &repo, &registry, &SshKeygen::new(ssh_keygen));
    if !report.passed() {
        let failed: Vec<_> = report.failures().map(|r| r.commit.as_str()).collect();
        bail!(
            "{} of {} commits failed signature verification: {}",
            failed.len(),
            report.results.len(),
            failed.join(", ")
        );
    }
    info!("All {} commits are signed by trusted keys", report.results.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use git2::Repository;

    use crate::keys::tests::{armored, generate_cert, ssh_key_line};
    use crate::keys::SshPublicKey;
    use crate::repo::tests::commit_file;
    use crate::ssh::tests::FakeCheck;
    use crate::verify::tests::sign;

    const HEADERS: &str = "tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
                           author A U Thor <author@example.com> 1700000000 +0000\n\
                           committer A U Thor <author@example.com> 1700000000 +0000";

    /// Lay out a commit record the way git does, embedding `signature`
    /// as a continued header.
    fn signed_record(signature: &str, message: &str) -> String {
        let continued = signature.trim_end().replace('\n', "\n ");
        format!("{HEADERS}\ngpgsig {continued}\n\n{message}")
    }

    /// The payload the parser extracts from [`signed_record`].
    fn signed_payload(message: &str) -> String {
        format!("{HEADERS}\n\n\n{message}")
    }

    #[test]
    fn one_bad_commit_fails_the_batch_but_not_the_others() {
        let cert = generate_cert(&["alice@example.com"]);
        let registry = KeyRegistry::build([armored(&cert)]).unwrap();
        let tool = FakeCheck::default();

        let mut source = HashMap::new();
        for (id, message) in [("c1", "first\n"), ("c3", "third\n")] {
            let signature = sign(&cert, &signed_payload(message));
            source.insert(id.to_owned(), signed_record(&signature, message));
        }
        let signature = sign(&cert, &signed_payload("original\n"));
        source.insert("c2".to_owned(), signed_record(&signature, "corrupted\n"));

        let commits: Vec<_> = ["c1", "c2", "c3"].map(str::to_owned).into();
        let report = run(&commits, &source, &registry, &tool);

        assert_eq!(
            report
                .results
                .iter()
                .map(|r| (r.commit.as_str(), r.outcome.is_verified()))
                .collect::<Vec<_>>(),
            [("c1", true), ("c2", false), ("c3", true)]
        );
        assert_eq!(
            report.results[1].outcome,
            Outcome::Rejected(Reason::CryptographicMismatch)
        );
        assert!(!report.passed());
        assert_eq!(
            report.failures().map(|r| r.commit.as_str()).collect::<Vec<_>>(),
            ["c2"]
        );

        let good: Vec<_> = ["c1", "c3"].map(str::to_owned).into();
        assert!(run(&good, &source, &registry, &tool).passed());
    }

    #[test]
    fn unsigned_and_missing_commits_are_rejected() {
        let registry = KeyRegistry::default();
        let tool = FakeCheck::default();
        let mut source = HashMap::new();
        source.insert("plain".to_owned(), format!("{HEADERS}\n\nmsg\n"));

        let commits: Vec<_> = ["plain", "gone"].map(str::to_owned).into();
        let results = run(&commits, &source, &registry, &tool).results;

        assert_eq!(results[0].outcome, Outcome::Rejected(Reason::Unsigned));
        assert_eq!(results[1].outcome, Outcome::Rejected(Reason::Unreadable));
    }

    #[test]
    fn mixed_schemes_in_one_batch() {
        let cert = generate_cert(&["pgp-user"]);
        let ssh_line = ssh_key_line(9, "ssh-user");
        let registry = KeyRegistry::build([armored(&cert), ssh_line.clone()]).unwrap();
        let tool = FakeCheck::accepting(&SshPublicKey::parse(&ssh_line).unwrap());

        let mut source = HashMap::new();
        let signature = sign(&cert, &signed_payload("pgp\n"));
        source.insert("pgp".to_owned(), signed_record(&signature, "pgp\n"));
        source.insert(
            "ssh".to_owned(),
            signed_record(
                "-----BEGIN SSH SIGNATURE-----\nU1NIU0lH\n-----END SSH SIGNATURE-----\n",
                "ssh\n",
            ),
        );

        let commits: Vec<_> = ["pgp", "ssh"].map(str::to_owned).into();
        let results = run(&commits, &source, &registry, &tool).results;

        assert_eq!(
            results[0].outcome,
            Outcome::Verified {
                identity: "pgp-user".to_owned()
            }
        );
        assert_eq!(
            results[1].outcome,
            Outcome::Verified {
                identity: "ssh-user".to_owned()
            }
        );
        assert_eq!(tool.calls(), 1);
    }

    #[test]
    fn unsigned_repository_commits_fail() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let oid = commit_file(&repo, "README", "hello\n", "Initial commit\n");
        let registry = KeyRegistry::build([ssh_key_line(1, "nobody")]).unwrap();
        let tool = FakeCheck::default();

        let commits = vec![oid.to_string(), "HEAD".to_owned()];
        let results = run(&commits, &repo, &registry, &tool).results;

        assert!(results
            .iter()
            .all(|r| r.outcome == Outcome::Rejected(Reason::Unsigned)));
        assert_eq!(tool.calls(), 0);
    }
}
