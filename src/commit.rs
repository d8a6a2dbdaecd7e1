//! Split a raw commit record into the payload that was signed and the
//! signature embedded in its header.

use anyhow::Result;

use crate::repo::{self, CommitSource};

/// Header introducing an armored PGP signature.
const PGP_SIGNATURE_HEADER: &str = "gpgsig -----BEGIN PGP SIGNATURE-----";

/// Header introducing an armored SSH signature.
const SSH_SIGNATURE_HEADER: &str = "gpgsig -----BEGIN SSH SIGNATURE-----";

/// Name of the header field carrying the signature.
const SIGNATURE_FIELD: &str = "gpgsig";

/// Signature scheme used by a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    None,
    Pgp,
    Ssh,
}

/// A commit record split into its signed and signature parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommit {
    /// The record with the signature header block collapsed into
    /// a single empty line.
    pub signed_payload: String,
    /// The reassembled signature, one line per header line.
    pub signature: String,
    /// The scheme announced by the signature header.
    pub kind: SignatureKind,
}

enum State {
    Scanning,
    InSignatureContinuation,
    Done,
}

impl ParsedCommit {
    /// Parse a raw commit record. This never fails: a record without a
    /// signature header yields [`SignatureKind::None`] and a payload equal
    /// to the record itself.
    pub fn parse(record: &str) -> Self {
        let mut state = State::Scanning;
        let mut kind = SignatureKind::None;
        let mut payload: Vec<&str> = Vec::new();
        let mut signature: Vec<&str> = Vec::new();

        for line in record.split('\n') {
            match state {
                State::Scanning => {
                    kind = if line.starts_with(PGP_SIGNATURE_HEADER) {
                        SignatureKind::Pgp
                    } else if line.starts_with(SSH_SIGNATURE_HEADER) {
                        SignatureKind::Ssh
                    } else {
                        payload.push(line);
                        continue;
                    };
                    let inline = &line[SIGNATURE_FIELD.len()..];
                    if let Some(value) = inline.strip_prefix(' ') {
                        signature.push(value);
                    }
                    payload.push("");
                    state = State::InSignatureContinuation;
                }
                State::InSignatureContinuation => match line.strip_prefix(' ') {
                    Some(continuation) => signature.push(continuation),
                    None => {
                        payload.push(line);
                        state = State::Done;
                    }
                },
                State::Done => payload.push(line),
            }
        }

        let signature = if signature.is_empty() {
            String::new()
        } else {
            let mut joined = signature.join("\n");
            joined.push('\n');
            joined
        };

        Self {
            signed_payload: payload.join("\n"),
            signature,
            kind,
        }
    }
}

/// Execute the `parse` command.
pub fn command(rev: String, print_signature: bool) -> Result<()> {
    let repo = repo::open_repository()?;
    let record = repo.raw_commit(&rev)?;
    let parsed = ParsedCommit::parse(&record);

    if print_signature {
        match parsed.kind {
            SignatureKind::None => anyhow::bail!("Commit {rev} is not signed"),
            _ => print!("{}", parsed.signature),
        }
    } else {
        print!("{}", parsed.signed_payload);
    }
    Ok(())
}
