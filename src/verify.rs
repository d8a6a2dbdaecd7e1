//! Decide whether a parsed commit carries a signature from a trusted key.

use std::fmt;

use anyhow::{anyhow, Context, Result};
use sequoia_openpgp::packet::Signature;
use sequoia_openpgp::parse::Parse;
use sequoia_openpgp::{Packet, PacketPile};
use tracing::{debug, warn};

use crate::commit::{ParsedCommit, SignatureKind};
use crate::keys::KeyRegistry;
use crate::ssh::{SignedFiles, SshSignatureCheck};

/// Why a commit was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// No recognized signature header.
    Unsigned,
    /// The commit record could not be retrieved.
    Unreadable,
    /// The PGP signature could not be parsed.
    MalformedSignature,
    /// No trusted key matches the signer.
    KeyNotFound,
    /// A matching key was found, but the signature does not verify.
    CryptographicMismatch,
    /// No SSH candidate key validated the signature.
    ExternalToolMismatch,
    /// No SSH candidate key validated the signature, and the external
    /// tool failed to run for at least one of them.
    ExternalToolFailure,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unsigned => "commit is not signed",
            Self::Unreadable => "commit could not be read",
            Self::MalformedSignature => "signature could not be parsed",
            Self::KeyNotFound => "no trusted key matches the signer",
            Self::CryptographicMismatch => "signature does not verify",
            Self::ExternalToolMismatch => "no trusted SSH key validates the signature",
            Self::ExternalToolFailure => "ssh signature verification could not run",
        })
    }
}

/// Result of verifying one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Signed by a trusted key registered under `identity`.
    Verified { identity: String },
    /// Not verified.
    Rejected(Reason),
}

impl Outcome {
    /// Whether the commit was signed by a trusted key.
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }
}

/// Checks commit signatures against a [`KeyRegistry`].
pub struct SignatureVerifier<'a, C: ?Sized> {
    registry: &'a KeyRegistry,
    ssh: &'a C,
}

impl<'a, C> SignatureVerifier<'a, C>
where
    C: SshSignatureCheck + ?Sized,
{
    /// Create a verifier checking SSH signatures with `ssh`.
    pub fn new(registry: &'a KeyRegistry, ssh: &'a C) -> Self {
        Self { registry, ssh }
    }

    /// Verify a parsed commit. Every failure is folded into the returned
    /// [`Outcome`].
    pub fn verify(&self, commit: &ParsedCommit) -> Outcome {
        match commit.kind {
            SignatureKind::None => Outcome::Rejected(Reason::Unsigned),
            SignatureKind::Pgp => self.verify_pgp(&commit.signed_payload, &commit.signature),
            SignatureKind::Ssh => self.verify_ssh(&commit.signed_payload, &commit.signature),
        }
    }

    /// Only the first issuer named by the signature is looked up.
    fn verify_pgp(&self, payload: &str, signature: &str) -> Outcome {
        let signature = match parse_pgp_signature(signature) {
            Ok(signature) => signature,
            Err(e) => {
                warn!("Failed to parse PGP signature: {e:#}");
                return Outcome::Rejected(Reason::MalformedSignature);
            }
        };

        let Some(issuer) = signature.get_issuers().into_iter().next() else {
            debug!("PGP signature names no issuer");
            return Outcome::Rejected(Reason::KeyNotFound);
        };
        let Some((identity, cert)) = self.registry.find_pgp(&issuer) else {
            debug!("No trusted PGP key matches issuer {issuer}");
            return Outcome::Rejected(Reason::KeyNotFound);
        };

        let result = cert
            .keys()
            .find(|key| key.key().key_handle().aliases(&issuer))
            .ok_or_else(|| anyhow!("Key {issuer} vanished from its certificate"))
            .and_then(|key| signature.verify_message(key.key(), payload.as_bytes()));

        match result {
            Ok(()) => Outcome::Verified {
                identity: identity.to_owned(),
            },
            Err(e) => {
                debug!("PGP signature by {issuer} ({identity}) does not verify: {e:#}");
                Outcome::Rejected(Reason::CryptographicMismatch)
            }
        }
    }

    /// Every SSH key is tried in registry order until one validates the
    /// signature.
    fn verify_ssh(&self, payload: &str, signature: &str) -> Outcome {
        if self.registry.ssh_keys().next().is_none() {
            return Outcome::Rejected(Reason::KeyNotFound);
        }

        let files = match SignedFiles::new(payload, signature) {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to prepare SSH signature check: {e:#}");
                return Outcome::Rejected(Reason::ExternalToolFailure);
            }
        };

        let mut tool_failed = false;
        for (identity, key) in self.registry.ssh_keys() {
            debug!("Trying SSH key {} of {identity}", key.algorithm);
            match files.check_key(self.ssh, key) {
                Ok(true) => {
                    return Outcome::Verified {
                        identity: identity.to_owned(),
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("SSH signature check with a key of {identity} failed: {e:#}");
                    tool_failed = true;
                }
            }
        }

        Outcome::Rejected(if tool_failed {
            Reason::ExternalToolFailure
        } else {
            Reason::ExternalToolMismatch
        })
    }
}

/// Parse the first signature packet out of an (armored) PGP signature.
fn parse_pgp_signature(armored: &str) -> Result<Signature> {
    PacketPile::from_bytes(armored.as_bytes())
        .context("Failed to parse PGP packets")?
        .into_children()
        .find_map(|packet| match packet {
            Packet::Signature(signature) => Some(signature),
            _ => None,
        })
        .ok_or_else(|| anyhow!("No signature packet found"))
}
