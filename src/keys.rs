//! Trusted public keys, indexed by the identities they are registered under.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use sequoia_openpgp::cert::CertParser;
use sequoia_openpgp::parse::Parse;
use sequoia_openpgp::{Cert, KeyHandle};
use sha2::{Digest, Sha256};

/// Marker identifying an armored PGP public key block.
const PGP_PUBLIC_KEY_MARKER: &str = "-----BEGIN PGP PUBLIC KEY BLOCK-----";

/// Identity used for SSH keys without a comment.
pub const DEFAULT_SSH_IDENTITY: &str = "unknown";

/// Enumeration of the supported key formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// OpenPGP certificate.
    Pgp,
    /// OpenSSH public key.
    Ssh,
}

/// Public key used to verify signed commits.
#[derive(Debug, Clone)]
pub enum PublicKey {
    /// OpenPGP certificate, shared between all of its user ids.
    Pgp(Arc<Cert>),
    /// OpenSSH public key.
    Ssh(SshPublicKey),
}

impl PublicKey {
    /// Return the format of this key.
    pub fn kind(&self) -> KeyKind {
        match self {
            Self::Pgp(_) => KeyKind::Pgp,
            Self::Ssh(_) => KeyKind::Ssh,
        }
    }

    /// Fingerprint of this key, as printed by `gpg --fingerprint` or
    /// `ssh-keygen -l`.
    pub fn fingerprint(&self) -> String {
        match self {
            Self::Pgp(cert) => cert.fingerprint().to_hex(),
            Self::Ssh(key) => format!("{} {}", key.algorithm, key.fingerprint()),
        }
    }
}

/// An OpenSSH public key, as found in `id_*.pub` files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshPublicKey {
    /// Algorithm name, e.g. `ssh-ed25519`.
    pub algorithm: String,
    /// Decoded wire-format key blob.
    pub blob: Vec<u8>,
    /// Trailing comment, if any.
    pub comment: Option<String>,
}

impl SshPublicKey {
    /// Parse a single `algorithm base64 [comment]` line. Fields may be
    /// separated by any run of blanks.
    pub fn parse(line: &str) -> Result<Self> {
        let Some((algorithm, rest)) = line.trim().split_once(char::is_whitespace) else {
            bail!("Unknown key format");
        };
        let rest = rest.trim_start();
        let (encoded, comment) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let blob = STANDARD
            .decode(encoded)
            .context("Failed to decode SSH public key")?;

        let embedded = blob
            .get(..4)
            .map(|len| u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize)
            .and_then(|len| blob.get(4..4 + len))
            .ok_or_else(|| anyhow!("Truncated SSH public key blob"))?;
        if embedded != algorithm.as_bytes() {
            bail!(
                "SSH key type {algorithm} does not match its blob ({})",
                String::from_utf8_lossy(embedded)
            );
        }

        let comment = Some(comment.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_owned);

        Ok(Self {
            algorithm: algorithm.to_owned(),
            blob,
            comment,
        })
    }

    /// Render the key as `algorithm base64`, without comment.
    pub fn to_openssh(&self) -> String {
        format!("{} {}", self.algorithm, STANDARD.encode(&self.blob))
    }

    /// The `SHA256:` fingerprint of the key blob.
    pub fn fingerprint(&self) -> String {
        format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(&self.blob)))
    }

    /// The identity this key is registered under.
    pub fn identity(&self) -> &str {
        self.comment.as_deref().unwrap_or(DEFAULT_SSH_IDENTITY)
    }
}

/// Determine the format of the given key data.
fn determine_key_format(key_data: &str) -> KeyKind {
    if key_data.contains(PGP_PUBLIC_KEY_MARKER) {
        KeyKind::Pgp
    } else {
        KeyKind::Ssh
    }
}

/// Trusted keys grouped by identity. Identities keep their insertion
/// order, and so do the keys of each identity.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    identities: Vec<(String, Vec<PublicKey>)>,
    index: HashMap<String, usize>,
}

impl KeyRegistry {
    /// Build a registry out of raw key materials. Any material that is
    /// neither a PGP public key block nor an SSH public key is an error.
    pub fn build<I, S>(materials: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self::default();
        for material in materials {
            registry.add(material.as_ref())?;
        }
        Ok(registry)
    }

    /// Load the registry from key files. Directories are expanded to the
    /// files they contain.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let mut registry = Self::default();
        for (path, material) in read_key_materials(paths)? {
            registry
                .add(&material)
                .with_context(|| format!("Failed to load key file {}", path.display()))?;
        }
        Ok(registry)
    }

    /// Classify one key material and register its keys.
    pub fn add(&mut self, material: &str) -> Result<()> {
        match determine_key_format(material) {
            KeyKind::Pgp => {
                let mut found = false;
                for cert in CertParser::from_bytes(material.as_bytes())
                    .context("Failed to parse PGP public key block")?
                {
                    let cert = Arc::new(cert.context("Failed to parse PGP certificate")?);
                    for user_id in cert.userids() {
                        let identity = String::from_utf8_lossy(user_id.userid().value());
                        self.insert(identity.into_owned(), PublicKey::Pgp(Arc::clone(&cert)));
                    }
                    found = true;
                }
                if !found {
                    bail!("PGP public key block contains no certificate");
                }
            }
            KeyKind::Ssh => {
                let mut found = false;
                for line in material.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let key = SshPublicKey::parse(line)?;
                    self.insert(key.identity().to_owned(), PublicKey::Ssh(key));
                    found = true;
                }
                if !found {
                    bail!("Unknown key format");
                }
            }
        }
        Ok(())
    }

    fn insert(&mut self, identity: String, key: PublicKey) {
        match self.index.get(&identity) {
            Some(&slot) => self.identities[slot].1.push(key),
            None => {
                self.index.insert(identity.clone(), self.identities.len());
                self.identities.push((identity, vec![key]));
            }
        }
    }

    /// Iterate over all identities and their keys.
    pub fn identities(&self) -> impl Iterator<Item = (&str, &[PublicKey])> {
        self.identities
            .iter()
            .map(|(identity, keys)| (identity.as_str(), keys.as_slice()))
    }

    /// Iterate over all PGP certificates, along with their identity.
    pub fn pgp_keys(&self) -> impl Iterator<Item = (&str, &Cert)> {
        self.identities().flat_map(|(identity, keys)| {
            keys.iter().filter_map(move |key| match key {
                PublicKey::Pgp(cert) => Some((identity, cert.as_ref())),
                PublicKey::Ssh(_) => None,
            })
        })
    }

    /// Iterate over all SSH keys, along with their identity.
    pub fn ssh_keys(&self) -> impl Iterator<Item = (&str, &SshPublicKey)> {
        self.identities().flat_map(|(identity, keys)| {
            keys.iter().filter_map(move |key| match key {
                PublicKey::Ssh(key) => Some((identity, key)),
                PublicKey::Pgp(_) => None,
            })
        })
    }

    /// Find the first certificate holding a (sub)key that matches `issuer`.
    pub fn find_pgp(&self, issuer: &KeyHandle) -> Option<(&str, &Cert)> {
        self.pgp_keys().find(|(_, cert)| {
            cert.keys()
                .any(|key| key.key().key_handle().aliases(issuer))
        })
    }

    /// Check whether no key at all was registered.
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// Read the contents of every key file under `paths`.
pub fn read_key_materials(paths: &[PathBuf]) -> Result<Vec<(PathBuf, String)>> {
    let mut materials = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut entries = fs::read_dir(path)
                .with_context(|| format!("Failed to read key directory {}", path.display()))?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("Failed to list key directory {}", path.display()))?;
            entries.sort();
            for entry in entries.into_iter().filter(|p| p.is_file()) {
                let material = read_key_file(&entry)?;
                materials.push((entry, material));
            }
        } else {
            materials.push((path.clone(), read_key_file(path)?));
        }
    }
    Ok(materials)
}

fn read_key_file(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .with_context(|| format!("Failed to read public key {}", path.display()))
}

/// Execute the `keys` command.
pub fn command(key_paths: Vec<PathBuf>) -> Result<()> {
    let registry = KeyRegistry::load(&key_paths)?;
    for (identity, keys) in registry.identities() {
        println!("{identity}:");
        for key in keys {
            let kind = match key.kind() {
                KeyKind::Pgp => "pgp",
                KeyKind::Ssh => "ssh",
            };
            println!("  - {kind} {}", key.fingerprint());
        }
    }
    Ok(())
}
