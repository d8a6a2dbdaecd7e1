//! Verification of SSH signatures through `ssh-keygen -Y verify`.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

use crate::keys::SshPublicKey;

/// Namespace git signs commits under.
pub const NAMESPACE: &str = "git";

/// Principal the candidate key is written under in the allowed signers file.
const PRINCIPAL: &str = "git-sigcheck";

/// An external primitive able to tell whether an SSH signature was made by
/// the key listed in an allowed signers file.
pub trait SshSignatureCheck {
    /// Return `Ok(true)` if `signature` over the contents of `payload` was
    /// made by the key in `allowed_signers` under `principal`, `Ok(false)`
    /// if it was not, and an error if the primitive itself could not run.
    fn check(
        &self,
        allowed_signers: &Path,
        principal: &str,
        signature: &Path,
        payload: &Path,
    ) -> Result<bool>;
}

/// The `ssh-keygen` program.
#[derive(Debug, Clone)]
pub struct SshKeygen {
    program: PathBuf,
}

impl SshKeygen {
    /// Use the `ssh-keygen` binary at `program`, looked up in `PATH` when
    /// it is a bare name.
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl SshSignatureCheck for SshKeygen {
    fn check(
        &self,
        allowed_signers: &Path,
        principal: &str,
        signature: &Path,
        payload: &Path,
    ) -> Result<bool> {
        let stdin = File::open(payload).context("Failed to open signed payload")?;
        let exit_code = Command::new(&self.program)
            .arg("-Y")
            .arg("verify")
            .arg("-f")
            .arg(allowed_signers)
            .arg("-I")
            .arg(principal)
            .arg("-n")
            .arg(NAMESPACE)
            .arg("-s")
            .arg(signature)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program.display()))?
            .wait()
            .with_context(|| format!("Failed to wait for {}", self.program.display()))?;
        Ok(exit_code.success())
    }
}

/// The payload and signature of one commit, written to temporary files
/// that are removed when this value is dropped.
pub struct SignedFiles {
    payload: NamedTempFile,
    signature: NamedTempFile,
}

impl SignedFiles {
    /// Write `payload` and `signature` to fresh temporary files.
    pub fn new(payload: &str, signature: &str) -> Result<Self> {
        Ok(Self {
            payload: write_temp(payload).context("Failed to write signed payload")?,
            signature: write_temp(signature).context("Failed to write signature")?,
        })
    }

    /// Check the signature against one candidate key. The allowed signers
    /// file for the candidate only lives for the duration of this call.
    pub fn check_key<C>(&self, tool: &C, key: &SshPublicKey) -> Result<bool>
    where
        C: SshSignatureCheck + ?Sized,
    {
        let allowed_signers = write_temp(&format!("{PRINCIPAL} {}\n", key.to_openssh()))
            .context("Failed to write allowed signers file")?;
        tool.check(
            allowed_signers.path(),
            PRINCIPAL,
            self.signature.path(),
            self.payload.path(),
        )
    }
}

fn write_temp(contents: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new().context("Failed to create temporary file")?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("Failed to write {}", file.path().display()))?;
    Ok(file)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::fs;

    use crate::keys::tests::ssh_key_line;

    /// A fake primitive accepting exactly one key, remembering every
    /// file it was handed.
    #[derive(Default)]
    pub(crate) struct FakeCheck {
        pub(crate) accepted_key: Option<String>,
        pub(crate) fail_on: Option<String>,
        pub(crate) seen: RefCell<Vec<(PathBuf, PathBuf, PathBuf)>>,
    }

    impl FakeCheck {
        pub(crate) fn accepting(key: &SshPublicKey) -> Self {
            Self {
                accepted_key: Some(key.to_openssh()),
                ..Self::default()
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.seen.borrow().len()
        }
    }

    impl SshSignatureCheck for FakeCheck {
        fn check(
            &self,
            allowed_signers: &Path,
            principal: &str,
            signature: &Path,
            payload: &Path,
        ) -> Result<bool> {
            self.seen.borrow_mut().push((
                allowed_signers.to_path_buf(),
                signature.to_path_buf(),
                payload.to_path_buf(),
            ));
            let allowed = fs::read_to_string(allowed_signers)?;
            let key = allowed
                .trim_end()
                .strip_prefix(&format!("{principal} "))
                .ok_or_else(|| anyhow::anyhow!("principal missing from {allowed:?}"))?;
            if self.fail_on.as_deref() == Some(key) {
                anyhow::bail!("tool crashed");
            }
            Ok(self.accepted_key.as_deref() == Some(key))
        }
    }

    #[test]
    fn candidate_files_are_removed_after_each_check() {
        let key = SshPublicKey::parse(&ssh_key_line(7, "dave")).unwrap();
        let tool = FakeCheck::accepting(&key);
        let files = SignedFiles::new("payload", "signature").unwrap();

        assert!(files.check_key(&tool, &key).unwrap());
        let (allowed, signature, payload) = tool.seen.borrow()[0].clone();
        assert!(!allowed.exists());
        assert_eq!(fs::read_to_string(&signature).unwrap(), "signature");
        assert_eq!(fs::read_to_string(&payload).unwrap(), "payload");

        drop(files);
        assert!(!signature.exists());
        assert!(!payload.exists());
    }

    #[test]
    fn missing_program_is_an_error() {
        let key = SshPublicKey::parse(&ssh_key_line(8, "erin")).unwrap();
        let files = SignedFiles::new("payload", "signature").unwrap();
        let tool = SshKeygen::new("/nonexistent/ssh-keygen");

        assert!(files.check_key(&tool, &key).is_err());
    }
}
