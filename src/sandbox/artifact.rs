//! Read-only on-disk form of a submission.

use bytes::Bytes;
use std::fs;
use std::path::{Path, PathBuf};
use tar::{Builder, Header};
use tempfile::TempDir;

use super::SandboxError;
use crate::submission::Submission;

/// File name of the snippet inside its artifact directory.
pub(crate) const ARTIFACT_FILE: &str = "main.py";

/// A submission written to a private temp directory.
///
/// The file and directory are made read-only once written. Dropping the
/// artifact restores write permission on the directory and removes it.
#[derive(Debug)]
pub(crate) struct Artifact {
    dir: TempDir,
    id: String,
}

impl Artifact {
    /// Writes the submission's source to `<tmp>/execbox-XXXX/main.py`.
    pub(crate) fn materialize(submission: &Submission) -> Result<Self, SandboxError> {
        let dir = tempfile::Builder::new().prefix("execbox-").tempdir()?;
        let path = dir.path().join(ARTIFACT_FILE);
        fs::write(&path, submission.code())?;

        set_mode(&path, 0o444)?;
        set_mode(dir.path(), 0o555)?;

        Ok(Self {
            dir,
            id: submission.short_id(),
        })
    }

    /// Directory holding the artifact.
    pub(crate) fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Full path of the snippet file.
    pub(crate) fn path(&self) -> PathBuf {
        self.dir.path().join(ARTIFACT_FILE)
    }

    /// Name used when the artifact is copied somewhere shared.
    pub(crate) fn unique_name(&self) -> String {
        format!("snippet-{}.py", self.id)
    }

    /// Packs the snippet into a tar archive holding a single read-only entry
    /// named [`Artifact::unique_name`].
    pub(crate) fn to_tar(&self) -> Result<Bytes, SandboxError> {
        let content = fs::read(self.path())?;

        let mut header = Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o444);
        header.set_cksum();

        let mut tar_buf = Vec::new();
        {
            let mut tar = Builder::new(&mut tar_buf);
            tar.append_data(&mut header, self.unique_name(), content.as_slice())?;
            tar.finish()?;
        }
        Ok(Bytes::from(tar_buf))
    }
}

impl Drop for Artifact {
    fn drop(&mut self) {
        // TempDir cannot delete entries of a read-only directory.
        let _ = set_mode(self.dir.path(), 0o755);
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)
}
