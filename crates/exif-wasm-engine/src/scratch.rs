use crate::{Error, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Slot the host stages a source file into before a call.
pub const INPUT_SLOT: &str = "input";
/// Slot the guest writes a rewritten file into.
pub const OUTPUT_SLOT: &str = "output";

const SCRATCH_DIR: &str = "scratch";
const DEVICE_DIR: &str = "dev";
const NULL_DEVICE: &str = "null";

/// Private host directory tree exposed to the guest as its filesystem.
///
/// ```text
/// <tmp>/exiftool-wasm-XXXX/
///   scratch/        mounted read/write at the scratch mount (`/tmp`)
///     input         staged source file (per call)
///     output        file written by the guest (per call)
///   dev/            mounted read-only at the device mount (`/dev`)
///     null          empty file
/// ```
#[derive(Debug)]
pub struct ScratchFilesystem {
    dir: Option<TempDir>,
    root: PathBuf,
    scratch_mount: String,
}

impl ScratchFilesystem {
    /// Create the directory tree under the system temp directory.
    pub fn create(scratch_mount: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("exiftool-wasm-")
            .tempdir()
            .map_err(|e| Error::Resource(format!("failed to create scratch directory: {e}")))?;
        let root = dir.path().to_path_buf();

        let scratch = Self {
            dir: Some(dir),
            root,
            scratch_mount: scratch_mount.trim_end_matches('/').to_string(),
        };

        fs::create_dir_all(scratch.scratch_dir()).map_err(|e| {
            Error::Resource(format!(
                "failed to create {}: {e}",
                scratch.scratch_dir().display()
            ))
        })?;
        fs::create_dir_all(scratch.device_dir()).map_err(|e| {
            Error::Resource(format!("failed to create {}: {e}", scratch.device_dir().display()))
        })?;
        let null = scratch.device_dir().join(NULL_DEVICE);
        fs::write(&null, b"").map_err(|e| {
            Error::Resource(format!("failed to create {}: {e}", null.display()))
        })?;

        tracing::debug!(root = %scratch.root.display(), "created scratch filesystem");
        Ok(scratch)
    }

    /// Root of the backing directory tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host directory mounted at the scratch mount.
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join(SCRATCH_DIR)
    }

    /// Host directory mounted at the device mount.
    pub fn device_dir(&self) -> PathBuf {
        self.root.join(DEVICE_DIR)
    }

    /// Host path of a slot.
    pub fn host_path(&self, slot: &str) -> PathBuf {
        self.scratch_dir().join(slot)
    }

    /// Path of a slot as the guest sees it.
    pub fn guest_path(&self, slot: &str) -> String {
        format!("{}/{slot}", self.scratch_mount)
    }

    /// Write `bytes` into a slot. The file is removed when the guard drops.
    pub fn stage(&self, slot: &str, bytes: &[u8]) -> io::Result<StagedFile> {
        let staged = StagedFile::claim(self.host_path(slot));
        fs::write(staged.path(), bytes)?;
        Ok(staged)
    }

    /// Claim a slot the guest is expected to fill. The file, if any, is
    /// removed when the guard drops.
    pub fn claim(&self, slot: &str) -> StagedFile {
        StagedFile::claim(self.host_path(slot))
    }

    /// Recursively remove the backing tree. Calling it again is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => {
                tracing::debug!(root = %self.root.display(), "removing scratch filesystem");
                dir.close()
            }
            None => Ok(()),
        }
    }

    /// Whether `close` has already run.
    pub fn is_closed(&self) -> bool {
        self.dir.is_none()
    }
}

/// A per-call file in the scratch tree, removed on drop.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    fn claim(path: PathBuf) -> Self {
        Self { path }
    }

    /// Host path of the staged file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file's current contents.
    pub fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove staged file");
            }
        }
    }
}
