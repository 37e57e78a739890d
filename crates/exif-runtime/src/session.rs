use crate::record::{MetadataRecord, WriteStatus};
use crate::{script, Error, Result};
use exif_wasm_engine::{EngineConfig, GuestInstance, ScratchFilesystem, INPUT_SLOT, OUTPUT_SLOT};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// A metadata session backed by one sandboxed ExifTool guest.
///
/// The session is `Send + Sync`. Calls from several threads are serialized:
/// each operation holds the session lock from staging its input until the
/// scratch slots are cleaned up. Independent sessions run in parallel.
pub struct ExifTool {
    guest: Mutex<Option<GuestInstance>>,
}

impl ExifTool {
    /// Start a session with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(&EngineConfig::default())
    }

    /// Start a session, resolving the guest module from `config`.
    pub fn with_config(config: &EngineConfig) -> Result<Self> {
        let guest = GuestInstance::new(config)?;
        log::debug!("exiftool session started");
        Ok(Self::from_guest(guest))
    }

    /// Start a session from guest module bytes already in memory.
    pub fn from_module_bytes(module_bytes: &[u8], config: &EngineConfig) -> Result<Self> {
        let scratch = ScratchFilesystem::create(&config.scratch_mount)?;
        let guest = GuestInstance::instantiate(module_bytes, scratch, config)?;
        Ok(Self::from_guest(guest))
    }

    fn from_guest(guest: GuestInstance) -> Self {
        Self {
            guest: Mutex::new(Some(guest)),
        }
    }

    /// Read all metadata from the file at `path`.
    pub fn read_metadata(&self, path: impl AsRef<Path>) -> Result<MetadataRecord> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| Error::file("read source file", path, e))?;

        self.with_guest(|guest| {
            let _input = stage_input(guest, &bytes)?;
            let program = script::read_metadata(&guest.scratch().guest_path(INPUT_SLOT));
            let output = guest.evaluate(&program)?;
            log::debug!("read {}: {} bytes of metadata", path.display(), output.len());
            MetadataRecord::from_guest_output(&output)
        })
    }

    /// Write `tags` to a copy of `src`, saved at `dst`.
    ///
    /// With `dst` unset or empty the source file is rewritten in place. When
    /// ExifTool rejects the write, `dst` is left untouched.
    pub fn write_metadata(
        &self,
        src: impl AsRef<Path>,
        dst: Option<&Path>,
        tags: &Map<String, Value>,
    ) -> Result<WriteStatus> {
        let src = src.as_ref();
        let dst = match dst {
            Some(dst) if !dst.as_os_str().is_empty() => dst,
            _ => src,
        };

        let bytes = fs::read(src).map_err(|e| Error::file("read source file", src, e))?;
        let tags_json = serde_json::to_string(tags)?;

        let (status, written) = self.with_guest(|guest| {
            let _input = stage_input(guest, &bytes)?;
            let output_slot = guest.scratch().claim(OUTPUT_SLOT);
            let program = script::write_metadata(
                &guest.scratch().guest_path(INPUT_SLOT),
                &guest.scratch().guest_path(OUTPUT_SLOT),
                &tags_json,
            );

            let stdout = guest.evaluate(&program)?;
            let status = WriteStatus::from_guest_output(&stdout, guest.last_stderr())?;
            if status == WriteStatus::WrittenWithWarnings {
                log::warn!(
                    "exiftool reported warnings writing {}: {}",
                    src.display(),
                    guest.last_stderr().trim()
                );
            }

            let written = output_slot
                .read()
                .map_err(|e| Error::file("read rewritten file", output_slot.path(), e))?;
            Ok((status, written))
        })?;

        fs::write(dst, &written).map_err(|e| Error::file("write destination file", dst, e))?;
        log::debug!("wrote {} tags to {}", tags.len(), dst.display());
        Ok(status)
    }

    /// Write a single tag. See [`write_metadata`](Self::write_metadata).
    pub fn set_tag(
        &self,
        src: impl AsRef<Path>,
        dst: Option<&Path>,
        tag: &str,
        value: impl Into<Value>,
    ) -> Result<WriteStatus> {
        let mut tags = Map::new();
        tags.insert(tag.to_string(), value.into());
        self.write_metadata(src, dst, &tags)
    }

    /// Version of the bundled ExifTool library.
    pub fn version(&self) -> Result<String> {
        let output = self.with_guest(|guest| Ok(guest.evaluate(script::VERSION)?))?;
        Ok(output.trim().to_string())
    }

    /// Host directory backing the guest's filesystem, while the session is open.
    pub fn scratch_root(&self) -> Option<PathBuf> {
        self.lock()
            .as_ref()
            .map(|guest| guest.scratch().root().to_path_buf())
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Tear down the guest and remove its scratch directory.
    ///
    /// Closing an already closed session is a no-op. Any other operation on
    /// a closed session fails with [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        let guest = self.lock().take();
        match guest {
            Some(guest) => {
                guest.close()?;
                log::debug!("exiftool session closed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<GuestInstance>> {
        // Guest failures surface as errors, not panics.
        self.guest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_guest<T>(&self, f: impl FnOnce(&mut GuestInstance) -> Result<T>) -> Result<T> {
        let mut slot = self.lock();
        let guest = slot.as_mut().ok_or(Error::Closed)?;
        f(guest)
    }
}

impl std::fmt::Debug for ExifTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExifTool")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ExifTool {
    fn drop(&mut self) {
        let guest = self
            .guest
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(guest) = guest {
            if let Err(e) = guest.close() {
                log::warn!("failed to tear down exiftool session: {e}");
            }
        }
    }
}

fn stage_input(guest: &GuestInstance, bytes: &[u8]) -> Result<exif_wasm_engine::StagedFile> {
    let scratch = guest.scratch();
    let staged = scratch
        .stage(INPUT_SLOT, bytes)
        .map_err(|e| Error::file("stage input file", scratch.host_path(INPUT_SLOT), e))?;
    log::debug!("staged {} bytes at {}", bytes.len(), scratch.guest_path(INPUT_SLOT));
    Ok(staged)
}
