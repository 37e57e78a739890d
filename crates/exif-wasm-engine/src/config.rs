use crate::asyncify::ScratchDataRegion;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming the guest module on disk.
pub const MODULE_PATH_ENV: &str = "EXIFTOOL_WASM_PATH";
/// File name looked up under `~/.exiftool-wasm/` when nothing else is set.
pub const DEFAULT_MODULE_FILE: &str = "exiftool.wasm";

/// Configuration for guest instantiation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Location of the guest module. See [`EngineConfig::resolve_module_path`].
    pub module_path: Option<PathBuf>,
    /// Guest path of the read/write scratch mount.
    pub scratch_mount: String,
    /// Guest path of the read-only device mount.
    pub device_mount: String,
    /// `argv[0]` seen by the guest.
    pub argv0: String,
    /// Asyncify control record and scratch buffer.
    pub scratch_region: ScratchDataRegion,
    /// Upper bound on guest linear memory, in bytes.
    pub max_memory_bytes: Option<u64>,
    /// Bytes each capture stream accepts within one call.
    pub capture_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            module_path: None,
            scratch_mount: "/tmp".to_string(),
            device_mount: "/dev".to_string(),
            argv0: "perl".to_string(),
            scratch_region: ScratchDataRegion::default(),
            max_memory_bytes: None,
            capture_capacity: 256 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Set the guest module location.
    pub fn with_module_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.module_path = Some(path.into());
        self
    }

    /// Set the linear memory limit.
    pub fn with_max_memory_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    /// Set the asyncify control region.
    pub fn with_scratch_region(mut self, region: ScratchDataRegion) -> Self {
        self.scratch_region = region;
        self
    }

    /// Resolve the guest module path.
    ///
    /// Resolution order:
    /// 1. `module_path`
    /// 2. `EXIFTOOL_WASM_PATH`
    /// 3. `~/.exiftool-wasm/exiftool.wasm`
    pub fn resolve_module_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.module_path {
            return Ok(path.clone());
        }

        if let Ok(path) = std::env::var(MODULE_PATH_ENV) {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }

        if let Ok(home) = std::env::var("HOME") {
            let path = PathBuf::from(home)
                .join(".exiftool-wasm")
                .join(DEFAULT_MODULE_FILE);
            if path.exists() {
                return Ok(path);
            }
        }

        Err(Error::Load(format!(
            "guest module not found; set module_path, {MODULE_PATH_ENV}, or install ~/.exiftool-wasm/{DEFAULT_MODULE_FILE}"
        )))
    }

    /// Resolve and read the guest module.
    pub fn load_module_bytes(&self) -> Result<Vec<u8>> {
        let path = self.resolve_module_path()?;
        std::fs::read(&path)
            .map_err(|e| Error::Load(format!("failed to read {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_guest_layout() {
        let config = EngineConfig::default();
        assert_eq!(config.scratch_mount, "/tmp");
        assert_eq!(config.device_mount, "/dev");
        assert_eq!(config.argv0, "perl");
        assert_eq!(config.scratch_region.address, 16);
        assert_eq!(config.scratch_region.data_start, 24);
        assert_eq!(config.scratch_region.data_end, 1024 * 1024);
    }

    #[test]
    fn toml_overrides_selected_keys() {
        let config = EngineConfig::from_toml_str(
            r#"
module_path = "/opt/exiftool/exiftool.wasm"
max_memory_bytes = 536870912

[scratch_region]
data_end = 2097152
"#,
        )
        .unwrap();

        assert_eq!(
            config.module_path.as_deref(),
            Some(Path::new("/opt/exiftool/exiftool.wasm"))
        );
        assert_eq!(config.max_memory_bytes, Some(512 * 1024 * 1024));
        assert_eq!(config.scratch_region.address, 16);
        assert_eq!(config.scratch_region.data_end, 2 * 1024 * 1024);
        assert_eq!(config.scratch_mount, "/tmp");
    }

    #[test]
    fn toml_rejects_unknown_keys() {
        let err = EngineConfig::from_toml_str("modul_path = \"x\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn explicit_module_path_wins() {
        let config = EngineConfig::default().with_module_path("/somewhere/guest.wasm");
        assert_eq!(
            config.resolve_module_path().unwrap(),
            PathBuf::from("/somewhere/guest.wasm")
        );
    }

    #[test]
    fn unreadable_module_is_a_load_error() {
        let temp_dir = TempDir::new().unwrap();
        let config = EngineConfig::default().with_module_path(temp_dir.path().join("missing.wasm"));
        let err = config.load_module_bytes().unwrap_err();
        assert!(matches!(err, Error::Load(_)));
    }

    #[test]
    fn load_reads_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("engine.toml");
        std::fs::write(&path, "argv0 = \"zeroperl\"\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.argv0, "zeroperl");
    }
}
