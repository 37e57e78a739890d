//! # exif-wasm-engine
//!
//! In-process execution of the ExifTool WebAssembly guest (a Perl
//! interpreter compiled to WASI preview 1 with asyncify instrumentation).
//!
//! This crate uses [wasmtime](https://wasmtime.dev/) to sandbox the guest:
//! it mounts a private scratch tree at `/tmp`, captures stdout and stderr in
//! memory, links the `env.call_host_function` callback, and drives guest
//! exports through any number of asyncify unwind/rewind cycles.
//!
//! ## Difference from `exif-runtime`
//!
//! - **`exif-wasm-engine`** (this crate): instance lifecycle, the suspend
//!   driver, and moving bytes in and out of guest memory. Knows nothing
//!   about ExifTool.
//! - **`exif-runtime`**: the metadata API. Builds Perl programs, stages
//!   files, and decodes what the guest prints.
//!
//! ## Example
//!
//! ```ignore
//! use exif_wasm_engine::{EngineConfig, GuestInstance};
//!
//! let config = EngineConfig::default().with_module_path("exiftool.wasm");
//! let mut guest = GuestInstance::new(&config)?;
//! let stdout = guest.evaluate("print 1 + 1;")?;
//! assert_eq!(stdout, "2");
//! guest.close()?;
//! ```

pub mod asyncify;
pub mod config;
pub mod error;
pub mod host;
pub mod instance;
pub mod scratch;
#[cfg(any(test, feature = "stub"))]
pub mod stub;

pub use asyncify::{AsyncifyDriver, ExecutionState, ScratchDataRegion};
pub use config::{EngineConfig, MODULE_PATH_ENV};
pub use error::{Error, Result};
pub use host::{CapturePipe, HostFunctions, HostState};
pub use instance::GuestInstance;
pub use scratch::{ScratchFilesystem, StagedFile, INPUT_SLOT, OUTPUT_SLOT};
