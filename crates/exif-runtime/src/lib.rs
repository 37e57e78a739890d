//! # exif-runtime
//!
//! Read and write image metadata (EXIF, IPTC, XMP, ICC) with ExifTool
//! running inside a sandboxed WebAssembly guest. No process is spawned and
//! no native metadata library is linked.
//!
//! This crate provides:
//! - [`ExifTool`] sessions with exclusive, serialized guest access
//! - [`MetadataRecord`] results keyed by tag name
//! - The Perl programs evaluated by the guest ([`script`])
//!
//! ## Example
//!
//! ```ignore
//! use exif_runtime::ExifTool;
//! use std::path::Path;
//!
//! let exiftool = ExifTool::new()?;
//! let metadata = exiftool.read_metadata("photo.jpg")?;
//! println!("{:?}", metadata.get_str("FileType"));
//!
//! exiftool.set_tag("photo.jpg", Some(Path::new("tagged.jpg")), "Artist", "Jane Doe")?;
//! exiftool.close()?;
//! ```

mod error;
mod record;
pub mod script;
mod session;

pub use error::{Error, Result};
pub use record::{MetadataRecord, WriteStatus};
pub use script::BINARY_PLACEHOLDER;
pub use session::ExifTool;

// Re-export engine types for convenience
pub use exif_wasm_engine::EngineConfig;
