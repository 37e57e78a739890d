use std::path::PathBuf;
use thiserror::Error;

/// Errors from metadata sessions.
#[derive(Debug, Error)]
pub enum Error {
    /// The guest engine failed.
    #[error(transparent)]
    Engine(#[from] exif_wasm_engine::Error),

    /// A host filesystem operation failed.
    #[error("failed to {operation} {}: {source}", .path.display())]
    File {
        /// What was being done, e.g. `read source file`.
        operation: &'static str,
        /// Host path involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The guest's output could not be interpreted.
    #[error("unexpected output from {operation}: {reason} (output: {output:?})")]
    ResultDecode {
        /// Operation whose output was being decoded.
        operation: &'static str,
        /// Why decoding failed.
        reason: String,
        /// Raw captured stdout.
        output: String,
    },

    /// ExifTool declined to write the file.
    #[error("exiftool write failed{}", stderr_suffix(.stderr))]
    WriteRejected {
        /// Guest stderr captured during the write.
        stderr: String,
    },

    /// Tag values could not be serialized.
    #[error("failed to serialize tags: {0}")]
    Json(#[from] serde_json::Error),

    /// The session has been closed.
    #[error("session is closed")]
    Closed,
}

fn stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

impl Error {
    pub(crate) fn file(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::File {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// Result type for exif-runtime operations.
pub type Result<T> = std::result::Result<T, Error>;
