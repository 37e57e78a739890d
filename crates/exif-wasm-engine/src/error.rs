use thiserror::Error;
use wasmtime_wasi::I32Exit;

/// Errors from the guest execution engine.
#[derive(Error, Debug)]
pub enum Error {
    /// The guest module could not be read or compiled.
    #[error("failed to load guest module: {0}")]
    Load(String),

    /// The scratch filesystem could not be created or mounted.
    #[error("scratch filesystem error: {0}")]
    Resource(String),

    /// Instantiation or guest-side initialization failed.
    #[error("guest initialization failed: {0}")]
    GuestInit(String),

    /// The guest allocator returned a null block.
    #[error("guest allocation of {size} bytes failed")]
    Allocation {
        /// Requested size in bytes.
        size: usize,
    },

    /// A host access to guest memory fell outside the permitted range.
    #[error("guest memory access out of bounds: {len} bytes at {address:#x}")]
    MemoryBounds {
        /// Guest address of the access.
        address: usize,
        /// Length of the access.
        len: usize,
    },

    /// A guest export trapped or exited.
    #[error("guest trapped in `{function}`: {message}")]
    GuestTrap {
        /// Name of the export being invoked.
        function: String,
        /// Trap description.
        message: String,
    },

    /// A marshaled call could not be completed.
    #[error("{operation} failed: {source}")]
    GuestExecution {
        /// Name of the marshaling step.
        operation: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Build a [`Error::GuestTrap`] from a wasmtime call failure.
    pub(crate) fn trap(function: &str, err: &wasmtime::Error) -> Self {
        let message = match err.downcast_ref::<I32Exit>() {
            Some(exit) => format!("guest exited with status {}", exit.0),
            None => format!("{err:#}"),
        };
        Error::GuestTrap {
            function: function.to_string(),
            message,
        }
    }

    pub(crate) fn execution(operation: &str, source: Error) -> Self {
        Error::GuestExecution {
            operation: operation.to_string(),
            source: Box::new(source),
        }
    }
}

/// Result type for exif-wasm-engine operations.
pub type Result<T> = std::result::Result<T, Error>;
