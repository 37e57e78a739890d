use crate::scratch::ScratchFilesystem;
use crate::{EngineConfig, Error, Result};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use wasmtime::{Caller, Linker, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{
    DirPerms, FilePerms, HostOutputStream, StdoutStream, StreamError, StreamResult, Subscribe,
    WasiCtxBuilder,
};

/// Import module of the host callback.
pub const HOST_MODULE: &str = "env";
/// Import name of the host callback.
pub const HOST_CALL: &str = "call_host_function";
/// Status returned by the host callback.
pub const HOST_CALL_STATUS: i32 = 0;

const INITIAL_CAPTURE_BYTES: usize = 64 * 1024;

/// State owned by the wasmtime store.
pub struct HostState {
    /// WASI preview-1 context.
    pub wasi: WasiP1Ctx,
    /// Resource limits applied to the store.
    pub limits: StoreLimits,
    /// Number of host callback invocations.
    pub host_calls: u64,
}

impl HostState {
    /// Create a new `HostState`.
    pub fn new(wasi: WasiP1Ctx, limits: StoreLimits) -> Self {
        Self {
            wasi,
            limits,
            host_calls: 0,
        }
    }
}

/// An in-memory guest output stream that can be cleared between calls.
///
/// Clones share one buffer: the WASI context writes through one handle while
/// the instance reads and resets through another. `capacity` bounds what a
/// single call may write; a write past it traps the guest.
#[derive(Clone)]
pub struct CapturePipe {
    buffer: Arc<Mutex<Vec<u8>>>,
    capacity: usize,
}

impl CapturePipe {
    /// Create a pipe accepting up to `capacity` bytes between resets.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
            capacity,
        }
    }

    /// Discard everything captured so far.
    pub fn reset(&self) {
        let mut buffer = self.lock();
        buffer.clear();
        buffer.shrink_to(INITIAL_CAPTURE_BYTES);
    }

    /// Text captured since the last reset.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    /// Number of bytes captured since the last reset.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing was captured since the last reset.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn over_capacity(&self) -> StreamError {
        StreamError::Trap(anyhow::anyhow!(
            "guest output exceeds capture capacity of {} bytes",
            self.capacity
        ))
    }
}

impl StdoutStream for CapturePipe {
    fn stream(&self) -> Box<dyn HostOutputStream> {
        Box::new(self.clone())
    }

    fn isatty(&self) -> bool {
        false
    }
}

impl Subscribe for CapturePipe {
    // Always writable; the stream never blocks.
    fn ready<'life0, 'async_trait>(
        &'life0 mut self,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async {})
    }
}

impl HostOutputStream for CapturePipe {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        let mut buffer = self.lock();
        if bytes.len() > self.capacity.saturating_sub(buffer.len()) {
            drop(buffer);
            return Err(self.over_capacity());
        }
        buffer.extend_from_slice(&bytes);
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        let used = self.lock().len();
        if used < self.capacity {
            Ok(self.capacity - used)
        } else {
            Err(self.over_capacity())
        }
    }
}

/// Build the guest's WASI context: argv, captured stdio, and the two mounts.
///
/// Network access is disabled and no host environment is inherited.
pub fn build_wasi_ctx(
    scratch: &ScratchFilesystem,
    config: &EngineConfig,
    stdout: &CapturePipe,
    stderr: &CapturePipe,
) -> Result<WasiP1Ctx> {
    let mut builder = WasiCtxBuilder::new();
    builder
        .arg(&config.argv0)
        .stdout(stdout.clone())
        .stderr(stderr.clone())
        .allow_blocking_current_thread(true)
        .allow_tcp(false)
        .allow_udp(false)
        .allow_ip_name_lookup(false);

    builder
        .preopened_dir(
            scratch.scratch_dir(),
            &config.scratch_mount,
            DirPerms::all(),
            FilePerms::all(),
        )
        .map_err(|e| {
            Error::Resource(format!(
                "failed to mount {} at {}: {e:#}",
                scratch.scratch_dir().display(),
                config.scratch_mount
            ))
        })?;

    builder
        .preopened_dir(
            scratch.device_dir(),
            &config.device_mount,
            DirPerms::READ,
            FilePerms::READ,
        )
        .map_err(|e| {
            Error::Resource(format!(
                "failed to mount {} at {}: {e:#}",
                scratch.device_dir().display(),
                config.device_mount
            ))
        })?;

    Ok(builder.build_p1())
}

/// Build store limits from the engine configuration.
pub fn build_store_limits(config: &EngineConfig) -> StoreLimits {
    let mut builder = StoreLimitsBuilder::new();
    if let Some(max_bytes) = config.max_memory_bytes {
        builder = builder.memory_size(usize::try_from(max_bytes).unwrap_or(usize::MAX));
    }
    builder.trap_on_grow_failure(true).build()
}

/// Host functions exposed to the guest.
pub struct HostFunctions;

impl HostFunctions {
    /// Register WASI preview 1 and the host callback with the linker.
    pub fn register(linker: &mut Linker<HostState>) -> Result<()> {
        preview1::add_to_linker_sync(linker, |state| &mut state.wasi)
            .map_err(|e| Error::GuestInit(format!("failed to link WASI: {e:#}")))?;

        linker
            .func_wrap(
                HOST_MODULE,
                HOST_CALL,
                |mut caller: Caller<'_, HostState>, func_id: i32, arg_ptr: i32, arg_len: i32| -> i32 {
                    Self::call_host_function(&mut caller, func_id, arg_ptr, arg_len)
                },
            )
            .map_err(|e| Error::GuestInit(format!("failed to link {HOST_CALL}: {e:#}")))?;

        Ok(())
    }

    /// Guest-initiated host call. No identifiers are dispatched.
    fn call_host_function(
        caller: &mut Caller<'_, HostState>,
        func_id: i32,
        arg_ptr: i32,
        arg_len: i32,
    ) -> i32 {
        tracing::trace!(func_id, arg_ptr, arg_len, "guest host call");
        caller.data_mut().host_calls += 1;
        HOST_CALL_STATUS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_shared_buffer() {
        let pipe = CapturePipe::new(64);
        let mut writer = pipe.clone();

        writer.write(Bytes::from_static(b"first call")).unwrap();
        assert_eq!(pipe.text(), "first call");

        pipe.reset();
        assert!(pipe.is_empty());
        writer.write(Bytes::from_static(b"second")).unwrap();
        assert_eq!(pipe.text(), "second");
    }

    #[test]
    fn capacity_applies_between_resets() {
        let pipe = CapturePipe::new(8);
        let mut writer = pipe.clone();

        assert_eq!(writer.check_write().unwrap(), 8);
        writer.write(Bytes::from_static(b"12345")).unwrap();
        assert_eq!(writer.check_write().unwrap(), 3);
        assert!(writer.write(Bytes::from_static(b"6789")).is_err());
        assert_eq!(pipe.text(), "12345");

        writer.write(Bytes::from_static(b"678")).unwrap();
        assert!(writer.check_write().is_err());

        pipe.reset();
        assert_eq!(writer.check_write().unwrap(), 8);
        writer.write(Bytes::from_static(b"abcdefgh")).unwrap();
        assert_eq!(pipe.len(), 8);
    }
}
