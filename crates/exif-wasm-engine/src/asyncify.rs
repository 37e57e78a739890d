//! Cooperative suspend/resume driver for asyncify-instrumented guests.
//!
//! The guest cannot block inside a call. When it needs to, it unwinds its
//! whole call stack back to the host and reports [`ExecutionState::Unwinding`].
//! The host then restarts the same export from the top with the guest in
//! rewind mode, and the guest replays its saved state up to the suspension
//! point. [`AsyncifyDriver::drive`] repeats this until the call completes.

use crate::host::HostState;
use crate::{Error, Result};
use serde::Deserialize;
use wasmtime::{Func, Instance, Memory, Store, TypedFunc, Val, WasmParams, WasmResults};

/// Guest address of the asyncify control record.
pub const DEFAULT_REGION_ADDRESS: u32 = 16;
/// Initial start offset of the asyncify scratch buffer.
pub const DEFAULT_DATA_START: u32 = 24;
/// End offset of the asyncify scratch buffer (1 MiB).
pub const DEFAULT_DATA_END: u32 = 1024 * 1024;

const GET_STATE_EXPORT: &str = "asyncify_get_state";
const STOP_UNWIND_EXPORT: &str = "asyncify_stop_unwind";
const START_REWIND_EXPORT: &str = "asyncify_start_rewind";
const STOP_REWIND_EXPORT: &str = "asyncify_stop_rewind";

/// Where a guest call stands relative to a cooperative suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Not suspended; results are valid.
    Normal,
    /// The guest is unwinding its stack to suspend.
    Unwinding,
    /// The host re-entered the call and the guest is replaying.
    Rewinding,
}

impl TryFrom<i32> for ExecutionState {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(ExecutionState::Normal),
            1 => Ok(ExecutionState::Unwinding),
            2 => Ok(ExecutionState::Rewinding),
            other => Err(Error::GuestTrap {
                function: GET_STATE_EXPORT.to_string(),
                message: format!("unknown asyncify state {other}"),
            }),
        }
    }
}

/// The 8-byte `{data_start, data_end}` control record used by the guest's
/// suspend machinery, and the scratch buffer it bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScratchDataRegion {
    /// Guest address of the control record.
    pub address: u32,
    /// Start of the scratch buffer.
    pub data_start: u32,
    /// End of the scratch buffer (exclusive).
    pub data_end: u32,
}

impl Default for ScratchDataRegion {
    fn default() -> Self {
        Self {
            address: DEFAULT_REGION_ADDRESS,
            data_start: DEFAULT_DATA_START,
            data_end: DEFAULT_DATA_END,
        }
    }
}

impl ScratchDataRegion {
    /// Little-endian encoding of the control record.
    pub fn encode(&self) -> [u8; 8] {
        let mut record = [0u8; 8];
        record[..4].copy_from_slice(&self.data_start.to_le_bytes());
        record[4..].copy_from_slice(&self.data_end.to_le_bytes());
        record
    }

    /// Check the region's layout against a linear memory of `memory_size` bytes.
    pub fn validate(&self, memory_size: usize) -> Result<()> {
        if self.data_start >= self.data_end {
            return Err(Error::GuestInit(format!(
                "asyncify data start {:#x} is not below data end {:#x}",
                self.data_start, self.data_end
            )));
        }
        if u64::from(self.address) + 8 > u64::from(self.data_start) {
            return Err(Error::GuestInit(format!(
                "asyncify control record at {:#x} overlaps its data buffer at {:#x}",
                self.address, self.data_start
            )));
        }
        if self.data_end as usize > memory_size {
            return Err(Error::GuestInit(format!(
                "asyncify data end {:#x} exceeds guest memory of {memory_size:#x} bytes",
                self.data_end
            )));
        }
        Ok(())
    }

    /// Whether `[ptr, ptr + len)` intersects the control record or its buffer.
    pub fn overlaps(&self, ptr: u32, len: usize) -> bool {
        let start = u64::from(ptr);
        let end = start + len as u64;
        start < u64::from(self.data_end) && u64::from(self.address) < end
    }

    /// Write the initial bounds into guest memory.
    pub fn reset(&self, store: &mut Store<HostState>, memory: Memory) -> Result<()> {
        memory
            .write(store, self.address as usize, &self.encode())
            .map_err(|_| Error::MemoryBounds {
                address: self.address as usize,
                len: 8,
            })
    }
}

/// The four asyncify control exports.
pub struct AsyncifyExports {
    get_state: TypedFunc<(), i32>,
    stop_unwind: TypedFunc<(), ()>,
    start_rewind: TypedFunc<i32, ()>,
    stop_rewind: TypedFunc<(), ()>,
}

impl AsyncifyExports {
    /// Look up the control exports on an instance.
    pub fn lookup(instance: &Instance, store: &mut Store<HostState>) -> Result<Self> {
        Ok(Self {
            get_state: typed_export(instance, store, GET_STATE_EXPORT)?,
            stop_unwind: typed_export(instance, store, STOP_UNWIND_EXPORT)?,
            start_rewind: typed_export(instance, store, START_REWIND_EXPORT)?,
            stop_rewind: typed_export(instance, store, STOP_REWIND_EXPORT)?,
        })
    }
}

/// Drives guest exports to completion across any number of suspensions.
pub struct AsyncifyDriver {
    exports: AsyncifyExports,
    region: ScratchDataRegion,
    memory: Memory,
}

impl AsyncifyDriver {
    /// Create a driver over the given exports, control region and memory.
    pub fn new(exports: AsyncifyExports, region: ScratchDataRegion, memory: Memory) -> Self {
        Self {
            exports,
            region,
            memory,
        }
    }

    /// The control region this driver resets on every unwind.
    pub fn region(&self) -> &ScratchDataRegion {
        &self.region
    }

    /// Query the guest's current execution state.
    pub fn state(&self, store: &mut Store<HostState>) -> Result<ExecutionState> {
        let raw = self
            .exports
            .get_state
            .call(&mut *store, ())
            .map_err(|e| Error::trap(GET_STATE_EXPORT, &e))?;
        ExecutionState::try_from(raw)
    }

    /// Invoke `func` until it completes, replaying it after every unwind.
    ///
    /// Results produced by unwound invocations are discarded; the values of
    /// the final invocation are returned. Any trap, including one raised
    /// during a replay, ends the call.
    pub fn drive(
        &self,
        store: &mut Store<HostState>,
        name: &str,
        func: &Func,
        args: &[Val],
    ) -> Result<Vec<Val>> {
        let mut results = result_slots(store, func);
        let mut replays: u32 = 0;

        loop {
            func.call(&mut *store, args, &mut results)
                .map_err(|e| Error::trap(name, &e))?;

            match self.state(store)? {
                ExecutionState::Normal => return Ok(results),
                ExecutionState::Unwinding => {
                    replays += 1;
                    tracing::trace!(function = name, replays, "guest unwound, rewinding");

                    self.exports
                        .stop_unwind
                        .call(&mut *store, ())
                        .map_err(|e| Error::trap(STOP_UNWIND_EXPORT, &e))?;
                    self.region.reset(store, self.memory)?;
                    self.exports
                        .start_rewind
                        .call(&mut *store, self.region.address as i32)
                        .map_err(|e| Error::trap(START_REWIND_EXPORT, &e))?;
                }
                ExecutionState::Rewinding => {
                    self.exports
                        .stop_rewind
                        .call(&mut *store, ())
                        .map_err(|e| Error::trap(STOP_REWIND_EXPORT, &e))?;
                    tracing::trace!(function = name, replays, "guest call completed after rewind");
                    return Ok(results);
                }
            }
        }
    }
}

/// Look up a typed export, reporting a missing or mistyped one as an init error.
pub(crate) fn typed_export<P, R>(
    instance: &Instance,
    store: &mut Store<HostState>,
    name: &str,
) -> Result<TypedFunc<P, R>>
where
    P: WasmParams,
    R: WasmResults,
{
    instance
        .get_typed_func::<P, R>(&mut *store, name)
        .map_err(|e| Error::GuestInit(format!("export `{name}`: {e:#}")))
}

/// Placeholder result values matching `func`'s signature.
pub(crate) fn result_slots(store: &Store<HostState>, func: &Func) -> Vec<Val> {
    let count = func.ty(store).results().len();
    vec![Val::I32(0); count]
}
