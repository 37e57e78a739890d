use crate::asyncify::{result_slots, typed_export, AsyncifyDriver, AsyncifyExports, ScratchDataRegion};
use crate::host::{build_store_limits, build_wasi_ctx, CapturePipe, HostFunctions, HostState};
use crate::scratch::ScratchFilesystem;
use crate::{EngineConfig, Error, Result};
use wasmtime::{Engine, Func, Instance, Linker, Memory, Module, Store, TypedFunc, Val};

const MEMORY_EXPORT: &str = "memory";
const MALLOC_EXPORT: &str = "malloc";
const FREE_EXPORT: &str = "free";
const EVAL_EXPORT: &str = "zeroperl_eval";
const FLUSH_EXPORT: &str = "zeroperl_flush";
const INITIALIZE_EXPORT: &str = "_initialize";
const INTERPRETER_INIT_EXPORT: &str = "zeroperl_init";

/// Exported functions used on every call.
struct GuestExports {
    malloc: TypedFunc<i32, i32>,
    free: TypedFunc<i32, ()>,
    eval: Func,
    flush: Option<Func>,
}

impl GuestExports {
    fn lookup(instance: &Instance, store: &mut Store<HostState>) -> Result<Self> {
        let eval = instance
            .get_func(&mut *store, EVAL_EXPORT)
            .ok_or_else(|| Error::GuestInit(format!("guest does not export `{EVAL_EXPORT}`")))?;
        let flush = instance.get_func(&mut *store, FLUSH_EXPORT);

        tracing::debug!(flush = flush.is_some(), "resolved guest exports");

        Ok(Self {
            malloc: typed_export(instance, store, MALLOC_EXPORT)?,
            free: typed_export(instance, store, FREE_EXPORT)?,
            eval,
            flush,
        })
    }
}

/// One live guest: store, instance, memory, capture streams and scratch tree.
///
/// Methods take `&mut self`; holding the instance mutably is what makes a
/// call exclusive.
pub struct GuestInstance {
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
    exports: GuestExports,
    driver: AsyncifyDriver,
    stdout: CapturePipe,
    stderr: CapturePipe,
    last_stderr: String,
    scratch: ScratchFilesystem,
}

impl GuestInstance {
    /// Resolve and read the guest module, create a scratch filesystem, and
    /// instantiate.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let module_bytes = config.load_module_bytes()?;
        let scratch = ScratchFilesystem::create(&config.scratch_mount)?;
        Self::instantiate(&module_bytes, scratch, config)
    }

    /// Instantiate `module_bytes` (binary or WAT text) over `scratch`.
    ///
    /// On failure every resource created so far, `scratch` included, is
    /// released before the error is returned.
    pub fn instantiate(
        module_bytes: &[u8],
        scratch: ScratchFilesystem,
        config: &EngineConfig,
    ) -> Result<Self> {
        let engine = Engine::default();
        let module =
            Module::new(&engine, module_bytes).map_err(|e| Error::Load(format!("{e:#}")))?;

        let stdout = CapturePipe::new(config.capture_capacity);
        let stderr = CapturePipe::new(config.capture_capacity);
        let wasi = build_wasi_ctx(&scratch, config, &stdout, &stderr)?;

        let mut store = Store::new(&engine, HostState::new(wasi, build_store_limits(config)));
        store.limiter(|state| &mut state.limits);

        let mut linker = Linker::new(&engine);
        HostFunctions::register(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| Error::GuestInit(format!("instantiation failed: {e:#}")))?;
        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| Error::GuestInit(format!("guest does not export `{MEMORY_EXPORT}`")))?;

        let exports = GuestExports::lookup(&instance, &mut store)?;
        let asyncify = AsyncifyExports::lookup(&instance, &mut store)?;

        let region = config.scratch_region;
        region.validate(memory.data_size(&store))?;
        region
            .reset(&mut store, memory)
            .map_err(|e| Error::GuestInit(e.to_string()))?;
        let driver = AsyncifyDriver::new(asyncify, region, memory);

        initialize(&mut store, &instance, &driver)?;

        tracing::debug!(
            memory_bytes = memory.data_size(&store),
            scratch = %scratch.root().display(),
            "guest instantiated"
        );

        Ok(Self {
            store,
            instance,
            memory,
            exports,
            driver,
            stdout,
            stderr,
            last_stderr: String::new(),
            scratch,
        })
    }

    /// Evaluate a program in the guest and return the stdout it produced.
    ///
    /// The program is copied into a guest allocation that is always freed
    /// before this returns.
    pub fn evaluate(&mut self, program: &str) -> Result<String> {
        self.stdout.reset();
        self.stderr.reset();

        let mut payload = Vec::with_capacity(program.len() + 1);
        payload.extend_from_slice(program.as_bytes());
        payload.push(0);

        let ptr = self.allocate(payload.len())?;
        let outcome = self.write_and_eval(ptr, &payload);
        let released = self.release(ptr);

        let outcome = match (outcome, released) {
            (Ok(()), released) => released,
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(free_err)) => {
                tracing::warn!(error = %free_err, "failed to free guest payload");
                Err(e)
            }
        };
        let outcome = outcome.and_then(|()| self.flush());

        self.last_stderr = self.stderr.text();
        if !self.last_stderr.is_empty() {
            tracing::debug!(stderr = %self.last_stderr.trim_end(), "guest stderr");
        }

        outcome?;
        Ok(self.stdout.text())
    }

    /// Stderr captured during the last [`evaluate`](Self::evaluate).
    pub fn last_stderr(&self) -> &str {
        &self.last_stderr
    }

    /// The scratch filesystem mounted into this guest.
    pub fn scratch(&self) -> &ScratchFilesystem {
        &self.scratch
    }

    /// The asyncify control region in use.
    pub fn scratch_region(&self) -> &ScratchDataRegion {
        self.driver.region()
    }

    /// Current size of guest linear memory in bytes.
    pub fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    /// Number of times the guest invoked the host callback.
    pub fn host_calls(&self) -> u64 {
        self.store.data().host_calls
    }

    /// Whether the guest exports a function called `name`.
    pub fn exports_function(&mut self, name: &str) -> bool {
        self.instance.get_func(&mut self.store, name).is_some()
    }

    /// Call a parameterless guest export returning an `i32`, outside the
    /// asyncify driver. Returns `None` when the export is absent.
    #[cfg(any(test, feature = "stub"))]
    pub fn call_counter(&mut self, name: &str) -> Result<Option<i32>> {
        if !self.exports_function(name) {
            return Ok(None);
        }
        let func: TypedFunc<(), i32> = typed_export(&self.instance, &mut self.store, name)?;
        func.call(&mut self.store, ())
            .map(Some)
            .map_err(|e| Error::trap(name, &e))
    }

    /// Drop the store and remove the scratch tree.
    pub fn close(self) -> Result<()> {
        let Self {
            store, mut scratch, ..
        } = self;
        drop(store);
        scratch
            .close()
            .map_err(|e| Error::Resource(format!("failed to remove scratch directory: {e}")))
    }

    fn allocate(&mut self, len: usize) -> Result<u32> {
        let size = i32::try_from(len).map_err(|_| Error::Allocation { size: len })?;
        let ptr = self
            .exports
            .malloc
            .call(&mut self.store, size)
            .map_err(|e| Error::execution(MALLOC_EXPORT, Error::trap(MALLOC_EXPORT, &e)))?;
        if ptr == 0 {
            return Err(Error::Allocation { size: len });
        }
        Ok(ptr as u32)
    }

    fn release(&mut self, ptr: u32) -> Result<()> {
        self.exports
            .free
            .call(&mut self.store, ptr as i32)
            .map_err(|e| Error::execution(FREE_EXPORT, Error::trap(FREE_EXPORT, &e)))
    }

    fn write_and_eval(&mut self, ptr: u32, payload: &[u8]) -> Result<()> {
        let bounds = Error::MemoryBounds {
            address: ptr as usize,
            len: payload.len(),
        };
        if self.driver.region().overlaps(ptr, payload.len()) {
            return Err(bounds);
        }
        self.memory
            .write(&mut self.store, ptr as usize, payload)
            .map_err(|_| bounds)?;

        // The three trailing words are reserved and always zero.
        let args = [Val::I32(ptr as i32), Val::I32(0), Val::I32(0), Val::I32(0)];
        let eval = self.exports.eval;
        self.driver
            .drive(&mut self.store, EVAL_EXPORT, &eval, &args)
            .map_err(|e| Error::execution(EVAL_EXPORT, e))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let Some(flush) = self.exports.flush else {
            return Ok(());
        };
        let mut results = result_slots(&self.store, &flush);
        flush
            .call(&mut self.store, &[], &mut results)
            .map_err(|e| Error::execution(FLUSH_EXPORT, Error::trap(FLUSH_EXPORT, &e)))
    }
}

/// Run the guest's optional initializers: `_initialize` as a plain call, then
/// the interpreter's own init through the asyncify driver.
fn initialize(store: &mut Store<HostState>, instance: &Instance, driver: &AsyncifyDriver) -> Result<()> {
    if let Some(init) = instance.get_func(&mut *store, INITIALIZE_EXPORT) {
        let mut results = result_slots(store, &init);
        init.call(&mut *store, &[], &mut results).map_err(|e| {
            Error::GuestInit(Error::trap(INITIALIZE_EXPORT, &e).to_string())
        })?;
    }

    if let Some(init) = instance.get_func(&mut *store, INTERPRETER_INIT_EXPORT) {
        driver
            .drive(store, INTERPRETER_INIT_EXPORT, &init, &[])
            .map_err(|e| Error::GuestInit(e.to_string()))?;
    }

    Ok(())
}
