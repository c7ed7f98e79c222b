//! Runtime core: Wasmtime engine, module loading, and one live instance.
//!
//! A `RuntimeCore` is the only place that touches the execution engine.
//! Everything above it sees five operations: compile, instantiate, invoke,
//! copy memory, and teardown. One core belongs to exactly one connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use wasmtime::{Engine, Func, Linker, Memory, Module, Store, Trap, Val};

use crate::abi::{Abi, MEMORY_EXPORT};
use crate::config::{Config, TransportModule, WASM_PAGE_SIZE};
use crate::error::{Fault, Result, WaterError};
use crate::host_impl::HostState;
use crate::linker::{register_capability_shim, stub_unknown_imports};
use crate::memory::ScratchRegion;
use crate::validation::validate_module;

static LIVE_INSTANCES: AtomicUsize = AtomicUsize::new(0);

/// Number of module instances currently alive in this process.
pub fn live_instances() -> usize {
    LIVE_INSTANCES.load(Ordering::SeqCst)
}

/// Counts one live instance for as long as it is held.
struct InstanceCount;

impl InstanceCount {
    fn acquire() -> Self {
        LIVE_INSTANCES.fetch_add(1, Ordering::SeqCst);
        Self
    }
}

impl Drop for InstanceCount {
    fn drop(&mut self) {
        LIVE_INSTANCES.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Create a Wasmtime engine for transport modules.
pub fn create_engine(config: &Config) -> Result<Engine> {
    let mut wasm_config = wasmtime::Config::new();

    // Fuel metering bounds runaway guest compute between host calls.
    wasm_config.consume_fuel(config.fuel_per_call.is_some());

    // One instance per connection; no shared memories.
    wasm_config.wasm_threads(false);

    let max_bytes = config.max_memory_bytes() as u64;
    wasm_config.memory_guaranteed_dense_image_size(max_bytes.min(16 * 1024 * 1024));

    Engine::new(&wasm_config).map_err(|e| WaterError::Compile(format!("engine: {e}")))
}

/// Compile transport module bytes (binary or text format).
pub fn compile(engine: &Engine, bytes: &[u8]) -> Result<Module> {
    Module::new(engine, bytes).map_err(|e| WaterError::Compile(format!("{e:#}")))
}

/// Describe a failed guest call as a fault.
fn trap_fault(err: &anyhow::Error) -> Fault {
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => Fault::trap("fuel exhausted"),
        _ => Fault::trap(err.root_cause().to_string()),
    }
}

struct Live {
    store: Store<HostState>,
    memory: Memory,
    exports: HashMap<&'static str, Func>,
    scratch: ScratchRegion,
    /// Set after a trap; the instance is never entered again.
    poisoned: bool,
    _count: InstanceCount,
}

/// One compiled module and, once instantiated, its live instance.
pub struct RuntimeCore {
    engine: Engine,
    module: Module,
    config: Config,
    live: Option<Live>,
}

impl RuntimeCore {
    /// Wrap an already compiled module. `module` must come from `engine`.
    pub fn new(engine: Engine, module: Module, config: Config) -> Self {
        Self {
            engine,
            module,
            config,
            live: None,
        }
    }

    /// Compile `module` with a fresh engine.
    pub fn from_module(module: &TransportModule, config: Config) -> Result<Self> {
        let engine = create_engine(&config)?;
        let compiled = compile(&engine, module.bytes())?;
        Ok(Self::new(engine, compiled, config))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Instantiate the module against `abi`, with `host` behind its
    /// capability imports, and reserve the host scratch region.
    ///
    /// Fails with `Instantiate` if the module does not conform to `abi`.
    pub fn instantiate(&mut self, abi: &Abi, host: HostState) -> Result<()> {
        if self.live.is_some() {
            return Err(WaterError::Instantiate("core already instantiated".into()));
        }
        if self.config.scratch_pages == 0 {
            return Err(WaterError::Instantiate("scratch_pages must be at least 1".into()));
        }
        validate_module(&self.module, abi)?;

        let mut store = Store::new(&self.engine, host);
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = self.config.fuel_per_call {
            store
                .set_fuel(fuel)
                .map_err(|e| WaterError::Instantiate(format!("set fuel: {e}")))?;
        }

        let mut linker = Linker::new(&self.engine);
        register_capability_shim(&mut linker, abi)?;
        stub_unknown_imports(&mut linker, &self.module, abi)?;

        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| WaterError::Instantiate(format!("{e:#}")))?;
        let count = InstanceCount::acquire();

        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| WaterError::Instantiate(format!("no '{MEMORY_EXPORT}' export")))?;

        let prev_pages = memory
            .grow(&mut store, u64::from(self.config.scratch_pages))
            .map_err(|e| WaterError::Instantiate(format!("reserve scratch region: {e}")))?;
        let scratch = ScratchRegion::new(
            prev_pages as usize * WASM_PAGE_SIZE,
            self.config.scratch_bytes(),
        );

        let mut exports = HashMap::new();
        for (name, _, _) in abi.exports() {
            let func = instance
                .get_func(&mut store, name)
                .ok_or_else(|| WaterError::Instantiate(format!("missing export: {name}")))?;
            exports.insert(name, func);
        }

        tracing::debug!(
            version = abi.version,
            scratch_base = scratch.base,
            scratch_len = scratch.len,
            "transport module instantiated"
        );

        self.live = Some(Live {
            store,
            memory,
            exports,
            scratch,
            poisoned: false,
            _count: count,
        });
        Ok(())
    }

    /// Call an exported function with i32 arguments.
    ///
    /// A trap poisons the instance: later calls fail without entering it.
    pub fn invoke(&mut self, export: &str, args: &[i32]) -> std::result::Result<i32, Fault> {
        let live = self
            .live
            .as_mut()
            .ok_or_else(|| Fault::trap("instance already torn down"))?;
        if live.poisoned {
            return Err(Fault::trap("instance unusable after an earlier trap"));
        }
        let func = *live
            .exports
            .get(export)
            .ok_or_else(|| Fault::trap(format!("no export '{export}'")))?;

        if let Some(fuel) = self.config.fuel_per_call {
            live.store
                .set_fuel(fuel)
                .map_err(|e| Fault::trap(format!("set fuel: {e}")))?;
        }

        let params: Vec<Val> = args.iter().map(|&a| Val::I32(a)).collect();
        let mut results = [Val::I32(0)];
        if let Err(e) = func.call(&mut live.store, &params, &mut results) {
            live.poisoned = true;
            let fault = trap_fault(&e);
            tracing::warn!(export, fault = %fault, "guest trapped");
            return Err(fault);
        }
        results[0]
            .i32()
            .ok_or_else(|| Fault::trap(format!("{export} returned a non-i32 result")))
    }

    /// Copy `len` bytes out of guest memory at `offset`.
    pub fn read_memory(&self, offset: usize, len: usize) -> std::result::Result<Vec<u8>, Fault> {
        let live = self
            .live
            .as_ref()
            .ok_or_else(|| Fault::memory("instance already torn down"))?;
        let mut buf = vec![0u8; len];
        live.memory
            .read(&live.store, offset, &mut buf)
            .map_err(|_| Fault::memory(format!("read of {len} bytes at {offset} out of range")))?;
        Ok(buf)
    }

    /// Copy `bytes` into guest memory at `offset`.
    pub fn write_memory(&mut self, offset: usize, bytes: &[u8]) -> std::result::Result<(), Fault> {
        let live = self
            .live
            .as_mut()
            .ok_or_else(|| Fault::memory("instance already torn down"))?;
        live.memory.write(&mut live.store, offset, bytes).map_err(|_| {
            Fault::memory(format!("write of {} bytes at {offset} out of range", bytes.len()))
        })
    }

    /// The host-owned transfer region, once instantiated.
    pub fn scratch(&self) -> Option<ScratchRegion> {
        self.live.as_ref().map(|l| l.scratch)
    }

    pub fn host_state(&self) -> Option<&HostState> {
        self.live.as_ref().map(|l| l.store.data())
    }

    pub fn host_state_mut(&mut self) -> Option<&mut HostState> {
        self.live.as_mut().map(|l| l.store.data_mut())
    }

    /// Release the instance, its memory, and every raw connection the
    /// guest opened. Idempotent.
    ///
    /// The instance is always released; an error only reports that a raw
    /// connection failed to shut down cleanly.
    pub fn teardown(&mut self) -> Result<()> {
        let Some(mut live) = self.live.take() else {
            return Ok(());
        };
        let closed = live.store.data_mut().close_all();
        drop(live);
        tracing::debug!("transport module torn down");
        closed.map_err(WaterError::Io)
    }
}

impl Drop for RuntimeCore {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::debug!(error = %e, "teardown on drop failed");
        }
    }
}

impl std::fmt::Debug for RuntimeCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeCore")
            .field("config", &self.config)
            .field("live", &self.is_live())
            .field("scratch", &self.scratch())
            .finish_non_exhaustive()
    }
}
