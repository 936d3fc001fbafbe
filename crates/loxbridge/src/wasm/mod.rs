//! WebAssembly-hosted interpreter.
//!
//! A [`WasmTemplate`] compiles the guest module once; every worker session
//! instantiates its own [`WasmRuntime`] (store, linear memory and instance)
//! from it. Teardown is enforced by the host: firing the session's
//! [`KillSwitch`] bumps the engine epoch, and the store's deadline callback
//! traps the guest at its next loop header or call, even in a loop that never
//! calls back into the host.

mod limits;

use std::path::Path;

use tracing::{Instrument, info_span, warn};
use wasmtime::{
    AsContext, AsContextMut, Caller, Config, Engine, Extern, Linker, Memory, Module, Store,
    StoreContext, StoreContextMut, TypedFunc, UpdateDeadline,
};

use self::limits::MemoryLimiter;
use crate::{
    TRACE_TARGET_WORKER,
    config::{GuestAbi, WasmConfig},
    error::{Error, Result},
    marshal::GuestMemory,
    runtime::{KillSwitch, OutputCallback, Runtime, RuntimeFactory},
};

#[derive(Default)]
pub struct WasmTemplateBuilder {
    config: WasmConfig,
    engine_config: Option<Config>,
}

impl WasmTemplateBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn config(mut self, config: WasmConfig) -> Self {
        self.config = config;
        self
    }

    /// Hard cap on each instance's linear memory, in bytes.
    #[must_use]
    pub const fn max_memory(mut self, max_memory: usize) -> Self {
        self.config.max_memory = max_memory;
        self
    }

    #[must_use]
    pub fn abi(mut self, abi: GuestAbi) -> Self {
        self.config.abi = abi;
        self
    }

    #[must_use]
    pub fn engine_config(mut self, cfg: Config) -> Self {
        self.engine_config = Some(cfg);
        self
    }

    /// Compile a `.wasm` or `.wat` file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, fails to compile, or
    /// lacks an export the guest ABI requires.
    pub async fn build(self, wasm: impl AsRef<Path>) -> Result<WasmTemplate> {
        let path = wasm.as_ref().to_path_buf();
        let span = info_span!(target: TRACE_TARGET_WORKER, "template.build", path = %path.display());
        async move {
            let bytes = tokio::fs::read(&path).await.map_err(Error::Io)?;
            let engine = self.engine()?;
            let compile_engine = engine.clone();
            let module = tokio::task::spawn_blocking(move || Module::new(&compile_engine, &bytes))
                .await
                .map_err(|e| Error::Wasm(anyhow::Error::from(e)))?
                .map_err(Error::Wasm)?;
            WasmTemplate::new(engine, module, self.config)
        }
        .instrument(span)
        .await
    }

    /// Compile a module from binary or text bytes on the calling thread.
    ///
    /// # Errors
    /// Returns an error if the module fails to compile or lacks an export
    /// the guest ABI requires.
    pub fn build_from_bytes(self, bytes: impl AsRef<[u8]>) -> Result<WasmTemplate> {
        let engine = self.engine()?;
        let module = Module::new(&engine, bytes.as_ref()).map_err(Error::Wasm)?;
        WasmTemplate::new(engine, module, self.config)
    }

    fn engine(&self) -> Result<Engine> {
        let mut engine_cfg = self.engine_config.clone().unwrap_or_default();
        if self.engine_config.is_some() {
            warn!(
                target: TRACE_TARGET_WORKER,
                "custom wasmtime::Config provided; loxbridge will force epoch interruption"
            );
        }
        configure_engine(&mut engine_cfg);
        Engine::new(&engine_cfg).map_err(Error::Wasm)
    }
}

fn configure_engine(cfg: &mut Config) {
    cfg.epoch_interruption(true);
    cfg.generate_address_map(false);
    cfg.wasm_backtrace(false);
    cfg.cranelift_opt_level(wasmtime::OptLevel::Speed);
}

/// A compiled guest module shared by every session of a controller.
pub struct WasmTemplate {
    engine: Engine,
    module: Module,
    config: WasmConfig,
}

impl WasmTemplate {
    #[must_use]
    pub fn builder() -> WasmTemplateBuilder {
        WasmTemplateBuilder::new()
    }

    fn new(engine: Engine, module: Module, config: WasmConfig) -> Result<Self> {
        let abi = &config.abi;
        for name in [&abi.memory, &abi.alloc, &abi.free, &abi.run] {
            if module.get_export(name).is_none() {
                return Err(Error::Wasm(anyhow::anyhow!(
                    "guest module does not export `{name}`"
                )));
            }
        }

        Ok(Self {
            engine,
            module,
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &WasmConfig {
        &self.config
    }

    fn new_linker(&self) -> Result<Linker<WorkerState>> {
        let mut linker = Linker::<WorkerState>::new(&self.engine);
        let memory_export = self.config.abi.memory.clone();
        linker
            .func_wrap(
                &self.config.abi.print_module,
                &self.config.abi.print_name,
                move |mut caller: Caller<'_, WorkerState>,
                      address: u32,
                      length: u32,
                      is_error: u32|
                      -> wasmtime::Result<()> {
                    let memory = caller
                        .get_export(&memory_export)
                        .and_then(Extern::into_memory)
                        .ok_or_else(|| {
                            anyhow::anyhow!("guest does not export `{memory_export}`")
                        })?;
                    let (data, state) = memory.data_and_store_mut(&mut caller);
                    if let Some(sink) = state.sink.as_mut() {
                        sink.on_output(data, address, length, is_error != 0)?;
                    }
                    Ok(())
                },
            )
            .map_err(Error::Wasm)?;
        // Imports outside the bridge ABI only fail if the guest actually calls them.
        linker
            .define_unknown_imports_as_traps(&self.module)
            .map_err(Error::Wasm)?;
        Ok(linker)
    }

    /// Create a fresh instance with its own memory.
    ///
    /// # Errors
    /// Returns an error if instantiation fails or an ABI export has the wrong
    /// type.
    pub fn instantiate(&self, kill: KillSwitch) -> Result<WasmRuntime> {
        let _span = info_span!(target: TRACE_TARGET_WORKER, "template.instantiate").entered();
        let abi = &self.config.abi;

        let mut store = Store::new(
            &self.engine,
            WorkerState {
                limiter: MemoryLimiter::new(self.config.max_memory),
                sink: None,
            },
        );
        store.limiter(|state| &mut state.limiter);
        // Other sessions of this engine see the bump too; their callbacks
        // find their own switch untriggered and extend the deadline.
        store.set_epoch_deadline(1);
        let engine = self.engine.clone();
        kill.on_trigger(move || engine.increment_epoch());
        let epoch_kill = kill.clone();
        store.epoch_deadline_callback(move |_store| {
            if epoch_kill.is_triggered() {
                Err(anyhow::Error::new(Error::Terminated))
            } else {
                Ok(UpdateDeadline::Continue(1))
            }
        });

        let linker = self.new_linker()?;
        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(Error::Wasm)?;

        let memory = instance
            .get_memory(&mut store, &abi.memory)
            .ok_or_else(|| Error::Wasm(anyhow::anyhow!("`{}` is not a memory", abi.memory)))?;
        let alloc = instance
            .get_typed_func::<u32, u32>(&mut store, &abi.alloc)
            .map_err(Error::Wasm)?;
        let free = instance
            .get_typed_func::<u32, ()>(&mut store, &abi.free)
            .map_err(Error::Wasm)?;
        let run = instance
            .get_typed_func::<u32, ()>(&mut store, &abi.run)
            .map_err(Error::Wasm)?;
        let init = match abi.init.as_deref() {
            Some(name) => instance
                .get_func(&mut store, name)
                .map(|func| func.typed::<(), ()>(&store))
                .transpose()
                .map_err(Error::Wasm)?,
            None => None,
        };

        Ok(WasmRuntime {
            store,
            memory,
            alloc,
            free,
            run,
            init,
            kill,
        })
    }
}

impl RuntimeFactory for WasmTemplate {
    type Runtime = WasmRuntime;

    fn create(&self, kill: KillSwitch) -> Result<Self::Runtime> {
        self.instantiate(kill)
    }
}

struct WorkerState {
    limiter: MemoryLimiter,
    sink: Option<Box<dyn OutputCallback>>,
}

/// RAII guard that installs the output callback for one guest call and
/// clears it when dropped, even if the call traps.
struct CallCleanup<'a> {
    store: &'a mut Store<WorkerState>,
}

impl<'a> CallCleanup<'a> {
    fn new(store: &'a mut Store<WorkerState>, sink: Box<dyn OutputCallback>) -> Self {
        store.data_mut().sink = Some(sink);
        Self { store }
    }
}

impl Drop for CallCleanup<'_> {
    fn drop(&mut self) {
        self.store.data_mut().sink = None;
    }
}

impl AsContext for CallCleanup<'_> {
    type Data = WorkerState;

    fn as_context(&self) -> StoreContext<'_, Self::Data> {
        self.store.as_context()
    }
}

impl AsContextMut for CallCleanup<'_> {
    fn as_context_mut(&mut self) -> StoreContextMut<'_, Self::Data> {
        self.store.as_context_mut()
    }
}

/// One live guest instance.
pub struct WasmRuntime {
    store: Store<WorkerState>,
    memory: Memory,
    alloc: TypedFunc<u32, u32>,
    free: TypedFunc<u32, ()>,
    run: TypedFunc<u32, ()>,
    init: Option<TypedFunc<(), ()>>,
    kill: KillSwitch,
}

impl WasmRuntime {
    /// Current size of the guest's linear memory in bytes.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.store.data().limiter.current()
    }

    fn fault(&self, err: anyhow::Error) -> Error {
        if self.kill.is_triggered() {
            Error::Terminated
        } else {
            Error::Wasm(err)
        }
    }
}

impl GuestMemory for WasmRuntime {
    fn allocate(&mut self, byte_length: u32) -> Result<u32> {
        let address = self
            .alloc
            .call(&mut self.store, byte_length)
            .map_err(|err| self.fault(err))?;
        if address == 0 {
            return Err(Error::Allocation(byte_length));
        }
        Ok(address)
    }

    fn release(&mut self, address: u32) -> Result<()> {
        self.free
            .call(&mut self.store, address)
            .map_err(|err| self.fault(err))
    }

    fn data(&self) -> &[u8] {
        self.memory.data(&self.store)
    }

    fn data_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut(&mut self.store)
    }
}

impl Runtime for WasmRuntime {
    fn initialize(&mut self) -> Result<()> {
        if let Some(init) = &self.init {
            init.call(&mut self.store, ())
                .map_err(|err| self.fault(err))?;
        }
        Ok(())
    }

    fn execute(&mut self, address: u32, callback: Box<dyn OutputCallback>) -> Result<()> {
        let mut store = CallCleanup::new(&mut self.store, callback);
        let result = self.run.call(&mut store, address);
        drop(store);
        result.map_err(|err| self.fault(err))
    }
}
