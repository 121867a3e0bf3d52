//! wasmtime integration: engine construction, shim installation into the
//! import table, and the CRuby guest evaluator.

use std::env;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use wasmtime::{
    Cache, Caller, Config, Engine, Extern, Func, Linker, Memory, Module, OptLevel, Store,
    TypedFunc, Val,
};
use wasmtime_wasi::p1::WasiP1Ctx;
use wasmtime_wasi::{WasiCtxBuilder, p1};

use crate::debug_log;
use crate::error::{EngineError, GuestError, MemoryError};
use crate::memory::{GuestBuffer, MemoryBacking};
use crate::pipeline::{GuestEvaluator, GuestInstantiator};
use crate::shim::{OutputSink, SyscallShim};

const WASI_MODULE: &str = "wasi_snapshot_preview1";

pub fn build_engine() -> Result<Engine> {
    let mut config = Config::new();
    let cache_toggle = env::var("RBWASM_CACHE").ok();
    let max_stack = env::var("RBWASM_MAX_STACK")
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .filter(|val| *val > 0)
        .unwrap_or(16 * 1024 * 1024);
    config.max_wasm_stack(max_stack);
    // wasmtime validates max_wasm_stack <= async_stack_size whenever its
    // async feature is compiled in (wasmtime-wasi p1 enables it), even though
    // async_support stays off and no async stacks are ever allocated.
    config.async_stack_size(max_stack.max(2 << 20));
    debug_log(|| format!("wasmtime max_wasm_stack set to {max_stack}"));
    if cache_toggle.as_deref() != Some("0") {
        let cache_path = env::var("RBWASM_CACHE_CONFIG").ok();
        if cache_toggle.as_deref() == Some("1") || cache_path.is_some() {
            let cache = match cache_path.as_deref() {
                Some(path) => Cache::from_file(Some(Path::new(path)))?,
                None => Cache::from_file(None)?,
            };
            config.cache(Some(cache));
            debug_log(|| "wasmtime cache enabled".to_string());
        }
    }
    if matches!(env::var("RBWASM_COMPILE_FAST").as_deref(), Ok("1")) {
        config.cranelift_opt_level(OptLevel::None);
        debug_log(|| "wasmtime opt level set to none".to_string());
    }
    Ok(Engine::new(&config)?)
}

/// One engine per process so cached modules and stores stay compatible.
pub fn shared_engine() -> Result<Engine> {
    static ENGINE: OnceLock<Engine> = OnceLock::new();
    if let Some(engine) = ENGINE.get() {
        return Ok(engine.clone());
    }
    let engine = build_engine()?;
    Ok(ENGINE.get_or_init(|| engine).clone())
}

pub struct HostState {
    wasi: WasiP1Ctx,
}

impl HostState {
    pub fn new() -> Result<Self> {
        Ok(Self {
            wasi: build_wasi_ctx()?,
        })
    }
}

fn build_wasi_ctx() -> Result<WasiP1Ctx> {
    // Stdout/stderr writes never reach these: fd_write on 1/2 is emulated.
    // The real streams stay behind the shim so delegated calls (filestat on
    // other fds, reads) keep working.
    let mut builder = WasiCtxBuilder::new();
    builder.inherit_stdio();
    builder.arg("ruby");
    Ok(builder.build_p1())
}

/// Live geometry of the guest's linear memory, refreshed at every host-call
/// entry. When the geometry changes (growth moved or resized the buffer) the
/// previously issued region is detached: its length reads as zero, which is
/// the signal the memory view rebuilds on.
#[derive(Default)]
pub struct MemoryWindow {
    base: AtomicUsize,
    len: AtomicUsize,
    issued: Mutex<Option<Arc<IssuedRegion>>>,
}

struct IssuedRegion {
    base: usize,
    len: AtomicUsize,
}

impl MemoryWindow {
    pub fn refresh(&self, base: usize, len: usize) {
        // Both swaps must run even when the first already proves a change,
        // otherwise the window keeps a stale length alongside the new base.
        let prev_base = self.base.swap(base, Ordering::SeqCst);
        let prev_len = self.len.swap(len, Ordering::SeqCst);
        if prev_base != base || prev_len != len {
            if let Some(region) = self.issued.lock().unwrap().as_ref() {
                region.len.store(0, Ordering::SeqCst);
            }
        }
    }
}

/// Memory backing over the current window. Regions are only dereferenced
/// inside a host call, after the window was refreshed for that call; the
/// store is single-threaded, so the geometry cannot change under a live
/// region.
pub struct RawMemoryBacking {
    window: Arc<MemoryWindow>,
}

impl RawMemoryBacking {
    pub fn new(window: Arc<MemoryWindow>) -> Self {
        Self { window }
    }
}

impl MemoryBacking for RawMemoryBacking {
    type Buffer = RawRegion;

    fn buffer(&self) -> RawRegion {
        let region = Arc::new(IssuedRegion {
            base: self.window.base.load(Ordering::SeqCst),
            len: AtomicUsize::new(self.window.len.load(Ordering::SeqCst)),
        });
        *self.window.issued.lock().unwrap() = Some(region.clone());
        RawRegion { region }
    }
}

pub struct RawRegion {
    region: Arc<IssuedRegion>,
}

impl RawRegion {
    fn bounds_check(&self, offset: usize, len: usize) -> Result<usize, MemoryError> {
        let size = self.region.len.load(Ordering::SeqCst);
        if offset.checked_add(len).is_none_or(|end| end > size) {
            return Err(MemoryError::OutOfBounds { offset, len, size });
        }
        Ok(self.region.base + offset)
    }
}

impl GuestBuffer for RawRegion {
    fn byte_len(&self) -> usize {
        self.region.len.load(Ordering::SeqCst)
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), MemoryError> {
        let src = self.bounds_check(offset, out.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        let dst = self.bounds_check(offset, bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst as *mut u8, bytes.len());
        }
        Ok(())
    }
}

struct WasiOriginals {
    fd_write: Func,
    fd_filestat_get: Func,
    fd_fdstat_get: Func,
}

fn capture_original(
    linker: &Linker<HostState>,
    store: &mut Store<HostState>,
    name: &str,
) -> Result<Func> {
    linker
        .get(&mut *store, WASI_MODULE, name)
        .and_then(Extern::into_func)
        .with_context(|| format!("missing {WASI_MODULE}.{name} import"))
}

fn call_errno(func: Func, caller: &mut Caller<'_, HostState>, args: &[Val]) -> Result<i32> {
    let mut results = [Val::I32(0)];
    func.call(caller, args, &mut results)?;
    match results[0] {
        Val::I32(code) => Ok(code),
        _ => bail!("unexpected wasi result type"),
    }
}

fn refresh_window(caller: &mut Caller<'_, HostState>, window: &MemoryWindow) -> Result<()> {
    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .context("guest memory not exported")?;
    let base = memory.data_ptr(&caller) as usize;
    let len = memory.data_size(&caller);
    window.refresh(base, len);
    Ok(())
}

/// Replaces `fd_write`, `fd_filestat_get`, and `fd_fdstat_get` in the import
/// table with wrappers that hold immutable references to the originals and
/// emulate only the standard-stream descriptors. Call after the WASI imports
/// are defined and before instantiation.
pub fn install_shim(
    linker: &mut Linker<HostState>,
    store: &mut Store<HostState>,
    shim: Arc<SyscallShim<RawMemoryBacking>>,
    window: Arc<MemoryWindow>,
) -> Result<()> {
    let originals = WasiOriginals {
        fd_write: capture_original(linker, store, "fd_write")?,
        fd_filestat_get: capture_original(linker, store, "fd_filestat_get")?,
        fd_fdstat_get: capture_original(linker, store, "fd_fdstat_get")?,
    };
    linker.allow_shadowing(true);

    let write_shim = shim.clone();
    let write_window = window.clone();
    let original_write = originals.fd_write;
    linker.func_wrap(
        WASI_MODULE,
        "fd_write",
        move |mut caller: Caller<'_, HostState>,
              fd: i32,
              iovs: i32,
              iovs_len: i32,
              nwritten: i32|
              -> wasmtime::Result<i32> {
            refresh_window(&mut caller, &write_window).map_err(wasmtime::Error::from_anyhow)?;
            let original = original_write.clone();
            write_shim
                .fd_write(fd, iovs as u32, iovs_len as u32, nwritten as u32, || {
                    call_errno(
                        original,
                        &mut caller,
                        &[
                            Val::I32(fd),
                            Val::I32(iovs),
                            Val::I32(iovs_len),
                            Val::I32(nwritten),
                        ],
                    )
                })
                .map_err(wasmtime::Error::from_anyhow)
        },
    )?;

    let filestat_shim = shim.clone();
    let filestat_window = window.clone();
    let original_filestat = originals.fd_filestat_get;
    linker.func_wrap(
        WASI_MODULE,
        "fd_filestat_get",
        move |mut caller: Caller<'_, HostState>, fd: i32, buf: i32| -> wasmtime::Result<i32> {
            refresh_window(&mut caller, &filestat_window).map_err(wasmtime::Error::from_anyhow)?;
            let original = original_filestat.clone();
            filestat_shim
                .fd_filestat_get(fd, buf as u32, || {
                    call_errno(original, &mut caller, &[Val::I32(fd), Val::I32(buf)])
                })
                .map_err(wasmtime::Error::from_anyhow)
        },
    )?;

    let fdstat_shim = shim;
    let fdstat_window = window;
    let original_fdstat = originals.fd_fdstat_get;
    linker.func_wrap(
        WASI_MODULE,
        "fd_fdstat_get",
        move |mut caller: Caller<'_, HostState>, fd: i32, buf: i32| -> wasmtime::Result<i32> {
            refresh_window(&mut caller, &fdstat_window).map_err(wasmtime::Error::from_anyhow)?;
            let original = original_fdstat.clone();
            fdstat_shim
                .fd_fdstat_get(fd, buf as u32, || {
                    call_errno(original, &mut caller, &[Val::I32(fd), Val::I32(buf)])
                })
                .map_err(wasmtime::Error::from_anyhow)
        },
    )?;

    Ok(())
}

/// Builds a store with WASI, installs the shim, and instantiates the module.
/// Returns the ready store/instance pair plus the exported memory, with the
/// shim already bound to it.
pub fn instantiate_with_shim(
    engine: &Engine,
    module: &Module,
    sink: Arc<dyn OutputSink>,
) -> Result<(Store<HostState>, wasmtime::Instance, Memory)> {
    let mut store = Store::new(engine, HostState::new()?);
    let mut linker: Linker<HostState> = Linker::new(engine);
    p1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)?;

    let window = Arc::new(MemoryWindow::default());
    let shim = Arc::new(SyscallShim::new(sink));
    install_shim(&mut linker, &mut store, shim.clone(), window.clone())?;

    let instance = linker
        .instantiate(&mut store, module)
        .map_err(anyhow::Error::from)
        .context("instantiate guest module")?;
    let memory = instance
        .get_memory(&mut store, "memory")
        .context("guest module does not export memory")?;

    // Bind-before-use: the view gets its live memory reference as soon as
    // instantiation completes, before any guest code can write.
    window.refresh(memory.data_ptr(&store) as usize, memory.data_size(&store));
    shim.bind_memory(RawMemoryBacking::new(window));

    Ok((store, instance, memory))
}

/// The instantiated CRuby guest, evaluating source through the C-API exports.
pub struct RubyVm {
    store: Store<HostState>,
    memory: Memory,
    malloc: TypedFunc<i32, i32>,
    free: Option<TypedFunc<i32, ()>>,
    eval_protect: TypedFunc<(i32, i32), i32>,
    errinfo: TypedFunc<(), i32>,
    obj_as_string: TypedFunc<i32, i32>,
    string_value_cstr: TypedFunc<i32, i32>,
}

impl RubyVm {
    pub fn instantiate(engine: &Engine, module: &Module, sink: Arc<dyn OutputSink>) -> Result<Self> {
        let (mut store, instance, memory) = instantiate_with_shim(engine, module, sink)?;

        // Reactor initialization runs wasi-libc ctors before any Ruby entry.
        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            init.call(&mut store, ())?;
        }
        let ruby_init = instance
            .get_typed_func::<(), ()>(&mut store, "ruby_init")
            .map_err(anyhow::Error::from)
            .context("missing ruby_init export")?;
        ruby_init
            .call(&mut store, ())
            .map_err(anyhow::Error::from)
            .context("ruby_init")?;
        if let Ok(loadpath) = instance.get_typed_func::<(), ()>(&mut store, "ruby_init_loadpath") {
            loadpath
                .call(&mut store, ())
                .map_err(anyhow::Error::from)
                .context("ruby_init_loadpath")?;
        }
        debug_log(|| "ruby vm initialized".to_string());

        let malloc = instance
            .get_typed_func::<i32, i32>(&mut store, "malloc")
            .map_err(anyhow::Error::from)
            .context("missing malloc export")?;
        let free = instance.get_typed_func::<i32, ()>(&mut store, "free").ok();
        let eval_protect = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, "rb_eval_string_protect")
            .map_err(anyhow::Error::from)
            .context("missing rb_eval_string_protect export")?;
        let errinfo = instance
            .get_typed_func::<(), i32>(&mut store, "rb_errinfo")
            .map_err(anyhow::Error::from)
            .context("missing rb_errinfo export")?;
        let obj_as_string = instance
            .get_typed_func::<i32, i32>(&mut store, "rb_obj_as_string")
            .map_err(anyhow::Error::from)
            .context("missing rb_obj_as_string export")?;
        let string_value_cstr = instance
            .get_typed_func::<i32, i32>(&mut store, "rb_string_value_cstr")
            .map_err(anyhow::Error::from)
            .context("missing rb_string_value_cstr export")?;

        Ok(Self {
            store,
            memory,
            malloc,
            free,
            eval_protect,
            errinfo,
            obj_as_string,
            string_value_cstr,
        })
    }

    fn alloc_bytes(&mut self, bytes: &[u8]) -> Result<i32> {
        let ptr = self.malloc.call(&mut self.store, bytes.len() as i32)?;
        if ptr == 0 {
            bail!("guest malloc failed for {} bytes", bytes.len());
        }
        self.memory.write(&mut self.store, ptr as usize, bytes)?;
        Ok(ptr)
    }

    fn release(&mut self, ptr: i32) -> Result<()> {
        if let Some(free) = &self.free {
            free.call(&mut self.store, ptr)?;
        }
        Ok(())
    }

    fn read_cstring(&mut self, ptr: i32) -> Result<String> {
        let data = self.memory.data(&self.store);
        let start = ptr as usize;
        if start >= data.len() {
            bail!("string pointer {ptr} out of bounds");
        }
        let tail = &data[start..];
        let end = tail
            .iter()
            .position(|byte| *byte == 0)
            .ok_or_else(|| anyhow!("unterminated guest string at {ptr}"))?;
        Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
    }

    fn value_to_string(&mut self, value: i32) -> Result<String> {
        let string_value = self.obj_as_string.call(&mut self.store, value)?;
        // rb_string_value_cstr takes a VALUE* and may replace the VALUE.
        let cell = self.alloc_bytes(&string_value.to_le_bytes())?;
        let result = self
            .string_value_cstr
            .call(&mut self.store, cell)
            .map_err(anyhow::Error::from)
            .and_then(|cstr| self.read_cstring(cstr));
        self.release(cell)?;
        result
    }

    fn eval_inner(&mut self, source: &str) -> Result<Result<String, GuestError>> {
        let mut script = source.as_bytes().to_vec();
        script.push(0);
        let script_ptr = self.alloc_bytes(&script)?;
        let state_ptr = self.alloc_bytes(&0i32.to_le_bytes())?;

        let value = self
            .eval_protect
            .call(&mut self.store, (script_ptr, state_ptr))?;

        let mut state_buf = [0u8; 4];
        self.memory
            .read(&self.store, state_ptr as usize, &mut state_buf)?;
        let state = i32::from_le_bytes(state_buf);

        self.release(state_ptr)?;
        self.release(script_ptr)?;

        if state != 0 {
            let exception = self.errinfo.call(&mut self.store, ())?;
            let message = self.value_to_string(exception)?;
            return Ok(Err(GuestError::new(message)));
        }
        Ok(Ok(self.value_to_string(value)?))
    }
}

impl GuestEvaluator for RubyVm {
    fn eval(&mut self, source: &str) -> Result<String, GuestError> {
        match self.eval_inner(source) {
            Ok(result) => result,
            Err(err) => Err(GuestError::new(format!("{err:#}"))),
        }
    }
}

/// Production instantiator: the automatic path, instantiating through the
/// shimmed linker.
pub struct WasmtimeInstantiator {
    engine: Engine,
}

impl WasmtimeInstantiator {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl GuestInstantiator for WasmtimeInstantiator {
    async fn instantiate(
        &self,
        module: &Module,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Box<dyn GuestEvaluator>, EngineError> {
        let vm = RubyVm::instantiate(&self.engine, module, sink)
            .map_err(|cause| EngineError::host("instantiate guest", cause))?;
        Ok(Box::new(vm))
    }
}
