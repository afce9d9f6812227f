//! RustPython compiled to WASI, hosted on wasmtime.
//!
//! The guest gets no preopened directories, no sockets and no environment.
//! Its only channels are the argument vector carrying the snippet and two
//! in-memory output pipes. Linear memory is capped per run, and a background
//! ticker advances the engine epoch so a spinning guest is interrupted at
//! its deadline instead of relying on the guest to cooperate.

use std::fmt::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info};
use wasmtime::{
    Config as WasmConfig, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap,
    UpdateDeadline,
};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};

use crate::sandbox::{RawOutput, SandboxError};

/// Granularity of deadline and cancel checks.
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Per-run host state.
struct Guest {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
    deadline: Instant,
    cancel: Arc<AtomicBool>,
}

/// A compiled interpreter module, shared by every worker.
pub(super) struct PythonRuntime {
    engine: Engine,
    linker: Linker<Guest>,
    module: Module,
    memory_limit: usize,
    _ticker: EpochTicker,
}

impl PythonRuntime {
    /// Compiles the module at `path`. Slow for a full interpreter, so this
    /// happens once per backend.
    pub(super) fn load(path: &Path, memory_limit: usize) -> Result<Self, SandboxError> {
        let mut config = WasmConfig::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config)
            .map_err(|e| SandboxError::runtime_unavailable(format!("wasm engine: {e:#}")))?;

        info!("Compiling embedded Python module {}", path.display());
        let module = Module::from_file(&engine, path)
            .map_err(|e| SandboxError::runtime_unavailable(format!("{}: {e:#}", path.display())))?;

        let mut linker = Linker::new(&engine);
        preview1::add_to_linker_sync(&mut linker, |guest: &mut Guest| &mut guest.wasi)
            .map_err(|e| SandboxError::runtime_unavailable(format!("WASI imports: {e:#}")))?;

        let ticker = EpochTicker::start(engine.clone())?;

        Ok(Self {
            engine,
            linker,
            module,
            memory_limit,
            _ticker: ticker,
        })
    }

    /// Runs `code` as `python -c code` on the calling thread.
    ///
    /// Returns `Ok(None)` when the guest was interrupted because `deadline`
    /// passed or `cancel` was raised.
    pub(super) fn execute(
        &self,
        code: &str,
        deadline: Instant,
        cancel: Arc<AtomicBool>,
        max_output_bytes: usize,
    ) -> Result<Option<RawOutput>, SandboxError> {
        let stdout = MemoryOutputPipe::new(max_output_bytes);
        let stderr = MemoryOutputPipe::new(max_output_bytes);

        let mut wasi = WasiCtxBuilder::new();
        wasi.stdin(MemoryInputPipe::new(Bytes::new()))
            .stdout(stdout.clone())
            .stderr(stderr.clone())
            .args(&["python", "-c", code]);

        let guest = Guest {
            wasi: wasi.build_p1(),
            limits: StoreLimitsBuilder::new()
                .memory_size(self.memory_limit)
                .instances(1)
                .build(),
            deadline,
            cancel,
        };

        let mut store = Store::new(&self.engine, guest);
        store.limiter(|guest| &mut guest.limits);
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(|ctx| {
            let guest = ctx.data();
            if guest.cancel.load(Ordering::Relaxed) || Instant::now() >= guest.deadline {
                Err(Trap::Interrupt.into())
            } else {
                Ok(UpdateDeadline::Continue(1))
            }
        });

        let instance = self
            .linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| SandboxError::worker_failed(format!("instantiate interpreter: {e:#}")))?;
        let start = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(|e| SandboxError::worker_failed(format!("interpreter entry point: {e:#}")))?;

        let mut trap = None;
        let exit_code = match start.call(&mut store, ()) {
            Ok(()) => 0,
            Err(e) => {
                if let Some(exit) = e.downcast_ref::<I32Exit>() {
                    i64::from(exit.0)
                } else if matches!(e.downcast_ref::<Trap>(), Some(Trap::Interrupt)) {
                    debug!("Embedded interpreter interrupted");
                    return Ok(None);
                } else {
                    // Stack exhaustion, memory exhaustion and the like are
                    // failures of the snippet, not of the host.
                    trap = Some(format!("{e:#}"));
                    1
                }
            }
        };
        drop(store);

        // A full pipe refuses further writes, so reaching capacity means the
        // guest wanted to write more.
        let stdout = stdout.contents();
        let stderr = stderr.contents();
        let truncated = stdout.len() >= max_output_bytes || stderr.len() >= max_output_bytes;

        let mut stderr = String::from_utf8_lossy(&stderr).into_owned();
        if let Some(trap) = trap {
            let _ = writeln!(stderr, "\nInterpreter aborted: {trap}");
        }

        Ok(Some(RawOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr,
            exit_code,
            truncated,
        }))
    }
}

/// Advances the engine epoch every [`EPOCH_TICK`] until dropped.
struct EpochTicker {
    stop: Arc<AtomicBool>,
}

impl EpochTicker {
    fn start(engine: Engine) -> Result<Self, SandboxError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        std::thread::Builder::new()
            .name("execbox-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self { stop })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
