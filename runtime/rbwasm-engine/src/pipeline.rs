//! The staged bootstrap that prepares a guest for evaluation.
//!
//! Stages run strictly in declaration order; the first failure aborts the
//! remainder. A fresh bootstrap attempt starts over, but the memoized loader
//! and provider results are honored, so the expensive acquisitions still
//! happen at most once per process.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use wasmtime::Module;

use crate::debug_log;
use crate::error::{EngineError, GuestError};
use crate::loader::ResourceLoader;
use crate::provider::ModuleProvider;
use crate::shim::OutputSink;
use crate::vfs::{CaptureFs, VirtualFs};

/// Evaluation run during "initializing" so guest string results decode
/// consistently.
pub const DEFAULT_EXTERNAL_ENCODING: &str = "Encoding.default_external = Encoding::UTF_8";

/// Notified with each stage's label before the stage runs. The collaborator
/// decides how to surface the names (UI, logs).
pub trait ProgressObserver: Send + Sync {
    fn stage(&self, label: &str);
}

/// Observer that surfaces nothing.
pub struct SilentObserver;

impl ProgressObserver for SilentObserver {
    fn stage(&self, _label: &str) {}
}

/// The guest-side evaluator, an external collaborator: takes source text,
/// returns the guest result converted to text, or the guest's own failure
/// message unnormalized.
pub trait GuestEvaluator: Send {
    fn eval(&mut self, source: &str) -> Result<String, GuestError>;
}

/// Produces an instantiated, ready-to-evaluate guest from a compiled module.
#[async_trait]
pub trait GuestInstantiator: Send + Sync {
    async fn instantiate(
        &self,
        module: &Module,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Box<dyn GuestEvaluator>, EngineError>;
}

/// Typed handles to the loaded support libraries, bound during "early load"
/// (explicit injection instead of discovery by name).
pub struct LoadedLibraries {
    pub ruby_wasm_wasi: Arc<[u8]>,
    pub wasmfs: Arc<[u8]>,
    pub wasi: Arc<[u8]>,
}

impl LoadedLibraries {
    pub fn bind(payloads: &[Arc<[u8]>]) -> Result<Self, EngineError> {
        match payloads {
            [ruby_wasm_wasi, wasmfs, wasi] => Ok(Self {
                ruby_wasm_wasi: ruby_wasm_wasi.clone(),
                wasmfs: wasmfs.clone(),
                wasi: wasi.clone(),
            }),
            other => Err(EngineError::host(
                "bind support libraries",
                anyhow::anyhow!("expected 3 payloads, loader produced {}", other.len()),
            )),
        }
    }
}

/// A fully bootstrapped guest: the evaluator plus the filesystem adapter with
/// the spliced write capture.
pub struct BootedGuest {
    pub vm: Box<dyn GuestEvaluator>,
    pub fs: CaptureFs,
}

pub struct Bootstrap {
    loader: Arc<ResourceLoader>,
    provider: Arc<ModuleProvider>,
    instantiator: Arc<dyn GuestInstantiator>,
    observer: Arc<dyn ProgressObserver>,
    sink: Arc<dyn OutputSink>,
}

impl Bootstrap {
    pub fn new(
        loader: Arc<ResourceLoader>,
        provider: Arc<ModuleProvider>,
        instantiator: Arc<dyn GuestInstantiator>,
        observer: Arc<dyn ProgressObserver>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            loader,
            provider,
            instantiator,
            observer,
            sink,
        }
    }

    pub async fn run(&self) -> Result<BootedGuest, EngineError> {
        let payloads = self
            .stage("downloading scripts", async {
                self.loader.ensure_loaded().await.map_err(EngineError::from)
            })
            .await?;

        let fs = self
            .stage("early load", async {
                let libraries = LoadedLibraries::bind(&payloads)?;
                debug_log(|| {
                    format!(
                        "support libraries bound: ruby-wasm-wasi {}B, wasmfs {}B, wasi {}B",
                        libraries.ruby_wasm_wasi.len(),
                        libraries.wasmfs.len(),
                        libraries.wasi.len()
                    )
                });
                Ok(CaptureFs::new(VirtualFs::new(), self.sink.clone()))
            })
            .await?;

        let module = self
            .stage("downloading ruby", async {
                self.provider.get_module().await.map_err(EngineError::from)
            })
            .await?;

        // Reserved for manual instantiation wiring; the automatic path below
        // performs instantiation inside "initializing".
        self.stage("instantiating", async { Ok(()) }).await?;

        let vm = self
            .stage("initializing", async {
                let mut vm = self
                    .instantiator
                    .instantiate(&module, self.sink.clone())
                    .await?;
                vm.eval(DEFAULT_EXTERNAL_ENCODING)
                    .map_err(|err| EngineError::GuestEvaluation {
                        message: err.message,
                    })?;
                Ok(vm)
            })
            .await?;

        Ok(BootedGuest { vm, fs })
    }

    async fn stage<T>(
        &self,
        label: &'static str,
        action: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        self.observer.stage(label);
        debug_log(|| format!("stage: {label}"));
        action.await
    }
}
