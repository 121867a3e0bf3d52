//! Fetches and compiles the guest module exactly once, caching the compiled
//! artifact.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use wasmtime::{Engine, Module};

use crate::debug_log;
use crate::error::{ModuleLoadError, ModuleStep};
use crate::once::OnceState;

/// Retrieves the raw module bytes. The two suspension points (issuing the
/// request, draining the body) report as distinct steps so a failure names
/// where it happened.
#[async_trait]
pub trait ModuleSource: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, ModuleLoadError>;
}

pub struct HttpModuleSource {
    client: reqwest::Client,
}

impl HttpModuleSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpModuleSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModuleSource for HttpModuleSource {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, ModuleLoadError> {
        let step_err = |step: ModuleStep, cause: reqwest::Error| ModuleLoadError {
            step,
            url: url.to_string(),
            cause: cause.into(),
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|cause| step_err(ModuleStep::Fetch, cause))?;
        let body = response
            .bytes()
            .await
            .map_err(|cause| step_err(ModuleStep::Buffer, cause))?;
        Ok(body.to_vec())
    }
}

/// Memoized module acquisition: the first caller pays the full
/// fetch/buffer/compile cost, later callers get the cached artifact. Nothing
/// is cached on failure; the next call retries from the fetch.
pub struct ModuleProvider {
    engine: Engine,
    url: String,
    source: Arc<dyn ModuleSource>,
    module: OnceState<Module>,
}

impl ModuleProvider {
    pub fn new(engine: Engine, url: String, source: Arc<dyn ModuleSource>) -> Self {
        Self {
            engine,
            url,
            source,
            module: OnceState::new(),
        }
    }

    /// Process-wide provider arena, keyed by module locator.
    pub fn shared(engine: Engine, url: &str) -> Arc<ModuleProvider> {
        static PROVIDERS: OnceLock<Mutex<HashMap<String, Arc<ModuleProvider>>>> = OnceLock::new();
        let mut providers = PROVIDERS
            .get_or_init(|| Mutex::new(HashMap::new()))
            .lock()
            .unwrap();
        providers
            .entry(url.to_string())
            .or_insert_with(|| {
                Arc::new(ModuleProvider::new(
                    engine,
                    url.to_string(),
                    Arc::new(HttpModuleSource::new()),
                ))
            })
            .clone()
    }

    pub async fn get_module(&self) -> Result<Module, ModuleLoadError> {
        self.module
            .get_or_try_init(|| async {
                let fetch_start = Instant::now();
                let bytes = self.source.fetch_bytes(&self.url).await?;
                debug_log(|| {
                    format!(
                        "fetched {} ({} bytes) in {:?}",
                        self.url,
                        bytes.len(),
                        fetch_start.elapsed()
                    )
                });
                let compile_start = Instant::now();
                let module =
                    Module::new(&self.engine, &bytes).map_err(|cause| ModuleLoadError {
                        step: ModuleStep::Compile,
                        url: self.url.clone(),
                        cause: cause.into(),
                    })?;
                debug_log(|| format!("compiled {} in {:?}", self.url, compile_start.elapsed()));
                Ok(module)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;

    use super::*;
    use crate::vm::build_engine;

    /// Smallest valid wasm binary: just the magic and version header.
    const EMPTY_MODULE: &[u8] = b"\0asm\x01\0\0\0";

    struct ScriptedSource {
        calls: AtomicUsize,
        fail_first: bool,
        payload: Vec<u8>,
    }

    #[async_trait]
    impl ModuleSource for ScriptedSource {
        async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, ModuleLoadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(ModuleLoadError {
                    step: ModuleStep::Fetch,
                    url: url.to_string(),
                    cause: anyhow!("connection reset"),
                });
            }
            Ok(self.payload.clone())
        }
    }

    fn provider(fail_first: bool, payload: &[u8]) -> (ModuleProvider, Arc<ScriptedSource>) {
        let source = Arc::new(ScriptedSource {
            calls: AtomicUsize::new(0),
            fail_first,
            payload: payload.to_vec(),
        });
        let provider = ModuleProvider::new(
            build_engine().expect("engine"),
            "https://cdn.test/ruby.wasm".to_string(),
            source.clone(),
        );
        (provider, source)
    }

    #[tokio::test]
    async fn compiles_once_and_caches() {
        let (provider, source) = provider(false, EMPTY_MODULE);
        provider.get_module().await.expect("first");
        provider.get_module().await.expect("second");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_retries_from_the_fetch() {
        let (provider, source) = provider(true, EMPTY_MODULE);
        let err = provider.get_module().await.expect_err("first must fail");
        assert_eq!(err.step, ModuleStep::Fetch);
        assert_eq!(err.url, "https://cdn.test/ruby.wasm");
        provider.get_module().await.expect("retry succeeds");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn compile_failure_names_the_step() {
        let (provider, _source) = provider(false, b"not wasm at all");
        let err = provider.get_module().await.expect_err("must fail");
        assert_eq!(err.step, ModuleStep::Compile);
    }
}
