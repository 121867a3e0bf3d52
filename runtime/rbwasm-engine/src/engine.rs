//! The public runner: lazy bootstrap plus evaluation with normalized guest
//! failures.

use std::sync::Arc;

use serde::Deserialize;

use crate::error::EngineError;
use crate::loader::ResourceLoader;
use crate::pipeline::{BootedGuest, Bootstrap, ProgressObserver};
use crate::provider::ModuleProvider;
use crate::shim::OutputSink;
use crate::vm::{WasmtimeInstantiator, shared_engine};

pub const DEFAULT_MODULE_URL: &str =
    "https://cdn.jsdelivr.net/npm/@ruby/3.2-wasm-wasi@2.7.1/dist/ruby+stdlib.wasm";
pub const DEFAULT_RUBY_VERSION: &str = "3.2";

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_module_url")]
    pub module_url: String,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_module_url() -> String {
    DEFAULT_MODULE_URL.to_string()
}

fn default_version() -> String {
    DEFAULT_RUBY_VERSION.to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            module_url: default_module_url(),
            version: default_version(),
        }
    }
}

/// Runs Ruby source on the wasm guest. The first `run` pays the bootstrap
/// cost; the instantiated guest is reused for every later call.
pub struct CRubyEngine {
    config: EngineConfig,
    bootstrap: Bootstrap,
    guest: Option<BootedGuest>,
}

impl CRubyEngine {
    pub fn new(
        config: EngineConfig,
        sink: Arc<dyn OutputSink>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<Self, EngineError> {
        let engine =
            shared_engine().map_err(|cause| EngineError::host("build wasmtime engine", cause))?;
        let loader = ResourceLoader::shared();
        let provider = ModuleProvider::shared(engine.clone(), &config.module_url);
        let instantiator = Arc::new(WasmtimeInstantiator::new(engine));
        let bootstrap = Bootstrap::new(loader, provider, instantiator, observer, sink);
        Ok(Self::with_parts(config, bootstrap))
    }

    /// Assembles the runner from explicit collaborators.
    pub fn with_parts(config: EngineConfig, bootstrap: Bootstrap) -> Self {
        Self {
            config,
            bootstrap,
            guest: None,
        }
    }

    pub fn name(&self) -> String {
        format!("CRuby {}", self.config.version)
    }

    pub fn engine_id(&self) -> String {
        format!("cruby-{}", self.config.version)
    }

    pub fn is_booted(&self) -> bool {
        self.guest.is_some()
    }

    /// Evaluates `source`, bootstrapping the guest first if needed. Returns
    /// the guest result converted to text; guest raises surface as
    /// [`EngineError::GuestEvaluation`] with the class annotation stripped.
    pub async fn run(&mut self, source: &str) -> Result<String, EngineError> {
        if self.guest.is_none() {
            self.guest = Some(self.bootstrap.run().await?);
        }
        let guest = self.guest.as_mut().ok_or_else(|| {
            EngineError::host("bootstrap guest", anyhow::anyhow!("guest missing after bootstrap"))
        })?;
        guest
            .vm
            .eval(source)
            .map_err(|err| EngineError::GuestEvaluation {
                message: strip_exception_annotation(&err.message),
            })
    }
}

/// Drops one trailing ` (ClassName)` annotation, the form guest exception
/// messages carry, e.g. `boom (RuntimeError)` becomes `boom`. Anything that
/// does not look like a class token is left alone.
fn strip_exception_annotation(message: &str) -> String {
    let trimmed = message.trim_end();
    if let Some(body) = trimmed.strip_suffix(')') {
        if let Some(open) = body.rfind(" (") {
            let token = &body[open + 2..];
            if !token.is_empty()
                && token
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == ':')
            {
                return body[..open].trim_end().to_string();
            }
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_the_trailing_class_annotation() {
        assert_eq!(strip_exception_annotation("boom (RuntimeError)"), "boom");
        assert_eq!(
            strip_exception_annotation("undefined method `x' (NoMethodError)"),
            "undefined method `x'"
        );
        assert_eq!(strip_exception_annotation("boom (Foo::Bar)"), "boom");
    }

    #[test]
    fn strips_only_the_last_annotation() {
        assert_eq!(
            strip_exception_annotation(
                "wrong number of arguments (given 1, expected 0) (ArgumentError)"
            ),
            "wrong number of arguments (given 1, expected 0)"
        );
    }

    #[test]
    fn leaves_non_annotations_alone() {
        assert_eq!(strip_exception_annotation("plain message"), "plain message");
        // Not a class token: contains spaces and punctuation.
        assert_eq!(
            strip_exception_annotation("details (given 1, expected 0)"),
            "details (given 1, expected 0)"
        );
        assert_eq!(strip_exception_annotation(""), "");
        assert_eq!(strip_exception_annotation("(RuntimeError)"), "(RuntimeError)");
    }

    #[test]
    fn names_follow_the_configured_version() {
        let config = EngineConfig::default();
        assert_eq!(config.version, DEFAULT_RUBY_VERSION);
        let config = EngineConfig {
            version: "3.3".to_string(),
            ..EngineConfig::default()
        };
        assert_eq!(format!("CRuby {}", config.version), "CRuby 3.3");
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").expect("empty config");
        assert_eq!(config.module_url, DEFAULT_MODULE_URL);
        assert_eq!(config.version, DEFAULT_RUBY_VERSION);

        let config: EngineConfig =
            serde_json::from_str(r#"{"module_url":"https://cdn.test/ruby.wasm"}"#)
                .expect("partial config");
        assert_eq!(config.module_url, "https://cdn.test/ruby.wasm");
        assert_eq!(config.version, DEFAULT_RUBY_VERSION);
    }
}
