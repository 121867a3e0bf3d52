//! Host for the CRuby WebAssembly build.
//!
//! The guest's stdout/stderr writes are intercepted at the WASI preview-1
//! import boundary and redirected into an application-defined [`OutputSink`];
//! everything else passes through to the real WASI implementation. A staged
//! async bootstrap fetches the support libraries and the ruby.wasm module
//! (each exactly once per process), instantiates the guest, and readies it
//! for evaluation.

use std::env;

pub mod engine;
pub mod error;
pub mod loader;
pub mod memory;
pub mod once;
pub mod pipeline;
pub mod provider;
pub mod shim;
pub mod vfs;
pub mod vm;

pub use engine::{CRubyEngine, EngineConfig};
pub use error::EngineError;
pub use shim::{OutputSink, StreamLabel};

pub(crate) fn debug_log<F: FnOnce() -> String>(message: F) {
    if env::var("RBWASM_HOST_DEBUG").is_ok() {
        eprintln!("[rbwasm-engine] {}", message());
    }
}
