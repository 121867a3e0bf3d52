//! Error taxonomy for the host.

use thiserror::Error;

/// A required support library failed to load or verify.
#[derive(Debug, Error)]
pub enum ResourceLoadError {
    #[error("failed to load {url}: {cause}")]
    Fetch { url: String, cause: anyhow::Error },
    #[error("integrity check failed for {url}: {detail}")]
    Integrity { url: String, detail: String },
}

impl ResourceLoadError {
    pub fn url(&self) -> &str {
        match self {
            ResourceLoadError::Fetch { url, .. } => url,
            ResourceLoadError::Integrity { url, .. } => url,
        }
    }
}

/// The step of the module acquisition that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStep {
    Fetch,
    Buffer,
    Compile,
}

impl std::fmt::Display for ModuleStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ModuleStep::Fetch => "fetch",
            ModuleStep::Buffer => "buffer",
            ModuleStep::Compile => "compile",
        })
    }
}

/// Fetching, buffering, or compiling the guest module failed.
#[derive(Debug, Error)]
#[error("module {step} failed for {url}: {cause}")]
pub struct ModuleLoadError {
    pub step: ModuleStep,
    pub url: String,
    pub cause: anyhow::Error,
}

/// Guest linear memory access errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    /// The view was used before `bind` supplied a live memory reference.
    #[error("memory not set")]
    NotBound,
    #[error("guest memory access out of bounds: offset {offset}, len {len}, memory {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
}

/// The guest raised during evaluation. `message` is the guest's own message,
/// unnormalized.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct GuestError {
    pub message: String,
}

impl GuestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Top-level error surfaced by the runner.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    ResourceLoad(#[from] ResourceLoadError),
    #[error(transparent)]
    ModuleLoad(#[from] ModuleLoadError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// Guest-level failure, normalized for display.
    #[error("{message}")]
    GuestEvaluation { message: String },
    #[error("failed to {action}: {cause}")]
    Host {
        action: String,
        cause: anyhow::Error,
    },
}

impl EngineError {
    pub fn host(action: impl Into<String>, cause: anyhow::Error) -> Self {
        EngineError::Host {
            action: action.into(),
            cause,
        }
    }
}
