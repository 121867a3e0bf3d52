//! Loads the fixed set of guest support libraries exactly once per process.

use std::sync::{Arc, OnceLock};

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine as Base64Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::try_join_all;
use sha2::{Digest, Sha256};

use crate::debug_log;
use crate::error::ResourceLoadError;
use crate::once::OnceState;

/// One required external resource. The set is fixed at build time; each entry
/// must verify against its declared hash before the payload is used.
#[derive(Debug, Clone, Copy)]
pub struct DependencyDescriptor {
    pub url: &'static str,
    /// `sha256-<base64 digest>` token.
    pub integrity: &'static str,
    /// Cross-origin mode, meaningful to verifying loading environments.
    pub cross_origin: &'static str,
}

pub const REQUIRED_LIBRARIES: [DependencyDescriptor; 3] = [
    DependencyDescriptor {
        url: "https://cdn.jsdelivr.net/npm/@ruby/wasm-wasi@2.7.1/dist/browser.umd.js",
        integrity: "sha256-7BFeYf6/25URj7e1BHDr2wN2zWD0ISeSXbbLYWXNrmc=",
        cross_origin: "anonymous",
    },
    DependencyDescriptor {
        url: "https://cdn.jsdelivr.net/npm/@wasmer/wasmfs@0.12.0/lib/index.iife.js",
        integrity: "sha256-sOd4ekxVsN4PXhR+cn/4uNAxeQOJRcsaW5qalYfvkTw=",
        cross_origin: "anonymous",
    },
    DependencyDescriptor {
        url: "https://cdn.jsdelivr.net/npm/@wasmer/wasi@0.12.0/lib/index.iife.js",
        integrity: "sha256-FslFp/Vq4bDf2GXu+9QyBEDLtEWO3fkMjpyOaJMHJT8=",
        cross_origin: "anonymous",
    },
];

/// Retrieves raw resource bytes. Production impl is HTTP; tests substitute
/// counting fakes.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        let body = response
            .bytes()
            .await
            .with_context(|| format!("read body of {url}"))?;
        Ok(body.to_vec())
    }
}

/// Acquires every descriptor in [`REQUIRED_LIBRARIES`] concurrently and
/// memoizes the outcome: after one success no further load attempts are ever
/// issued for this loader.
pub struct ResourceLoader {
    descriptors: Vec<DependencyDescriptor>,
    fetcher: Arc<dyn ResourceFetcher>,
    state: OnceState<Vec<Arc<[u8]>>>,
}

impl ResourceLoader {
    pub fn new(fetcher: Arc<dyn ResourceFetcher>) -> Self {
        Self::with_descriptors(REQUIRED_LIBRARIES.to_vec(), fetcher)
    }

    pub fn with_descriptors(
        descriptors: Vec<DependencyDescriptor>,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> Self {
        Self {
            descriptors,
            fetcher,
            state: OnceState::new(),
        }
    }

    /// The process-wide loader instance over the fixed descriptor set.
    pub fn shared() -> Arc<ResourceLoader> {
        static SHARED: OnceLock<Arc<ResourceLoader>> = OnceLock::new();
        SHARED
            .get_or_init(|| Arc::new(ResourceLoader::new(Arc::new(HttpFetcher::new()))))
            .clone()
    }

    /// Payloads in descriptor order. Fan-in barrier: succeeds only when every
    /// acquisition succeeds, fails as soon as any one fails.
    pub async fn ensure_loaded(&self) -> Result<Vec<Arc<[u8]>>, ResourceLoadError> {
        self.state
            .get_or_try_init(|| async {
                let acquisitions = self.descriptors.iter().map(|entry| self.acquire(entry));
                try_join_all(acquisitions).await
            })
            .await
    }

    async fn acquire(
        &self,
        descriptor: &DependencyDescriptor,
    ) -> Result<Arc<[u8]>, ResourceLoadError> {
        debug_log(|| {
            format!(
                "fetching {} (integrity {}, cross-origin {})",
                descriptor.url, descriptor.integrity, descriptor.cross_origin
            )
        });
        let bytes = self
            .fetcher
            .fetch(descriptor.url)
            .await
            .map_err(|cause| ResourceLoadError::Fetch {
                url: descriptor.url.to_string(),
                cause,
            })?;
        verify_integrity(&bytes, descriptor.integrity).map_err(|detail| {
            ResourceLoadError::Integrity {
                url: descriptor.url.to_string(),
                detail,
            }
        })?;
        Ok(bytes.into())
    }
}

fn verify_integrity(bytes: &[u8], token: &str) -> Result<(), String> {
    let encoded = token
        .strip_prefix("sha256-")
        .ok_or_else(|| format!("unsupported integrity algorithm in {token:?}"))?;
    let expected = STANDARD
        .decode(encoded)
        .map_err(|err| format!("malformed integrity token: {err}"))?;
    let digest = Sha256::digest(bytes);
    if digest.as_slice() != expected.as_slice() {
        return Err(format!(
            "digest mismatch: expected sha256-{encoded}, got sha256-{}",
            STANDARD.encode(digest)
        ));
    }
    Ok(())
}
