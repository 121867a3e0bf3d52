//! Emulation of the stdout/stderr syscalls at the WASI preview-1 import
//! boundary.
//!
//! Exactly three imports are wrapped: `fd_write`, `fd_filestat_get`, and
//! `fd_fdstat_get`. Operations on descriptors 1 and 2 are emulated; every
//! other descriptor delegates to the original implementation unmodified.

use std::sync::{Arc, Mutex};

use crate::memory::{GuestBuffer, MemoryBacking, MemoryView};

pub const ERRNO_SUCCESS: i32 = 0;
/// WASI preview-1 `filetype::character_device`.
pub const FILETYPE_CHARACTER_DEVICE: u8 = 2;
/// WASI preview-1 `rights::fd_write`.
pub const RIGHTS_FD_WRITE: u64 = 1 << 6;
/// Size of the `fdstat` record; `fs_rights_base` sits at offset 8.
const FDSTAT_SIZE: usize = 24;
const FDSTAT_RIGHTS_BASE_OFFSET: usize = 8;
/// Size of one `iovec` entry: u32 pointer followed by u32 length.
const IOVEC_SIZE: usize = 8;

/// Which virtualized stream a descriptor maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLabel {
    Stdout,
    Stderr,
}

impl StreamLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamLabel::Stdout => "stdout",
            StreamLabel::Stderr => "stderr",
        }
    }
}

/// The single classification point all three shimmed syscalls share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    StandardStream(StreamLabel),
    Other,
}

impl FdKind {
    pub fn classify(fd: i32) -> FdKind {
        match fd {
            1 => FdKind::StandardStream(StreamLabel::Stdout),
            2 => FdKind::StandardStream(StreamLabel::Stderr),
            _ => FdKind::Other,
        }
    }
}

/// Receives intercepted stream output. Must not fail and must accept
/// interleaved stdout/stderr calls.
pub trait OutputSink: Send + Sync {
    fn print(&self, text: &str, stream: StreamLabel);
}

/// Wraps the three import functions. Each method takes the original
/// implementation as a delegate closure; the shim composes around it rather
/// than mutating shared state.
pub struct SyscallShim<B: MemoryBacking> {
    view: Mutex<MemoryView<B>>,
    sink: Arc<dyn OutputSink>,
}

impl<B: MemoryBacking> SyscallShim<B> {
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            view: Mutex::new(MemoryView::new()),
            sink,
        }
    }

    /// Supplies the live memory reference. Must be called once instantiation
    /// completes and before any guest code writes to stdout/stderr.
    pub fn bind_memory(&self, backing: B) {
        self.view.lock().unwrap().bind(backing);
    }

    /// Emulated `fd_write`. For descriptors 1/2: reads each iovec region out
    /// of guest memory, forwards the concatenated decoded text to the sink,
    /// stores the total byte count in `nwritten`, and reports success without
    /// ever invoking the original.
    pub fn fd_write<F>(
        &self,
        fd: i32,
        iovs: u32,
        iovs_len: u32,
        nwritten: u32,
        original: F,
    ) -> anyhow::Result<i32>
    where
        F: FnOnce() -> anyhow::Result<i32>,
    {
        let label = match FdKind::classify(fd) {
            FdKind::StandardStream(label) => label,
            FdKind::Other => return original(),
        };
        let mut view = self.view.lock().unwrap();
        let buffer = view.buffer()?;
        let mut text = String::new();
        let mut written: u32 = 0;
        for index in 0..iovs_len {
            let entry = iovs as usize + index as usize * IOVEC_SIZE;
            let ptr = buffer.read_u32(entry)?;
            let len = buffer.read_u32(entry + 4)?;
            let bytes = buffer.read_vec(ptr as usize, len as usize)?;
            text.push_str(&String::from_utf8_lossy(&bytes));
            written = written.wrapping_add(len);
        }
        buffer.write_u32(nwritten as usize, written)?;
        self.sink.print(&text, label);
        Ok(ERRNO_SUCCESS)
    }

    /// Emulated `fd_filestat_get`. For descriptors 1/2: the original
    /// populates the record; a failure propagates unchanged, a success gets
    /// only its filetype field overridden to character device.
    pub fn fd_filestat_get<F>(&self, fd: i32, filestat: u32, original: F) -> anyhow::Result<i32>
    where
        F: FnOnce() -> anyhow::Result<i32>,
    {
        if matches!(FdKind::classify(fd), FdKind::Other) {
            return original();
        }
        let result = original()?;
        if result != ERRNO_SUCCESS {
            return Ok(result);
        }
        let mut view = self.view.lock().unwrap();
        let buffer = view.buffer()?;
        buffer.write(filestat as usize, &[FILETYPE_CHARACTER_DEVICE])?;
        Ok(ERRNO_SUCCESS)
    }

    /// Emulated `fd_fdstat_get`. For descriptors 1/2: no delegation; the
    /// record is synthesized from scratch with filetype = character device
    /// and a rights mask exposing exactly fd_write.
    pub fn fd_fdstat_get<F>(&self, fd: i32, fdstat: u32, original: F) -> anyhow::Result<i32>
    where
        F: FnOnce() -> anyhow::Result<i32>,
    {
        if matches!(FdKind::classify(fd), FdKind::Other) {
            return original();
        }
        let mut view = self.view.lock().unwrap();
        let buffer = view.buffer()?;
        buffer.write(fdstat as usize, &[0u8; FDSTAT_SIZE])?;
        buffer.write(fdstat as usize, &[FILETYPE_CHARACTER_DEVICE])?;
        buffer.write_u64(fdstat as usize + FDSTAT_RIGHTS_BASE_OFFSET, RIGHTS_FD_WRITE)?;
        Ok(ERRNO_SUCCESS)
    }
}
