//! Lazily derived, revalidated views over guest linear memory.

use crate::error::MemoryError;

/// A byte-addressable view of the guest's linear memory. Multi-byte fields
/// are little-endian, per the wasm memory layout.
///
/// A view goes stale when the backing buffer is invalidated by memory growth;
/// a stale view reports `byte_len() == 0` and must never be read through.
pub trait GuestBuffer {
    fn byte_len(&self) -> usize;

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), MemoryError>;

    fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), MemoryError>;

    fn read_vec(&self, offset: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0u8; len];
        self.read(offset, &mut buf)?;
        Ok(buf)
    }

    fn read_u32(&self, offset: usize) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&self, offset: usize, val: u32) -> Result<(), MemoryError> {
        self.write(offset, &val.to_le_bytes())
    }

    fn write_u64(&self, offset: usize, val: u64) -> Result<(), MemoryError> {
        self.write(offset, &val.to_le_bytes())
    }
}

/// Source of [`GuestBuffer`]s over the current backing buffer.
pub trait MemoryBacking: Send {
    type Buffer: GuestBuffer + Send;

    fn buffer(&self) -> Self::Buffer;
}

/// Caches a derived buffer and rebuilds it only when the cached one has been
/// invalidated. Must be bound to a live memory reference before first use.
pub struct MemoryView<B: MemoryBacking> {
    backing: Option<B>,
    cached: Option<B::Buffer>,
}

impl<B: MemoryBacking> MemoryView<B> {
    pub fn new() -> Self {
        Self {
            backing: None,
            cached: None,
        }
    }

    pub fn bind(&mut self, backing: B) {
        self.backing = Some(backing);
        self.cached = None;
    }

    /// The current buffer. Revalidates on every access: rebuilds iff there is
    /// no cached buffer yet or the cached buffer's backing length reads as
    /// zero (growth invalidated it); otherwise reuses the cached buffer.
    pub fn buffer(&mut self) -> Result<&B::Buffer, MemoryError> {
        let stale = match &self.cached {
            Some(buffer) => buffer.byte_len() == 0,
            None => true,
        };
        if stale {
            let backing = self.backing.as_ref().ok_or(MemoryError::NotBound)?;
            self.cached = Some(backing.buffer());
        }
        self.cached.as_ref().ok_or(MemoryError::NotBound)
    }
}

impl<B: MemoryBacking> Default for MemoryView<B> {
    fn default() -> Self {
        Self::new()
    }
}
