//! Device addresses and owned device allocations.

use std::sync::Arc;

use snafu::ensure;

use crate::driver::Driver;
use crate::error::{OutOfBoundsSnafu, Result};
use crate::stream::StreamId;

/// Raw device address.
///
/// Addresses are plain integers on the host side; they are only ever
/// dereferenced by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, derive_more::Display)]
#[display("{_0:#x}")]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: Self = Self(0);

    pub const fn addr(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one, or `None` on overflow.
    pub fn offset(self, bytes: usize) -> Option<Self> {
        let bytes = u64::try_from(bytes).ok()?;
        self.0.checked_add(bytes).map(Self)
    }
}

impl From<u64> for DevicePtr {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

/// Placement of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display)]
pub enum MemoryKind {
    /// Regular device memory.
    #[default]
    Device,
    /// Host memory mapped into the device address space.
    HostPinned,
}

/// An owned device allocation, released exactly once when dropped.
#[derive(Debug)]
pub struct DeviceBuffer {
    driver: Arc<dyn Driver>,
    ptr: DevicePtr,
    size: usize,
    kind: MemoryKind,
}

impl DeviceBuffer {
    pub fn allocate(driver: &Arc<dyn Driver>, size: usize, kind: MemoryKind) -> Result<Self> {
        let ptr = driver.malloc(size, kind)?;
        tracing::trace!(%ptr, size, %kind, "device buffer allocated");
        Ok(Self { driver: Arc::clone(driver), ptr, size, kind })
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Synchronously copy `src` to `offset` within this buffer.
    pub fn copyin(&self, offset: usize, src: &[u8]) -> Result<()> {
        let dst = self.checked_range(offset, src.len())?;
        self.driver.memcpy_htod(dst, src)
    }

    /// Enqueue a copy of `src` to `offset` on `stream`.
    ///
    /// The copy is ordered before any later work on the same stream.
    pub fn copyin_async(&self, offset: usize, src: &[u8], stream: StreamId) -> Result<()> {
        let dst = self.checked_range(offset, src.len())?;
        self.driver.memcpy_htod_async(dst, src, stream)
    }

    /// Synchronously copy `dst.len()` bytes starting at `offset` back to the host.
    pub fn copyout(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let src = self.checked_range(offset, dst.len())?;
        self.driver.memcpy_dtoh(dst, src)
    }

    fn checked_range(&self, offset: usize, size: usize) -> Result<DevicePtr> {
        let end = offset.checked_add(size);
        ensure!(
            end.is_some_and(|end| end <= self.size),
            OutOfBoundsSnafu { addr: self.ptr.offset(offset).unwrap_or(self.ptr), size, allocation_size: self.size }
        );
        Ok(self.ptr.offset(offset).unwrap_or(self.ptr))
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(error) = self.driver.free(self.ptr) {
            tracing::warn!(ptr = %self.ptr, size = self.size, %error, "failed to release device buffer");
        }
    }
}
