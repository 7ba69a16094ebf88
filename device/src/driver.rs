//! Device driver contract.
//!
//! The dispatch engine treats the driver as an opaque service. Everything it
//! needs from the hardware goes through this trait: memory, copies, streams,
//! events, binary registration and the engine-specific launch primitives.
//!
//! # Ordering
//!
//! Asynchronous copies and launches on one stream execute in submission
//! order. The engine relies on this FIFO guarantee instead of explicit fences:
//! argument and tiling uploads are enqueued before the launch that reads them.

use crate::error::Result;
use crate::launch::{AiCpuLaunch, BinHandle, FftsPlusLaunch, FuncHandle, HandleLaunch, KernelBinary, KernelLaunch};
use crate::memory::{DevicePtr, MemoryKind};
use crate::stream::{EventId, StreamId};

pub trait Driver: Send + Sync + std::fmt::Debug {
    /// Allocate `size` bytes of device memory.
    fn malloc(&self, size: usize, kind: MemoryKind) -> Result<DevicePtr>;

    /// Release memory returned by [`Driver::malloc`].
    fn free(&self, ptr: DevicePtr) -> Result<()>;

    /// Blocking host-to-device copy.
    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<()>;

    /// Host-to-device copy ordered on `stream`.
    ///
    /// The source bytes are captured at enqueue time.
    fn memcpy_htod_async(&self, dst: DevicePtr, src: &[u8], stream: StreamId) -> Result<()>;

    /// Blocking device-to-host copy.
    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<()>;

    fn create_stream(&self) -> Result<StreamId>;

    fn destroy_stream(&self, stream: StreamId) -> Result<()>;

    /// Block the host until all work on `stream` has completed.
    fn synchronize_stream(&self, stream: StreamId) -> Result<()>;

    fn create_event(&self) -> Result<EventId>;

    /// Mark the current tail of `stream` with `event`.
    fn record_event(&self, event: EventId, stream: StreamId) -> Result<()>;

    /// Make later work on `stream` wait until `event` has been reached.
    fn stream_wait_event(&self, stream: StreamId, event: EventId) -> Result<()>;

    /// Return `event` to the unreached state, ordered on `stream`.
    fn reset_event(&self, event: EventId, stream: StreamId) -> Result<()>;

    /// Block the host until `event` is reached. `timeout_ms == 0` waits forever.
    fn synchronize_event(&self, event: EventId, timeout_ms: u64) -> Result<()>;

    /// Device address kernels use to signal or poll `event`.
    fn event_address(&self, event: EventId) -> Result<DevicePtr>;

    fn register_binary(&self, binary: &KernelBinary) -> Result<BinHandle>;

    /// Resolve the entry point named `stub` inside `bin`.
    fn register_function(&self, bin: BinHandle, stub: &str) -> Result<FuncHandle>;

    fn launch_kernel(&self, launch: &KernelLaunch, stream: StreamId) -> Result<()>;

    fn launch_kernel_with_handle(&self, launch: &HandleLaunch, stream: StreamId) -> Result<()>;

    fn launch_aicpu(&self, launch: &AiCpuLaunch, stream: StreamId) -> Result<()>;

    fn launch_ffts_plus(&self, launch: &FftsPlusLaunch, stream: StreamId) -> Result<()>;
}
