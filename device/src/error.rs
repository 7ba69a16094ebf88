use snafu::Snafu;

use crate::launch::{BinHandle, FuncHandle};
use crate::memory::DevicePtr;
use crate::stream::{EventId, StreamId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Device memory exhausted or allocation rejected.
    #[snafu(display("device allocation of {size} bytes failed: {reason}"))]
    AllocationFailed { size: usize, reason: String },

    /// Address does not belong to any live allocation.
    #[snafu(display("invalid device address {addr}"))]
    InvalidAddress { addr: DevicePtr },

    /// Access runs past the end of the allocation it starts in.
    #[snafu(display("access at {addr} of {size} bytes exceeds allocation of {allocation_size} bytes"))]
    OutOfBounds { addr: DevicePtr, size: usize, allocation_size: usize },

    /// Failed to copy data between host and device.
    #[snafu(display("copy operation failed: {reason}"))]
    CopyFailed { reason: String },

    #[snafu(display("unknown stream {stream}"))]
    UnknownStream { stream: StreamId },

    #[snafu(display("unknown event {event}"))]
    UnknownEvent { event: EventId },

    #[snafu(display("event {event} not reached within {timeout_ms}ms"))]
    EventTimeout { event: EventId, timeout_ms: u64 },

    #[snafu(display("unknown kernel binary handle {handle}"))]
    UnknownBinary { handle: BinHandle },

    #[snafu(display("unknown kernel function handle {handle}"))]
    UnknownFunction { handle: FuncHandle },

    /// Binary registration rejected by the driver.
    #[snafu(display("kernel binary '{key}' rejected: {reason}"))]
    BinaryRejected { key: String, reason: String },

    /// Kernel launch failed.
    #[snafu(display("kernel launch failed: {reason}"))]
    LaunchFailed { reason: String },
}
