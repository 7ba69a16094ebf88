//! Device layer of the tessel dispatch engine.
//!
//! Defines the [`Driver`] contract the runtime talks to, owned device memory
//! and streams built on top of it, and [`SimDriver`], an in-process simulated
//! accelerator used for testing and host-only runs.

pub mod driver;
pub mod error;
pub mod launch;
pub mod memory;
pub mod sim;
pub mod stream;
pub mod sync;


pub use driver::Driver;
pub use error::{Error, Result};
pub use launch::{
    AiCpuLaunch, BinHandle, BinaryKind, ContextEntry, FftsContext, FftsPlusLaunch, FuncHandle, HandleLaunch,
    KernelBinary, KernelLaunch, LaunchArgs, LaunchConfig,
};
pub use memory::{DeviceBuffer, DevicePtr, MemoryKind};
pub use sim::{FailurePoint, LaunchRecord, SimDriver, StreamOp};
pub use stream::{EventId, Stream, StreamId};
