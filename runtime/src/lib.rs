//! Argument assembly and dispatch of accelerator kernel tasks.
//!
//! Given an [`OperatorDescriptor`], its argument format and the addresses of
//! its tensors, the runtime builds the exact byte image the kernel expects as
//! its argument list, uploads it and submits the launch through the
//! [`tessel_device::Driver`] contract.
//!
//! The pipeline of one build:
//!
//! 1. [`args_format`] compiles the format text against the operator's IR.
//! 2. [`tiling`] asks the tiling service for launch parameters.
//! 3. [`resolver`] turns every slot into concrete values.
//! 4. [`assembler`] lays the values out and writes the buffer, recording the
//!    [`refresh`] registry and the [`dump`] record as it goes.
//! 5. [`task`] owns the result and drives launches and refreshes.

pub mod addresses;
pub mod args_format;
pub mod assembler;
pub mod buffer;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod dispatch;
pub mod dump;
pub mod error;
pub mod instance;
pub mod kernel_cache;
pub mod refresh;
pub mod resolver;
pub mod task;
pub mod tiling;


pub use addresses::{HiddenInputResolver, LogicalAddress, NoHiddenInputs, TaskAddresses, TensorBinding};
pub use args_format::{ArgumentFormat, ArgumentSlot, CompiledFormat, Direction, HiddenKind, SlotKind, TilingScalar};
pub use assembler::{Addressing, ArgumentLayout, Assembled, Assembler};
pub use buffer::{ArgumentBuffer, Region};
pub use config::{PlatformInfo, RuntimeConfig};
pub use context::RuntimeContext;
pub use descriptor::{
    AiCpuKernel, AtomicClearKernel, IrKind, IrTensor, KernelCategory, KernelVariant, OpAttrs, OperatorDescriptor,
    TensorDesc,
};
pub use dispatch::LaunchTarget;
pub use dump::{DiagnosticsSink, DumpEntry, DumpRecord, DumpReport, DumpTag, NullSink};
pub use error::*;
pub use kernel_cache::{BinaryStore, KernelBinarySource, KernelHandleCache};
pub use refresh::RefreshRegistry;
pub use task::{FftsContextDesc, FftsPlusTask, KernelTask, SingleOpTask, TaskState};
pub use tiling::{AtomicSubset, TilingBlob, TilingResult, TilingService};
