//! Launch descriptors for the accelerator's compute engines.
//!
//! Each engine category has its own launch primitive:
//! - AI-core kernels by function handle (static kernels)
//! - AI-core kernels by binary handle plus tiling key (tiling-dispatched kernels)
//! - AI-CPU kernels by shared-object and kernel name
//! - FFTS+ tasks: a list of contexts launched together

use crate::memory::DevicePtr;

/// Handle of a kernel binary registered with the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("bin#{_0}")]
pub struct BinHandle(pub u64);

/// Handle of a kernel entry point inside a registered binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("func#{_0}")]
pub struct FuncHandle(pub u64);

/// Which engine a binary targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum BinaryKind {
    AiCore,
    AiCpu,
}

/// A loadable kernel binary as produced by the kernel compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelBinary {
    /// Registry key; identical keys share one registration.
    pub key: String,
    pub kind: BinaryKind,
    pub bytes: Vec<u8>,
}

impl KernelBinary {
    pub fn new(key: impl Into<String>, kind: BinaryKind, bytes: Vec<u8>) -> Self {
        Self { key: key.into(), kind, bytes }
    }
}

/// Location of a task's argument buffer in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchArgs {
    pub ptr: DevicePtr,
    pub size: usize,
}

/// Scheduling knobs shared by AI-core launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchConfig {
    pub block_dim: u32,
    pub schedule_mode: u32,
    /// Dynamic local-memory bytes requested per block.
    pub local_memory_size: u32,
}

/// Launch of a static kernel entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLaunch {
    pub func: FuncHandle,
    pub config: LaunchConfig,
    pub args: LaunchArgs,
}

/// Launch of a tiling-dispatched kernel: the device picks the entry point
/// inside `bin` from `tiling_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleLaunch {
    pub bin: BinHandle,
    pub tiling_key: u64,
    pub config: LaunchConfig,
    pub args: LaunchArgs,
}

/// Launch of an AI-CPU kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiCpuLaunch {
    pub so_name: String,
    pub kernel_name: String,
    pub block_dim: u32,
    pub args: LaunchArgs,
    /// Set for user-supplied AI-CPU kernels loaded from `bin`.
    pub custom: Option<BinHandle>,
}

/// Entry point of an FFTS+ compute context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEntry {
    Function(FuncHandle),
    Handle { bin: BinHandle, tiling_key: u64 },
}

/// One sub-task of an FFTS+ launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FftsContext {
    /// AI-core compute. Mixed contexts run cube and vector cores together.
    AiCore { entry: ContextEntry, config: LaunchConfig, args: LaunchArgs, mixed: bool },
    AiCpu { so_name: String, kernel_name: String, block_dim: u32, args: LaunchArgs },
    /// Pure data movement without a kernel.
    DataMovement { src: DevicePtr, dst: DevicePtr, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FftsPlusLaunch {
    pub contexts: Vec<FftsContext>,
}
