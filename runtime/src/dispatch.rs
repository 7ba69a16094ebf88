//! Launch target resolution and launch primitive selection.
//!
//! Kernel categories only differ in which handle they need and which driver
//! primitive they go through:
//!
//! | Kernel | Handle | Primitive |
//! |---|---|---|
//! | AI-core, tiled | binary | `launch_kernel_with_handle` |
//! | AI-core, static | function | `launch_kernel` |
//! | Customized | function | `launch_kernel` |
//! | AI-CPU | none | `launch_aicpu` |
//! | Custom AI-CPU | binary | `launch_aicpu` |

use snafu::ResultExt;
use tessel_device::{
    AiCpuLaunch, BinHandle, ContextEntry, FftsContext, FuncHandle, HandleLaunch, KernelLaunch, LaunchArgs,
    LaunchConfig, StreamId,
};

use crate::context::RuntimeContext;
use crate::descriptor::{AtomicClearKernel, KernelVariant, OperatorDescriptor};
use crate::error::*;
use crate::tiling::TilingBlob;

/// Resolved entry point of a task's kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchTarget {
    /// Tiled AI-core kernel; the device selects the entry from the tiling key.
    Handle { bin: BinHandle },
    Function(FuncHandle),
    AiCpu { so_name: String, kernel_name: String, custom: Option<BinHandle> },
}

impl LaunchTarget {
    /// Register whatever binary or function `op` needs, through the context's
    /// handle cache.
    pub fn resolve(ctx: &RuntimeContext, op: &OperatorDescriptor) -> Result<Self> {
        let driver = ctx.driver.as_ref();
        let binaries = ctx.binaries.as_ref();
        let target = match &op.kernel {
            KernelVariant::AiCore { binary_key, .. } if op.has_tiling() => {
                Self::Handle { bin: ctx.kernels.binary(driver, binaries, binary_key)? }
            }
            KernelVariant::AiCore { binary_key, stub } | KernelVariant::Customized { binary_key, stub, .. } => {
                Self::Function(ctx.kernels.function(driver, binaries, binary_key, stub)?)
            }
            KernelVariant::AiCpu(kernel) => Self::AiCpu {
                so_name: kernel.so_name.clone(),
                kernel_name: kernel.kernel_name.clone(),
                custom: None,
            },
            KernelVariant::CustomAiCpu { binary_key, kernel } => Self::AiCpu {
                so_name: kernel.so_name.clone(),
                kernel_name: kernel.kernel_name.clone(),
                custom: Some(ctx.kernels.binary(driver, binaries, binary_key)?),
            },
        };
        tracing::debug!(op.name = %op.name, kernel = %op.kernel.category(), ?target, "launch target resolved");
        Ok(target)
    }

    /// Static entry point of an atomic-clear kernel.
    pub fn atomic_clear(ctx: &RuntimeContext, kernel: &AtomicClearKernel) -> Result<Self> {
        let func = ctx.kernels.function(ctx.driver.as_ref(), ctx.binaries.as_ref(), &kernel.binary_key, &kernel.stub)?;
        Ok(Self::Function(func))
    }

    /// Submit one launch on `stream`.
    pub fn launch(&self, ctx: &RuntimeContext, blob: &TilingBlob, args: LaunchArgs, stream: StreamId) -> Result<()> {
        let driver = ctx.driver.as_ref();
        let config = launch_config(blob);
        match self {
            Self::Handle { bin } => {
                let launch = HandleLaunch { bin: *bin, tiling_key: blob.tiling_key, config, args };
                driver.launch_kernel_with_handle(&launch, stream)
            }
            Self::Function(func) => driver.launch_kernel(&KernelLaunch { func: *func, config, args }, stream),
            Self::AiCpu { so_name, kernel_name, custom } => {
                let launch = AiCpuLaunch {
                    so_name: so_name.clone(),
                    kernel_name: kernel_name.clone(),
                    block_dim: blob.block_dim,
                    args,
                    custom: *custom,
                };
                driver.launch_aicpu(&launch, stream)
            }
        }
        .context(DeviceSnafu)?;

        if ctx.config.sync_after_launch {
            driver.synchronize_stream(stream).context(DeviceSnafu)?;
        }
        Ok(())
    }

    /// FFTS+ context running this target.
    pub fn ffts_context(&self, blob: &TilingBlob, args: LaunchArgs, mixed: bool) -> FftsContext {
        let config = launch_config(blob);
        match self {
            Self::Handle { bin } => FftsContext::AiCore {
                entry: ContextEntry::Handle { bin: *bin, tiling_key: blob.tiling_key },
                config,
                args,
                mixed,
            },
            Self::Function(func) => FftsContext::AiCore { entry: ContextEntry::Function(*func), config, args, mixed },
            Self::AiCpu { so_name, kernel_name, .. } => FftsContext::AiCpu {
                so_name: so_name.clone(),
                kernel_name: kernel_name.clone(),
                block_dim: blob.block_dim,
                args,
            },
        }
    }
}

pub fn launch_config(blob: &TilingBlob) -> LaunchConfig {
    LaunchConfig {
        block_dim: blob.block_dim,
        schedule_mode: blob.schedule_mode,
        local_memory_size: blob.local_memory_size,
    }
}
