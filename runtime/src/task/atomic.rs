//! Atomic-clear companion.
//!
//! Operators that accumulate into their outputs need those outputs (and some
//! workspaces) zero-filled first. The companion runs the operator's clear
//! kernel over a reduced argument list, on the same stream and ahead of the
//! main kernel:
//!
//! ```text
//! {o_instanceK}...  one per flagged output instance
//! {ws*}             only the flagged workspaces
//! ```

use snafu::OptionExt;

use crate::addresses::TaskAddresses;
use crate::args_format::{ArgumentFormat, ArgumentSlot, CompiledFormat, Direction, SlotKind};
use crate::context::RuntimeContext;
use crate::descriptor::{KernelVariant, OpAttrs, OperatorDescriptor};
use crate::dispatch::LaunchTarget;
use crate::error::*;
use crate::task::{PlannedArgs, plan_args};
use crate::tiling::{AtomicSubset, TilingBlob};

#[derive(Debug, Clone)]
pub struct AtomicClear {
    /// Clear kernel described as a static operator over the original IR.
    op: OperatorDescriptor,
    format: CompiledFormat,
    subset: AtomicSubset,
    blob: TilingBlob,
    target: LaunchTarget,
}

impl AtomicClear {
    /// Companion clearing `subset` of `op`. Fails if `op` declares no clear
    /// kernel.
    pub fn prepare(ctx: &RuntimeContext, op: &OperatorDescriptor, subset: AtomicSubset) -> Result<Self> {
        let kernel = op.attrs.atomic_kernel.as_ref().context(MissingAtomicKernelSnafu { op: &op.name })?;

        let clear = OperatorDescriptor {
            name: format!("{}_atomic_clear", op.name),
            op_type: op.op_type.clone(),
            kernel: KernelVariant::AiCore { binary_key: kernel.binary_key.clone(), stub: kernel.stub.clone() },
            inputs: op.inputs.clone(),
            outputs: op.outputs.clone(),
            workspaces: op.workspaces.clone(),
            args_format: None,
            attrs: OpAttrs { block_dim: kernel.block_dim, ..Default::default() },
        };
        let format = clear_format(&subset).check(&clear)?;
        let blob = TilingBlob::fixed(&clear);
        let target = LaunchTarget::atomic_clear(ctx, kernel)?;

        tracing::debug!(
            op.name = %op.name,
            outputs = subset.outputs.len(),
            workspaces = subset.workspaces.len(),
            "atomic clear prepared"
        );
        Ok(Self { op: clear, format, subset, blob, target })
    }

    pub fn op(&self) -> &OperatorDescriptor {
        &self.op
    }

    pub fn format(&self) -> &CompiledFormat {
        &self.format
    }

    pub fn subset(&self) -> &AtomicSubset {
        &self.subset
    }

    pub fn blob(&self) -> &TilingBlob {
        &self.blob
    }

    pub fn target(&self) -> &LaunchTarget {
        &self.target
    }

    pub fn plan(&self, ctx: &RuntimeContext, addresses: &TaskAddresses) -> Result<PlannedArgs> {
        plan_args(ctx, &self.op, &self.format, addresses, &self.blob, Some(&self.subset))
    }
}

/// Reduced format of a clear kernel: flagged outputs, then flagged
/// workspaces.
pub fn clear_format(subset: &AtomicSubset) -> ArgumentFormat {
    let outputs = subset
        .outputs
        .iter()
        .map(|&instance| ArgumentSlot::new(SlotKind::Instance { direction: Direction::Output, instance }));
    let workspaces = (!subset.workspaces.is_empty()).then(|| ArgumentSlot::new(SlotKind::AllWorkspaces));
    outputs.chain(workspaces).collect()
}
