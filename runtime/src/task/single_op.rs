//! Standalone operator task.
//!
//! Built lazily on the first launch and then relaunched with whatever input
//! and output addresses the caller passes. The task owns its workspace memory
//! and grows it when a tiling result asks for more. Soft-sync operators are
//! re-tiled before every launch; other tiled operators are tiled once.

use std::sync::Arc;

use snafu::{ResultExt, ensure};
use tessel_device::{DeviceBuffer, DevicePtr, MemoryKind, Stream};

use crate::addresses::{TaskAddresses, TensorBinding};
use crate::args_format::{ArgumentFormat, CompiledFormat};
use crate::context::RuntimeContext;
use crate::descriptor::OperatorDescriptor;
use crate::dispatch::LaunchTarget;
use crate::error::*;
use crate::task::{AtomicClear, StateMachine, TaskArgs, TaskState, plan_args};
use crate::tiling::{TilingBlob, derive_atomic_subset};

const MAIN: usize = 0;
const CLEAR: usize = 1;

/// Overflow status word written by kernels with overflow checking.
const OVERFLOW_WORD: usize = 8;

#[derive(Debug)]
struct Built {
    target: LaunchTarget,
    clear: Option<AtomicClear>,
    args: TaskArgs,
}

#[derive(Debug)]
pub struct SingleOpTask {
    ctx: Arc<RuntimeContext>,
    op: Arc<OperatorDescriptor>,
    machine: StateMachine,
    format: CompiledFormat,
    /// Tiling of the last launch.
    blob: Option<TilingBlob>,
    workspaces: Vec<DeviceBuffer>,
    overflow: Option<DeviceBuffer>,
    built: Option<Built>,
}

impl SingleOpTask {
    /// Compile the operator's argument format. Everything else waits for the
    /// first launch, when addresses are known.
    #[tracing::instrument(skip_all, fields(op.name = %op.name))]
    pub fn new(ctx: Arc<RuntimeContext>, op: Arc<OperatorDescriptor>) -> Result<Self> {
        let mut machine = StateMachine::default();
        let format = machine.step(&op.name, TaskState::FormatCompiled, || ArgumentFormat::compile(&op))?;
        let overflow = if op.attrs.overflow_check {
            Some(DeviceBuffer::allocate(&ctx.driver, OVERFLOW_WORD, MemoryKind::Device).context(DeviceSnafu)?)
        } else {
            None
        };
        Ok(Self { ctx, op, machine, format, blob: None, workspaces: Vec::new(), overflow, built: None })
    }

    pub fn state(&self) -> TaskState {
        self.machine.state()
    }

    pub fn op(&self) -> &OperatorDescriptor {
        &self.op
    }

    pub fn format(&self) -> &CompiledFormat {
        &self.format
    }

    pub fn blob(&self) -> Option<&TilingBlob> {
        self.blob.as_ref()
    }

    pub fn args(&self) -> Option<&TaskArgs> {
        self.built.as_ref().map(|built| &built.args)
    }

    pub fn atomic_clear(&self) -> Option<&AtomicClear> {
        self.built.as_ref().and_then(|built| built.clear.as_ref())
    }

    /// Workspace allocations, in workspace order.
    pub fn workspaces(&self) -> impl Iterator<Item = (DevicePtr, usize)> + '_ {
        self.workspaces.iter().map(|buffer| (buffer.ptr(), buffer.size()))
    }

    pub fn overflow_addr(&self) -> DevicePtr {
        self.overflow.as_ref().map(DeviceBuffer::ptr).unwrap_or(DevicePtr::NULL)
    }

    /// Launch on `stream` against `inputs` and `outputs`.
    ///
    /// The first launch builds the task; a build failure fails the task.
    /// Later launches refresh the addresses in place, and a failure there
    /// only fails that launch.
    pub fn launch(&mut self, stream: &Stream, inputs: Vec<TensorBinding>, outputs: Vec<TensorBinding>) -> Result<()> {
        self.machine.ensure_live(&self.op.name)?;

        let first = self.built.is_none();
        let blob = match &self.blob {
            Some(blob) if !self.op.attrs.soft_sync => blob.clone(),
            _ => {
                let tiled = self.ctx.tiling_injector().inject(&self.op);
                if first && tiled.is_err() {
                    self.machine.fail();
                }
                tiled?
            }
        };
        self.reserve_workspaces(stream, &blob)?;
        let addresses = TaskAddresses::builder()
            .inputs(inputs)
            .outputs(outputs)
            .workspaces(self.workspaces.iter().take(blob.workspace_sizes.len()).map(DeviceBuffer::ptr).collect())
            .overflow_addr(self.overflow_addr())
            .build();

        if first {
            self.build(&addresses, &blob)?;
        } else {
            self.refresh(&addresses, &blob)?;
        }
        self.blob = Some(blob);
        self.dispatch(stream)
    }

    /// Grow the workspace list to cover `blob`. Replaced buffers may still be
    /// read by earlier launches, so the stream is drained first.
    fn reserve_workspaces(&mut self, stream: &Stream, blob: &TilingBlob) -> Result<()> {
        let grow = blob
            .workspace_sizes
            .iter()
            .enumerate()
            .any(|(index, &size)| self.workspaces.get(index).is_none_or(|buffer| buffer.size() < size));
        if !grow {
            return Ok(());
        }
        if !self.workspaces.is_empty() {
            stream.synchronize().context(DeviceSnafu)?;
        }

        for (index, &size) in blob.workspace_sizes.iter().enumerate() {
            match self.workspaces.get(index) {
                Some(buffer) if buffer.size() >= size => {}
                _ => {
                    let buffer = DeviceBuffer::allocate(&self.ctx.driver, size, MemoryKind::Device).context(DeviceSnafu)?;
                    tracing::debug!(op.name = %self.op.name, index, size, ptr = %buffer.ptr(), "workspace reserved");
                    if index < self.workspaces.len() {
                        self.workspaces[index] = buffer;
                    } else {
                        self.workspaces.push(buffer);
                    }
                }
            }
        }
        Ok(())
    }

    fn build(&mut self, addresses: &TaskAddresses, blob: &TilingBlob) -> Result<()> {
        let (ctx, op, format) = (&self.ctx, &self.op, &self.format);
        let (target, clear, planned) = self.machine.step(&op.name, TaskState::Resolved, || {
            let target = LaunchTarget::resolve(ctx, op)?;
            let subset = derive_atomic_subset(op, blob);
            let clear = if subset.is_empty() { None } else { Some(AtomicClear::prepare(ctx, op, subset)?) };
            let planned = plan_args(ctx, op, format, addresses, blob, None)?;
            Ok((target, clear, planned))
        })?;

        let args = self.machine.step(&op.name, TaskState::Assembled, || {
            let mut parts = vec![(op.as_ref(), planned, blob)];
            if let Some(clear) = &clear {
                parts.push((clear.op(), clear.plan(ctx, addresses)?, clear.blob()));
            }
            TaskArgs::build(ctx, parts)
        })?;
        args.publish(ctx, &op.name);
        self.built = Some(Built { target, clear, args });
        Ok(())
    }

    fn refresh(&mut self, addresses: &TaskAddresses, blob: &TilingBlob) -> Result<()> {
        let Some(built) = self.built.as_mut() else {
            return InvalidTransitionSnafu { from: self.machine.state(), to: TaskState::Resolved }.fail();
        };
        ensure!(
            self.machine.state().can_transition(TaskState::Resolved),
            InvalidTransitionSnafu { from: self.machine.state(), to: TaskState::Resolved }
        );

        built.args.refresh(addresses)?;
        if self.op.attrs.soft_sync {
            built.args.refresh_tiling(MAIN, blob)?;
        }
        built.args.publish(&self.ctx, &self.op.name);
        self.machine.advance(TaskState::Resolved)?;
        self.machine.advance(TaskState::Assembled)
    }

    fn dispatch(&mut self, stream: &Stream) -> Result<()> {
        let (Some(built), Some(blob)) = (self.built.as_mut(), self.blob.as_ref()) else {
            return InvalidTransitionSnafu { from: self.machine.state(), to: TaskState::Dispatched }.fail();
        };

        built.args.upload(&self.ctx, stream.id())?;
        if let Some(clear) = &built.clear {
            clear.target().launch(&self.ctx, clear.blob(), built.args.launch_args(CLEAR)?, stream.id())?;
        }
        built.target.launch(&self.ctx, blob, built.args.launch_args(MAIN)?, stream.id())?;

        tracing::debug!(
            op.name = %self.op.name,
            stream = %stream.id(),
            tiling_key = blob.tiling_key,
            block_dim = blob.block_dim,
            "single op launched"
        );
        self.machine.advance(TaskState::Dispatched)
    }
}
