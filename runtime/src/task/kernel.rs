//! Single-kernel task.
//!
//! Argument segment 0 holds the kernel's own arguments; segment 1, when
//! present, those of its atomic-clear companion. Both share one device
//! allocation.

use std::sync::Arc;

use snafu::{OptionExt, ensure};
use tessel_device::Stream;

use crate::addresses::TaskAddresses;
use crate::args_format::{ArgumentFormat, CompiledFormat};
use crate::context::RuntimeContext;
use crate::descriptor::OperatorDescriptor;
use crate::dispatch::LaunchTarget;
use crate::dump::DumpRecord;
use crate::error::*;
use crate::task::{AtomicClear, PlannedArgs, StateMachine, TaskArgs, TaskState, plan_args};
use crate::tiling::{TilingBlob, derive_atomic_subset};

const MAIN: usize = 0;
const CLEAR: usize = 1;

/// Everything the resolve step produces.
#[derive(Debug)]
struct Resolution {
    addresses: TaskAddresses,
    blob: TilingBlob,
    target: LaunchTarget,
    clear: Option<AtomicClear>,
    planned: PlannedArgs,
}

#[derive(Debug)]
pub struct KernelTask {
    ctx: Arc<RuntimeContext>,
    op: Arc<OperatorDescriptor>,
    machine: StateMachine,
    format: Option<CompiledFormat>,
    resolution: Option<Resolution>,
    args: Option<TaskArgs>,
}

impl KernelTask {
    pub fn new(ctx: Arc<RuntimeContext>, op: Arc<OperatorDescriptor>) -> Self {
        Self { ctx, op, machine: StateMachine::default(), format: None, resolution: None, args: None }
    }

    /// Compile, resolve and assemble in one go.
    #[tracing::instrument(skip_all, fields(op.name = %op.name))]
    pub fn build(ctx: Arc<RuntimeContext>, op: Arc<OperatorDescriptor>, addresses: TaskAddresses) -> Result<Self> {
        let mut task = Self::new(ctx, op);
        task.compile_format()?;
        task.resolve(addresses)?;
        task.assemble()?;
        Ok(task)
    }

    pub fn state(&self) -> TaskState {
        self.machine.state()
    }

    pub fn op(&self) -> &OperatorDescriptor {
        &self.op
    }

    pub fn format(&self) -> Option<&CompiledFormat> {
        self.format.as_ref()
    }

    pub fn blob(&self) -> Option<&TilingBlob> {
        self.resolution.as_ref().map(|r| &r.blob)
    }

    pub fn target(&self) -> Option<&LaunchTarget> {
        self.resolution.as_ref().map(|r| &r.target)
    }

    pub fn atomic_clear(&self) -> Option<&AtomicClear> {
        self.resolution.as_ref().and_then(|r| r.clear.as_ref())
    }

    pub fn args(&self) -> Option<&TaskArgs> {
        self.args.as_ref()
    }

    pub fn dump(&self) -> Option<&DumpRecord> {
        Some(&self.args.as_ref()?.segment(MAIN)?.assembled.dump)
    }

    pub fn compile_format(&mut self) -> Result<()> {
        let op = &self.op;
        let format = self.machine.step(&op.name, TaskState::FormatCompiled, || ArgumentFormat::compile(op))?;
        self.format = Some(format);
        Ok(())
    }

    /// Tile the operator, resolve kernel handles and every argument slot
    /// against `addresses`, and plan the buffer layout.
    pub fn resolve(&mut self, addresses: TaskAddresses) -> Result<()> {
        let (ctx, op) = (&self.ctx, &self.op);
        let format = self.format.as_ref();
        let resolution = self.machine.step(&op.name, TaskState::Resolved, || {
            let format = format.context(InvalidTransitionSnafu {
                from: TaskState::Uninitialized,
                to: TaskState::Resolved,
            })?;
            let blob = ctx.tiling_injector().inject(op)?;
            let target = LaunchTarget::resolve(ctx, op)?;
            let subset = derive_atomic_subset(op, &blob);
            let clear = if subset.is_empty() { None } else { Some(AtomicClear::prepare(ctx, op, subset)?) };
            let planned = plan_args(ctx, op, format, &addresses, &blob, None)?;
            Ok(Resolution { addresses, blob, target, clear, planned })
        })?;
        self.resolution = Some(resolution);
        Ok(())
    }

    /// Allocate device argument memory and write the buffers. After a
    /// refresh the buffers are already current and only need uploading.
    pub fn assemble(&mut self) -> Result<()> {
        let (ctx, op) = (&self.ctx, &self.op);
        let resolution = self.resolution.as_ref();
        let existing = self.args.is_some();
        let built = self.machine.step(&op.name, TaskState::Assembled, || {
            if existing {
                return Ok(None);
            }
            let resolution = resolution.context(InvalidTransitionSnafu {
                from: TaskState::FormatCompiled,
                to: TaskState::Assembled,
            })?;
            let mut parts = vec![(op.as_ref(), resolution.planned.clone(), &resolution.blob)];
            if let Some(clear) = &resolution.clear {
                parts.push((clear.op(), clear.plan(ctx, &resolution.addresses)?, clear.blob()));
            }
            let args = TaskArgs::build(ctx, parts)?;
            args.publish(ctx, &op.name);
            Ok(Some(args))
        })?;
        if let Some(args) = built {
            tracing::debug!(op.name = %op.name, args.ptr = %args.device_ptr(), "kernel task assembled");
            self.args = Some(args);
        }
        Ok(())
    }

    /// Submit the task on `stream`: atomic clear first, then the kernel.
    ///
    /// Soft-sync operators are re-tiled first; a tiling failure fails this
    /// dispatch only. Launch failures never fail the task.
    pub fn launch(&mut self, stream: &Stream) -> Result<()> {
        self.machine.ensure_live(&self.op.name)?;
        if self.machine.state() == TaskState::Resolved {
            self.assemble()?;
        }
        ensure!(
            self.machine.state().can_transition(TaskState::Dispatched),
            InvalidTransitionSnafu { from: self.machine.state(), to: TaskState::Dispatched }
        );
        let (Some(resolution), Some(args)) = (self.resolution.as_mut(), self.args.as_mut()) else {
            return InvalidTransitionSnafu { from: self.machine.state(), to: TaskState::Dispatched }.fail();
        };

        if self.op.attrs.soft_sync && self.op.has_tiling() {
            let blob = self.ctx.tiling_injector().inject(&self.op)?;
            args.refresh_tiling(MAIN, &blob)?;
            args.publish(&self.ctx, &self.op.name);
            resolution.blob = blob;
        }

        args.upload(&self.ctx, stream.id())?;
        if let Some(clear) = &resolution.clear {
            clear.target().launch(&self.ctx, clear.blob(), args.launch_args(CLEAR)?, stream.id())?;
        }
        resolution.target.launch(&self.ctx, &resolution.blob, args.launch_args(MAIN)?, stream.id())?;

        tracing::debug!(op.name = %self.op.name, stream = %stream.id(), "kernel task launched");
        self.machine.advance(TaskState::Dispatched)
    }

    /// Re-point the task at new addresses without re-running format
    /// compilation, resolution or layout. A rejected refresh leaves the
    /// buffers untouched.
    pub fn refresh(&mut self, addresses: TaskAddresses) -> Result<usize> {
        self.machine.ensure_live(&self.op.name)?;
        ensure!(
            self.machine.state().can_transition(TaskState::Resolved),
            InvalidTransitionSnafu { from: self.machine.state(), to: TaskState::Resolved }
        );
        let (Some(resolution), Some(args)) = (self.resolution.as_mut(), self.args.as_mut()) else {
            return InvalidTransitionSnafu { from: self.machine.state(), to: TaskState::Resolved }.fail();
        };

        let patched = args.refresh(&addresses)?;
        resolution.addresses = addresses;
        args.publish(&self.ctx, &self.op.name);
        tracing::debug!(op.name = %self.op.name, patched, "kernel task refreshed");
        self.machine.advance(TaskState::Resolved)?;
        Ok(patched)
    }
}
