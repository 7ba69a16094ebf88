//! FFTS+ multi-context task.
//!
//! Compute contexts (AI-core, mixed AI-core, AI-CPU) and pure data-movement
//! contexts are submitted as one launch. Every compute context gets its own
//! argument segment inside a single device allocation, and mixed contexts
//! carry the FFTS+ control address as their first argument word. A context
//! that needs atomic clear is preceded by a clear context of its own.

use std::sync::Arc;

use snafu::{OptionExt, ResultExt, ensure};
use tessel_device::{DevicePtr, FftsContext, FftsPlusLaunch, Stream};

use crate::addresses::{LogicalAddress, TaskAddresses};
use crate::args_format::{ArgumentFormat, Direction};
use crate::context::RuntimeContext;
use crate::descriptor::OperatorDescriptor;
use crate::dispatch::LaunchTarget;
use crate::error::*;
use crate::task::{AtomicClear, PlannedArgs, StateMachine, TaskArgs, TaskState, plan_args};
use crate::tiling::{TilingBlob, derive_atomic_subset};

/// One context as described by the graph loader.
#[derive(Debug, Clone)]
pub enum FftsContextDesc {
    Compute { op: Arc<OperatorDescriptor>, mixed: bool },
    /// Copy `len` bytes; both ends are looked up in the context's addresses
    /// at every launch.
    DataMovement { src: LogicalAddress, dst: LogicalAddress, len: usize },
}

#[derive(Debug)]
struct ComputeContext {
    op: Arc<OperatorDescriptor>,
    mixed: bool,
    blob: TilingBlob,
    target: LaunchTarget,
    /// Argument segment of this context.
    segment: usize,
    /// Clear companion and its segment.
    clear: Option<(AtomicClear, usize)>,
}

#[derive(Debug)]
enum BuiltContext {
    Compute(ComputeContext),
    DataMovement { src: LogicalAddress, dst: LogicalAddress, len: usize },
}

#[derive(Debug)]
pub struct FftsPlusTask {
    ctx: Arc<RuntimeContext>,
    name: String,
    machine: StateMachine,
    contexts: Vec<BuiltContext>,
    /// Per context, in context order.
    addresses: Vec<TaskAddresses>,
    args: TaskArgs,
}

impl FftsPlusTask {
    /// Build every context against its entry in `addresses`.
    #[tracing::instrument(skip_all, fields(task.name = %name.as_ref(), contexts = descs.len()))]
    pub fn build(
        ctx: Arc<RuntimeContext>,
        name: impl AsRef<str>,
        descs: Vec<FftsContextDesc>,
        addresses: Vec<TaskAddresses>,
    ) -> Result<Self> {
        let name = name.as_ref().to_string();
        ensure!(
            descs.len() == addresses.len(),
            ResolveIndexOutOfRangeSnafu { what: "ffts+ context addresses", index: addresses.len(), len: descs.len() }
        );

        let mut machine = StateMachine::default();
        let mut formats = machine.step(&name, TaskState::FormatCompiled, || {
            descs
                .iter()
                .map(|desc| match desc {
                    FftsContextDesc::Compute { op, mixed } => {
                        ensure!(
                            !op.attrs.soft_sync,
                            UnsupportedKernelSnafu { op: &op.name, context: "soft-sync ffts+ context" }
                        );
                        let format = match &op.args_format {
                            Some(text) => ArgumentFormat::parse(text)?,
                            None => ArgumentFormat::default_for(op),
                        };
                        let format = if *mixed { format.with_control_address() } else { format };
                        Ok(Some(format.check(op)?))
                    }
                    FftsContextDesc::DataMovement { .. } => Ok(None),
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let (contexts, planned) = machine.step(&name, TaskState::Resolved, || {
            let mut contexts = Vec::with_capacity(descs.len());
            let mut planned: Vec<PlannedArgs> = Vec::new();
            for ((desc, format), addresses) in descs.into_iter().zip(formats.iter_mut()).zip(&addresses) {
                let built = match desc {
                    FftsContextDesc::Compute { op, mixed } => {
                        let format = format.take().context(CapacityOverflowSnafu { what: "ffts+ format" })?;
                        let blob = ctx.tiling_injector().inject(&op)?;
                        let target = LaunchTarget::resolve(&ctx, &op)?;
                        let subset = derive_atomic_subset(&op, &blob);

                        let clear = if subset.is_empty() {
                            None
                        } else {
                            let clear = AtomicClear::prepare(&ctx, &op, subset)?;
                            planned.push(clear.plan(&ctx, addresses)?);
                            Some((clear, planned.len() - 1))
                        };
                        let args = plan_args(&ctx, &op, &format, addresses, &blob, None)?;
                        planned.push(args);
                        let segment = planned.len() - 1;
                        BuiltContext::Compute(ComputeContext { op, mixed, blob, target, segment, clear })
                    }
                    FftsContextDesc::DataMovement { src, dst, len } => BuiltContext::DataMovement { src, dst, len },
                };
                contexts.push(built);
            }
            Ok((contexts, planned))
        })?;

        let args = machine.step(&name, TaskState::Assembled, || {
            let parts = planned
                .into_iter()
                .zip(segment_sources(&contexts))
                .map(|(planned, (op, blob))| (op, planned, blob))
                .collect();
            TaskArgs::build(&ctx, parts)
        })?;
        args.publish(&ctx, &name);

        tracing::debug!(args.ptr = %args.device_ptr(), segments = args.segments().len(), "ffts+ task assembled");
        Ok(Self { ctx, name, machine, contexts, addresses, args })
    }

    pub fn state(&self) -> TaskState {
        self.machine.state()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &TaskArgs {
        &self.args
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// FFTS+ descriptor for the current addresses.
    pub fn descriptor(&self) -> Result<FftsPlusLaunch> {
        let mut contexts = Vec::with_capacity(self.contexts.len());
        for (built, addresses) in self.contexts.iter().zip(&self.addresses) {
            match built {
                BuiltContext::Compute(compute) => {
                    if let Some((clear, segment)) = &compute.clear {
                        let args = self.args.launch_args(*segment)?;
                        contexts.push(clear.target().ffts_context(clear.blob(), args, false));
                    }
                    let args = self.args.launch_args(compute.segment)?;
                    contexts.push(compute.target.ffts_context(&compute.blob, args, compute.mixed));
                }
                BuiltContext::DataMovement { src, dst, len } => {
                    let (src, dst) = (movement_address(addresses, *src)?, movement_address(addresses, *dst)?);
                    contexts.push(FftsContext::DataMovement { src, dst, len: *len });
                }
            }
        }
        Ok(FftsPlusLaunch { contexts })
    }

    pub fn launch(&mut self, stream: &Stream) -> Result<()> {
        self.machine.ensure_live(&self.name)?;
        if self.machine.state() == TaskState::Resolved {
            self.machine.advance(TaskState::Assembled)?;
        }
        ensure!(
            self.machine.state().can_transition(TaskState::Dispatched),
            InvalidTransitionSnafu { from: self.machine.state(), to: TaskState::Dispatched }
        );

        let launch = self.descriptor()?;
        self.args.upload(&self.ctx, stream.id())?;
        self.ctx.driver.launch_ffts_plus(&launch, stream.id()).context(DeviceSnafu)?;
        if self.ctx.config.sync_after_launch {
            stream.synchronize().context(DeviceSnafu)?;
        }

        tracing::debug!(task.name = %self.name, contexts = launch.contexts.len(), "ffts+ task launched");
        self.machine.advance(TaskState::Dispatched)
    }

    /// Re-point every context at new addresses, one entry per context.
    pub fn refresh(&mut self, addresses: Vec<TaskAddresses>) -> Result<usize> {
        self.machine.ensure_live(&self.name)?;
        ensure!(
            self.machine.state().can_transition(TaskState::Resolved),
            InvalidTransitionSnafu { from: self.machine.state(), to: TaskState::Resolved }
        );
        ensure!(
            addresses.len() == self.contexts.len(),
            ResolveIndexOutOfRangeSnafu {
                what: "ffts+ context addresses",
                index: addresses.len(),
                len: self.contexts.len()
            }
        );

        let mut per_segment = vec![None; self.args.segments().len()];
        for (built, addresses) in self.contexts.iter().zip(&addresses) {
            if let BuiltContext::Compute(compute) = built {
                per_segment[compute.segment] = Some(addresses);
                if let Some((_, segment)) = &compute.clear {
                    per_segment[*segment] = Some(addresses);
                }
            }
        }
        let per_segment =
            per_segment.into_iter().collect::<Option<Vec<_>>>().context(CapacityOverflowSnafu { what: "segment" })?;
        let patched = self.args.refresh_each(&per_segment)?;

        self.addresses = addresses;
        self.args.publish(&self.ctx, &self.name);
        self.machine.advance(TaskState::Resolved)?;
        Ok(patched)
    }
}

fn movement_address(addresses: &TaskAddresses, addr: LogicalAddress) -> Result<DevicePtr> {
    if let Some(ptr) = addresses.device_ptr(addr) {
        return Ok(ptr);
    }
    match addr {
        LogicalAddress::Input(index) => ResolveMissingTensorSnafu { direction: Direction::Input, index }.fail(),
        LogicalAddress::Output(index) => ResolveMissingTensorSnafu { direction: Direction::Output, index }.fail(),
        LogicalAddress::Workspace(index) => {
            ResolveIndexOutOfRangeSnafu { what: "workspace", index, len: addresses.workspaces.len() }.fail()
        }
    }
}

/// Operator and tiling blob of every argument segment, in segment order.
fn segment_sources(contexts: &[BuiltContext]) -> Vec<(&OperatorDescriptor, &TilingBlob)> {
    let mut sources = Vec::new();
    for built in contexts {
        if let BuiltContext::Compute(compute) = built {
            if let Some((clear, _)) = &compute.clear {
                sources.push((clear.op(), clear.blob()));
            }
            sources.push((compute.op.as_ref(), &compute.blob));
        }
    }
    sources
}
