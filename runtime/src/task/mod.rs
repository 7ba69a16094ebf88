//! Device tasks.
//!
//! A task owns everything one operator launch needs: the assembled argument
//! buffer, its device copy, the refresh registry and the dump record. Three
//! families exist:
//!
//! - [`KernelTask`]: one kernel, optionally preceded by an atomic-clear task.
//! - [`FftsPlusTask`]: several contexts launched together.
//! - [`SingleOpTask`]: a standalone operator launched many times with
//!   caller-provided addresses.
//!
//! Every family walks the same state machine:
//!
//! ```text
//! Uninitialized -> FormatCompiled -> Resolved -> Assembled -> Dispatched
//!                                       ^                         |
//!                                       +------- refresh ---------+
//! ```

pub mod atomic;
pub mod ffts;
pub mod kernel;
pub mod single_op;

pub use atomic::AtomicClear;
pub use ffts::{FftsContextDesc, FftsPlusTask};
pub use kernel::KernelTask;
pub use single_op::SingleOpTask;

use snafu::{OptionExt, ResultExt, ensure};
use tessel_device::{DeviceBuffer, DevicePtr, LaunchArgs, MemoryKind, StreamId};

use crate::addresses::TaskAddresses;
use crate::args_format::CompiledFormat;
use crate::assembler::{ArgumentLayout, Assembled, Assembler, tensor_sizes};
use crate::buffer::align_up;
use crate::context::RuntimeContext;
use crate::descriptor::OperatorDescriptor;
use crate::dump::DumpReport;
use crate::error::*;
use crate::resolver::{ResolvedSlot, Resolver};
use crate::tiling::{AtomicSubset, TilingBlob};

// ============================================================================
// STATE MACHINE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TaskState {
    #[default]
    Uninitialized,
    FormatCompiled,
    Resolved,
    Assembled,
    Dispatched,
    /// Terminal.
    Failed,
}

impl TaskState {
    pub fn can_transition(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Uninitialized, FormatCompiled)
                | (FormatCompiled, Resolved)
                | (Resolved, Assembled)
                | (Assembled, Dispatched)
                | (Dispatched, Dispatched)
                | (Assembled | Dispatched, Resolved)
        ) || (self != Failed && to == Failed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    state: TaskState,
}

impl StateMachine {
    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_failed(&self) -> bool {
        self.state == TaskState::Failed
    }

    /// Operations on a failed task are rejected.
    pub fn ensure_live(&self, op: &str) -> Result<()> {
        ensure!(!self.is_failed(), TaskFailedSnafu { op });
        Ok(())
    }

    pub fn advance(&mut self, to: TaskState) -> Result<()> {
        ensure!(self.state.can_transition(to), InvalidTransitionSnafu { from: self.state, to });
        tracing::trace!(from = %self.state, %to, "task transition");
        self.state = to;
        Ok(())
    }

    pub fn fail(&mut self) {
        self.state = TaskState::Failed;
    }

    /// Run the work of the transition to `to`. Failing work moves the task
    /// to `Failed`; an invalid transition is rejected without running it.
    pub fn step<T>(&mut self, op: &str, to: TaskState, work: impl FnOnce() -> Result<T>) -> Result<T> {
        self.ensure_live(op)?;
        ensure!(self.state.can_transition(to), InvalidTransitionSnafu { from: self.state, to });
        match work() {
            Ok(value) => {
                self.advance(to)?;
                Ok(value)
            }
            Err(error) => {
                tracing::debug!(op, from = %self.state, %to, %error, "task failed");
                self.fail();
                Err(error)
            }
        }
    }
}

// ============================================================================
// ARGUMENTS
// ============================================================================

/// Alignment of each argument segment inside a shared allocation.
pub const SEGMENT_ALIGNMENT: usize = 64;

/// Resolved slots and planned layout of one argument buffer, not yet placed
/// in device memory.
#[derive(Debug, Clone)]
pub struct PlannedArgs {
    pub slots: Vec<ResolvedSlot>,
    pub layout: ArgumentLayout,
}

/// Resolve and lay out arguments for `op`.
pub fn plan_args(
    ctx: &RuntimeContext,
    op: &OperatorDescriptor,
    format: &CompiledFormat,
    addresses: &TaskAddresses,
    blob: &TilingBlob,
    atomic: Option<&AtomicSubset>,
) -> Result<PlannedArgs> {
    let mut resolver = Resolver::new(op, format, addresses, ctx.hidden.as_ref());
    if let Some(subset) = atomic {
        resolver = resolver.with_atomic_subset(subset);
    }
    let slots = resolver.resolve()?;
    let layout = Assembler::new(&ctx.config).plan(op, &slots, blob)?;
    Ok(PlannedArgs { slots, layout })
}

/// One argument buffer inside a task's device allocation.
#[derive(Debug, Clone)]
pub struct ArgumentSegment {
    pub offset: usize,
    pub assembled: Assembled,
}

/// Device argument memory of a task and the host mirrors of its segments.
///
/// Uploads are enqueued on the launch stream ahead of the launch, so stream
/// ordering guarantees the kernel reads the current bytes.
#[derive(Debug)]
pub struct TaskArgs {
    device: DeviceBuffer,
    segments: Vec<ArgumentSegment>,
    dirty: bool,
}

impl TaskArgs {
    /// Allocate one device buffer for `planned` and fill every segment
    /// against its final device address. Segments start
    /// [`SEGMENT_ALIGNMENT`]-aligned.
    pub fn build(ctx: &RuntimeContext, parts: Vec<(&OperatorDescriptor, PlannedArgs, &TilingBlob)>) -> Result<Self> {
        let mut offsets = Vec::with_capacity(parts.len());
        let mut total = 0usize;
        for (_, planned, _) in &parts {
            let offset = align_up(total, SEGMENT_ALIGNMENT).context(CapacityOverflowSnafu { what: "segment" })?;
            offsets.push(offset);
            total = offset.checked_add(planned.layout.total).context(CapacityOverflowSnafu { what: "segment" })?;
        }

        let device = DeviceBuffer::allocate(&ctx.driver, total, MemoryKind::Device).context(DeviceSnafu)?;
        let assembler = Assembler::new(&ctx.config);
        let mut segments = Vec::with_capacity(parts.len());
        for ((op, planned, blob), offset) in parts.into_iter().zip(offsets) {
            let base = device.ptr().offset(offset).context(CapacityOverflowSnafu { what: "device address" })?;
            let sizes = tensor_sizes(op, blob);
            let assembled = assembler.fill(op, planned.layout, &planned.slots, blob, &sizes, base)?;
            segments.push(ArgumentSegment { offset, assembled });
        }

        tracing::debug!(args.ptr = %device.ptr(), args.size = total, segments = segments.len(), "task arguments built");
        Ok(Self { device, segments, dirty: true })
    }

    pub fn device_ptr(&self) -> DevicePtr {
        self.device.ptr()
    }

    pub fn segments(&self) -> &[ArgumentSegment] {
        &self.segments
    }

    pub fn segment(&self, index: usize) -> Option<&ArgumentSegment> {
        self.segments.get(index)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Device location of one segment, as handed to the launch primitive.
    pub fn launch_args(&self, index: usize) -> Result<LaunchArgs> {
        let segment = self.segment(index).context(ResolveIndexOutOfRangeSnafu {
            what: "argument segment",
            index,
            len: self.segments.len(),
        })?;
        let ptr = self.device.ptr().offset(segment.offset).context(CapacityOverflowSnafu { what: "device address" })?;
        Ok(LaunchArgs { ptr, size: segment.assembled.layout.total })
    }

    /// Enqueue the host mirrors on `stream` if they changed since the last
    /// upload.
    pub fn upload(&mut self, ctx: &RuntimeContext, stream: StreamId) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        for segment in &self.segments {
            if segment.assembled.buffer.is_empty() {
                continue;
            }
            let dst =
                self.device.ptr().offset(segment.offset).context(CapacityOverflowSnafu { what: "device address" })?;
            ctx.driver.memcpy_htod_async(dst, segment.assembled.buffer.as_bytes(), stream).context(DeviceSnafu)?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Patch the address words of every segment against `addresses`.
    pub fn refresh(&mut self, addresses: &TaskAddresses) -> Result<usize> {
        let per_segment = vec![addresses; self.segments.len()];
        self.refresh_each(&per_segment)
    }

    /// Patch segment `i` against `addresses[i]`. Nothing is written unless
    /// every segment accepts its addresses.
    pub fn refresh_each(&mut self, addresses: &[&TaskAddresses]) -> Result<usize> {
        ensure!(
            addresses.len() == self.segments.len(),
            ResolveIndexOutOfRangeSnafu { what: "argument segment", index: addresses.len(), len: self.segments.len() }
        );
        let mut patched = 0;
        let mut staged = Vec::with_capacity(self.segments.len());
        for (segment, addresses) in self.segments.iter().zip(addresses) {
            let mut buffer = segment.assembled.buffer.clone();
            patched += segment.assembled.refresh.refresh(&mut buffer, addresses)?;
            staged.push(buffer);
        }
        for (segment, buffer) in self.segments.iter_mut().zip(staged) {
            segment.assembled.buffer = buffer;
        }
        self.dirty = true;
        Ok(patched)
    }

    /// Rewrite the tiling region of segment `index` from a new tiling result.
    pub fn refresh_tiling(&mut self, index: usize, blob: &TilingBlob) -> Result<()> {
        let len = self.segments.len();
        let segment = self.segments.get_mut(index).context(ResolveIndexOutOfRangeSnafu {
            what: "argument segment",
            index,
            len,
        })?;
        let Assembled { buffer, refresh, .. } = &mut segment.assembled;
        refresh.refresh_tiling(buffer, blob)?;
        self.dirty = true;
        Ok(())
    }

    /// Hand every segment to the diagnostics sink.
    pub fn publish(&self, ctx: &RuntimeContext, op_name: &str) {
        for segment in &self.segments {
            let assembled = &segment.assembled;
            let device_addr = self.device.ptr().offset(segment.offset).unwrap_or(DevicePtr::NULL);
            ctx.diagnostics.publish(&DumpReport {
                op_name,
                args: assembled.buffer.as_bytes(),
                device_addr,
                record: &assembled.dump,
                folded: assembled.layout.is_folded(),
            });
        }
    }
}
