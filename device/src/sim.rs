//! In-process simulated driver.
//!
//! Device memory lives in host vectors addressed from a fixed base. Every
//! stream operation executes immediately at enqueue time, which trivially
//! satisfies per-stream FIFO ordering. Launches snapshot the bytes of their
//! argument buffer so callers can inspect exactly what the kernel would have
//! read.
//!
//! Failures can be injected one-shot per [`FailurePoint`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use enumset::{EnumSet, EnumSetType};
use parking_lot::{Mutex, RwLock};
use snafu::ensure;

use crate::driver::Driver;
use crate::error::{
    AllocationFailedSnafu, BinaryRejectedSnafu, CopyFailedSnafu, EventTimeoutSnafu, InvalidAddressSnafu,
    LaunchFailedSnafu, OutOfBoundsSnafu, Result, UnknownBinarySnafu, UnknownEventSnafu, UnknownFunctionSnafu,
    UnknownStreamSnafu,
};
use crate::launch::{
    AiCpuLaunch, BinHandle, ContextEntry, FftsContext, FftsPlusLaunch, FuncHandle, HandleLaunch, KernelBinary,
    KernelLaunch, LaunchArgs,
};
use crate::memory::{DevicePtr, MemoryKind};
use crate::stream::{EventId, StreamId};
use crate::sync::HostEvent;

/// First address handed out by the simulator.
pub const SIM_BASE_ADDR: u64 = 0x1_0000_0000;

/// Alignment of every simulated allocation.
pub const SIM_ALIGNMENT: u64 = 64;

/// Driver entry points that can be armed to fail once.
#[derive(Debug, EnumSetType, strum::Display)]
pub enum FailurePoint {
    Malloc,
    Copy,
    Launch,
    RegisterBinary,
}

/// A launch as observed by the device, with argument bytes captured at
/// launch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchRecord {
    Kernel { launch: KernelLaunch, args: Vec<u8> },
    Handle { launch: HandleLaunch, args: Vec<u8> },
    AiCpu { launch: AiCpuLaunch, args: Vec<u8> },
    /// One argument snapshot per context; data-movement contexts record none.
    FftsPlus { launch: FftsPlusLaunch, args: Vec<Vec<u8>> },
}

impl LaunchRecord {
    /// Argument bytes of a single-kernel launch, or of the first FFTS+ context.
    pub fn args(&self) -> &[u8] {
        match self {
            Self::Kernel { args, .. } | Self::Handle { args, .. } | Self::AiCpu { args, .. } => args,
            Self::FftsPlus { args, .. } => args.first().map(Vec::as_slice).unwrap_or_default(),
        }
    }
}

/// Stream-ordered operation log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOp {
    CopyHtoD { dst: DevicePtr, len: usize },
    /// Index into [`SimDriver::launches`].
    Launch(usize),
    RecordEvent(EventId),
    WaitEvent(EventId),
    ResetEvent(EventId),
}

#[derive(Debug)]
struct Allocation {
    data: Vec<u8>,
    kind: MemoryKind,
}

#[derive(Debug)]
struct SimEvent {
    host: Arc<HostEvent>,
    /// 8-byte device word mirroring the reached flag.
    addr: DevicePtr,
}

#[derive(Debug, Default)]
struct SimState {
    next_addr: u64,
    allocations: BTreeMap<u64, Allocation>,
    total_allocations: usize,
    streams: HashSet<StreamId>,
    next_stream: u32,
    events: HashMap<EventId, SimEvent>,
    next_event: u32,
    binaries: HashMap<BinHandle, KernelBinary>,
    functions: HashMap<FuncHandle, (BinHandle, String)>,
    next_handle: u64,
    launches: Vec<LaunchRecord>,
    ops: Vec<(StreamId, StreamOp)>,
}

impl SimState {
    fn alloc(&mut self, size: usize, kind: MemoryKind) -> Result<DevicePtr> {
        let span = u64::try_from(size.max(1))
            .ok()
            .and_then(|size| size.checked_next_multiple_of(SIM_ALIGNMENT))
            .and_then(|span| self.next_addr.checked_add(span));
        let Some(next) = span else {
            return AllocationFailedSnafu { size, reason: "address space exhausted" }.fail();
        };

        let base = self.next_addr;
        self.next_addr = next;
        self.allocations.insert(base, Allocation { data: vec![0; size], kind });
        self.total_allocations += 1;
        Ok(DevicePtr(base))
    }

    /// Locate `len` bytes at `addr`: returns the allocation base and the
    /// offset of `addr` within it.
    fn locate(&self, addr: DevicePtr, len: usize) -> Result<(u64, usize)> {
        let Some((&base, allocation)) = self.allocations.range(..=addr.addr()).next_back() else {
            return InvalidAddressSnafu { addr }.fail();
        };
        let offset = usize::try_from(addr.addr() - base).unwrap_or(usize::MAX);
        let size = allocation.data.len();
        ensure!(offset < size || (offset == size && len == 0), InvalidAddressSnafu { addr });
        ensure!(
            offset.checked_add(len).is_some_and(|end| end <= size),
            OutOfBoundsSnafu { addr, size: len, allocation_size: size }
        );
        Ok((base, offset))
    }

    fn write(&mut self, addr: DevicePtr, src: &[u8]) -> Result<()> {
        let (base, offset) = self.locate(addr, src.len())?;
        if let Some(allocation) = self.allocations.get_mut(&base) {
            allocation.data[offset..offset + src.len()].copy_from_slice(src);
        }
        Ok(())
    }

    fn read(&self, addr: DevicePtr, len: usize) -> Result<Vec<u8>> {
        let (base, offset) = self.locate(addr, len)?;
        Ok(self.allocations.get(&base).map(|a| a.data[offset..offset + len].to_vec()).unwrap_or_default())
    }

    fn snapshot(&self, args: LaunchArgs) -> Result<Vec<u8>> {
        if args.size == 0 {
            return Ok(Vec::new());
        }
        self.read(args.ptr, args.size)
    }

    fn check_stream(&self, stream: StreamId) -> Result<()> {
        ensure!(self.streams.contains(&stream), UnknownStreamSnafu { stream });
        Ok(())
    }

    fn check_function(&self, handle: FuncHandle) -> Result<()> {
        ensure!(self.functions.contains_key(&handle), UnknownFunctionSnafu { handle });
        Ok(())
    }

    fn check_binary(&self, handle: BinHandle) -> Result<()> {
        ensure!(self.binaries.contains_key(&handle), UnknownBinarySnafu { handle });
        Ok(())
    }

    fn event(&self, event: EventId) -> Result<&SimEvent> {
        self.events.get(&event).ok_or_else(|| UnknownEventSnafu { event }.build())
    }

    fn push_launch(&mut self, stream: StreamId, record: LaunchRecord) {
        let index = self.launches.len();
        self.launches.push(record);
        self.ops.push((stream, StreamOp::Launch(index)));
    }
}

/// Simulated accelerator.
#[derive(Debug)]
pub struct SimDriver {
    state: Mutex<SimState>,
    armed: RwLock<EnumSet<FailurePoint>>,
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDriver {
    pub fn new() -> Self {
        let state = SimState { next_addr: SIM_BASE_ADDR, ..Default::default() };
        Self { state: Mutex::new(state), armed: RwLock::new(EnumSet::empty()) }
    }

    /// Make the next call through `point` fail.
    pub fn fail_next(&self, point: FailurePoint) {
        self.armed.write().insert(point);
    }

    fn take_failure(&self, point: FailurePoint) -> bool {
        if !self.armed.read().contains(point) {
            return false;
        }
        self.armed.write().remove(point)
    }

    /// Every launch observed so far, in submission order.
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.state.lock().launches.clone()
    }

    pub fn ops(&self) -> Vec<(StreamId, StreamOp)> {
        self.state.lock().ops.clone()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Number of successful `malloc` calls, including freed allocations.
    pub fn total_allocations(&self) -> usize {
        self.state.lock().total_allocations
    }

    pub fn registered_binaries(&self) -> usize {
        self.state.lock().binaries.len()
    }

    pub fn allocation_kind(&self, ptr: DevicePtr) -> Option<MemoryKind> {
        self.state.lock().allocations.get(&ptr.addr()).map(|a| a.kind)
    }

    pub fn read(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>> {
        self.state.lock().read(ptr, len)
    }

    /// Write device memory directly, as a kernel would.
    pub fn write(&self, ptr: DevicePtr, src: &[u8]) -> Result<()> {
        self.state.lock().write(ptr, src)
    }

    pub fn read_u64(&self, ptr: DevicePtr) -> Result<u64> {
        let bytes = self.read(ptr, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(word))
    }
}

impl Driver for SimDriver {
    fn malloc(&self, size: usize, kind: MemoryKind) -> Result<DevicePtr> {
        if self.take_failure(FailurePoint::Malloc) {
            return AllocationFailedSnafu { size, reason: "injected failure" }.fail();
        }
        let ptr = self.state.lock().alloc(size, kind)?;
        tracing::trace!(%ptr, size, %kind, "sim malloc");
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let removed = self.state.lock().allocations.remove(&ptr.addr());
        ensure!(removed.is_some(), InvalidAddressSnafu { addr: ptr });
        tracing::trace!(%ptr, "sim free");
        Ok(())
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        if self.take_failure(FailurePoint::Copy) {
            return CopyFailedSnafu { reason: "injected failure" }.fail();
        }
        self.state.lock().write(dst, src)
    }

    fn memcpy_htod_async(&self, dst: DevicePtr, src: &[u8], stream: StreamId) -> Result<()> {
        if self.take_failure(FailurePoint::Copy) {
            return CopyFailedSnafu { reason: "injected failure" }.fail();
        }
        let mut state = self.state.lock();
        state.check_stream(stream)?;
        state.write(dst, src)?;
        state.ops.push((stream, StreamOp::CopyHtoD { dst, len: src.len() }));
        Ok(())
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        if self.take_failure(FailurePoint::Copy) {
            return CopyFailedSnafu { reason: "injected failure" }.fail();
        }
        let bytes = self.state.lock().read(src, dst.len())?;
        dst.copy_from_slice(&bytes);
        Ok(())
    }

    fn create_stream(&self) -> Result<StreamId> {
        let mut state = self.state.lock();
        let stream = StreamId(state.next_stream);
        state.next_stream += 1;
        state.streams.insert(stream);
        Ok(stream)
    }

    fn destroy_stream(&self, stream: StreamId) -> Result<()> {
        let removed = self.state.lock().streams.remove(&stream);
        ensure!(removed, UnknownStreamSnafu { stream });
        Ok(())
    }

    fn synchronize_stream(&self, stream: StreamId) -> Result<()> {
        // Work executes at enqueue time; nothing is ever pending.
        self.state.lock().check_stream(stream)
    }

    fn create_event(&self) -> Result<EventId> {
        let mut state = self.state.lock();
        let event = EventId(state.next_event);
        state.next_event += 1;
        let addr = state.alloc(8, MemoryKind::Device)?;
        state.events.insert(event, SimEvent { host: Arc::new(HostEvent::new()), addr });
        Ok(event)
    }

    fn record_event(&self, event: EventId, stream: StreamId) -> Result<()> {
        let mut state = self.state.lock();
        state.check_stream(stream)?;
        let (host, addr) = {
            let sim = state.event(event)?;
            (Arc::clone(&sim.host), sim.addr)
        };
        host.record();
        state.write(addr, &1u64.to_le_bytes())?;
        state.ops.push((stream, StreamOp::RecordEvent(event)));
        Ok(())
    }

    fn stream_wait_event(&self, stream: StreamId, event: EventId) -> Result<()> {
        let mut state = self.state.lock();
        state.check_stream(stream)?;
        state.event(event)?;
        state.ops.push((stream, StreamOp::WaitEvent(event)));
        Ok(())
    }

    fn reset_event(&self, event: EventId, stream: StreamId) -> Result<()> {
        let mut state = self.state.lock();
        state.check_stream(stream)?;
        let (host, addr) = {
            let sim = state.event(event)?;
            (Arc::clone(&sim.host), sim.addr)
        };
        host.reset();
        state.write(addr, &0u64.to_le_bytes())?;
        state.ops.push((stream, StreamOp::ResetEvent(event)));
        Ok(())
    }

    fn synchronize_event(&self, event: EventId, timeout_ms: u64) -> Result<()> {
        // Release the state lock before blocking so other threads can record.
        let host = {
            let state = self.state.lock();
            Arc::clone(&state.event(event)?.host)
        };
        ensure!(host.wait(timeout_ms), EventTimeoutSnafu { event, timeout_ms });
        Ok(())
    }

    fn event_address(&self, event: EventId) -> Result<DevicePtr> {
        Ok(self.state.lock().event(event)?.addr)
    }

    fn register_binary(&self, binary: &KernelBinary) -> Result<BinHandle> {
        if self.take_failure(FailurePoint::RegisterBinary) {
            return BinaryRejectedSnafu { key: binary.key.clone(), reason: "injected failure" }.fail();
        }
        ensure!(!binary.bytes.is_empty(), BinaryRejectedSnafu { key: binary.key.clone(), reason: "empty binary" });

        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = BinHandle(state.next_handle);
        state.binaries.insert(handle, binary.clone());
        tracing::debug!(%handle, key = %binary.key, kind = %binary.kind, "sim binary registered");
        Ok(handle)
    }

    fn register_function(&self, bin: BinHandle, stub: &str) -> Result<FuncHandle> {
        let mut state = self.state.lock();
        state.check_binary(bin)?;
        state.next_handle += 1;
        let handle = FuncHandle(state.next_handle);
        state.functions.insert(handle, (bin, stub.to_string()));
        Ok(handle)
    }

    fn launch_kernel(&self, launch: &KernelLaunch, stream: StreamId) -> Result<()> {
        if self.take_failure(FailurePoint::Launch) {
            return LaunchFailedSnafu { reason: "injected failure" }.fail();
        }
        let mut state = self.state.lock();
        state.check_stream(stream)?;
        state.check_function(launch.func)?;
        let args = state.snapshot(launch.args)?;
        tracing::debug!(func = %launch.func, block_dim = launch.config.block_dim, args = args.len(), "sim launch");
        state.push_launch(stream, LaunchRecord::Kernel { launch: launch.clone(), args });
        Ok(())
    }

    fn launch_kernel_with_handle(&self, launch: &HandleLaunch, stream: StreamId) -> Result<()> {
        if self.take_failure(FailurePoint::Launch) {
            return LaunchFailedSnafu { reason: "injected failure" }.fail();
        }
        let mut state = self.state.lock();
        state.check_stream(stream)?;
        state.check_binary(launch.bin)?;
        let args = state.snapshot(launch.args)?;
        tracing::debug!(bin = %launch.bin, tiling_key = launch.tiling_key, args = args.len(), "sim launch");
        state.push_launch(stream, LaunchRecord::Handle { launch: launch.clone(), args });
        Ok(())
    }

    fn launch_aicpu(&self, launch: &AiCpuLaunch, stream: StreamId) -> Result<()> {
        if self.take_failure(FailurePoint::Launch) {
            return LaunchFailedSnafu { reason: "injected failure" }.fail();
        }
        let mut state = self.state.lock();
        state.check_stream(stream)?;
        if let Some(bin) = launch.custom {
            state.check_binary(bin)?;
        }
        let args = state.snapshot(launch.args)?;
        tracing::debug!(kernel = %launch.kernel_name, so = %launch.so_name, args = args.len(), "sim aicpu launch");
        state.push_launch(stream, LaunchRecord::AiCpu { launch: launch.clone(), args });
        Ok(())
    }

    fn launch_ffts_plus(&self, launch: &FftsPlusLaunch, stream: StreamId) -> Result<()> {
        if self.take_failure(FailurePoint::Launch) {
            return LaunchFailedSnafu { reason: "injected failure" }.fail();
        }
        let mut state = self.state.lock();
        state.check_stream(stream)?;

        let mut snapshots = Vec::with_capacity(launch.contexts.len());
        for context in &launch.contexts {
            match context {
                FftsContext::AiCore { entry, args, .. } => {
                    match entry {
                        ContextEntry::Function(func) => state.check_function(*func)?,
                        ContextEntry::Handle { bin, .. } => state.check_binary(*bin)?,
                    }
                    snapshots.push(state.snapshot(*args)?);
                }
                FftsContext::AiCpu { args, .. } => snapshots.push(state.snapshot(*args)?),
                FftsContext::DataMovement { src, dst, len } => {
                    let bytes = state.read(*src, *len)?;
                    state.write(*dst, &bytes)?;
                }
            }
        }

        tracing::debug!(contexts = launch.contexts.len(), "sim ffts+ launch");
        state.push_launch(stream, LaunchRecord::FftsPlus { launch: launch.clone(), args: snapshots });
        Ok(())
    }
}
