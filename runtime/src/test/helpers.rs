//! Test doubles and operator builders shared by the runtime tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tessel_device::{BinaryKind, DevicePtr, Driver, KernelBinary, SimDriver, Stream};
use tessel_dtype::ScalarDType;

use crate::addresses::{HiddenInputResolver, TaskAddresses, TensorBinding};
use crate::args_format::HiddenKind;
use crate::config::{PlatformInfo, RuntimeConfig};
use crate::context::RuntimeContext;
use crate::descriptor::{AtomicClearKernel, IrTensor, KernelVariant, OpAttrs, OperatorDescriptor, TensorDesc};
use crate::dump::{DiagnosticsSink, DumpReport};
use crate::error::ServiceError;
use crate::kernel_cache::BinaryStore;
use crate::tiling::{TilingResult, TilingService};

// ============================================================================
// DOUBLES
// ============================================================================

/// Tiling service replaying queued results, then a fallback.
pub struct ScriptedTiling {
    queue: Mutex<VecDeque<Result<TilingResult, String>>>,
    fallback: TilingResult,
    calls: AtomicUsize,
}

impl ScriptedTiling {
    pub fn new(fallback: TilingResult) -> Self {
        Self { queue: Mutex::new(VecDeque::new()), fallback, calls: AtomicUsize::new(0) }
    }

    pub fn push(&self, result: TilingResult) {
        self.queue.lock().push_back(Ok(result));
    }

    pub fn push_failure(&self, reason: &str) {
        self.queue.lock().push_back(Err(reason.to_string()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TilingService for ScriptedTiling {
    fn tiling(&self, _op: &OperatorDescriptor, _platform: &PlatformInfo) -> Result<TilingResult, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.queue.lock().pop_front() {
            Some(Ok(result)) => Ok(result),
            Some(Err(reason)) => Err(reason.into()),
            None => Ok(self.fallback.clone()),
        }
    }
}

/// Sink keeping a copy of every report.
#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<(String, Vec<u8>, usize, bool)>>,
}

impl RecordingSink {
    /// `(op name, args bytes, record length, folded)` per report.
    pub fn reports(&self) -> Vec<(String, Vec<u8>, usize, bool)> {
        self.reports.lock().clone()
    }
}

impl DiagnosticsSink for RecordingSink {
    fn publish(&self, report: &DumpReport<'_>) {
        self.reports.lock().push((report.op_name.to_string(), report.args.to_vec(), report.record.len(), report.folded));
    }
}

/// Hidden-input callback with fixed collective handles.
pub struct FixedHandles(pub Vec<u64>);

impl HiddenInputResolver for FixedHandles {
    fn resolve(&self, _op: &OperatorDescriptor, kind: HiddenKind) -> Result<Vec<u64>, ServiceError> {
        match kind {
            HiddenKind::Hcom => Ok(self.0.clone()),
            HiddenKind::Tilefwk => Err("no tile framework".into()),
        }
    }
}

// ============================================================================
// RUNTIME
// ============================================================================

pub const ADD_KEY: &str = "add_custom";
pub const CLEAR_KEY: &str = "atomic_clean";
pub const CPU_KEY: &str = "cust_aicpu";

pub struct Harness {
    pub sim: Arc<SimDriver>,
    pub tiling: Arc<ScriptedTiling>,
    pub sink: Arc<RecordingSink>,
    pub ctx: Arc<RuntimeContext>,
}

impl Harness {
    pub fn new(tiling: TilingResult) -> Self {
        Self::with_config(tiling, RuntimeConfig::default())
    }

    pub fn with_config(tiling: TilingResult, config: RuntimeConfig) -> Self {
        let sim = Arc::new(SimDriver::new());
        let tiling = Arc::new(ScriptedTiling::new(tiling));
        let sink = Arc::new(RecordingSink::default());

        let binaries = BinaryStore::new();
        for (key, kind) in [(ADD_KEY, BinaryKind::AiCore), (CLEAR_KEY, BinaryKind::AiCore), (CPU_KEY, BinaryKind::AiCpu)] {
            binaries.insert(KernelBinary::new(key, kind, vec![0x7f, b'E', b'L', b'F']));
        }

        let driver: Arc<dyn Driver> = sim.clone();
        let ctx = RuntimeContext::builder()
            .driver(driver)
            .binaries(Arc::new(binaries))
            .tiling(tiling.clone())
            .config(config)
            .hidden(Arc::new(FixedHandles(vec![0xc0de_0001, 0xc0de_0002])))
            .diagnostics(sink.clone())
            .build();

        Self { sim, tiling, sink, ctx: Arc::new(ctx) }
    }

    pub fn stream(&self) -> Stream {
        Stream::new(&self.ctx.driver).unwrap()
    }

    /// `count` distinct device allocations of `size` bytes.
    pub fn alloc(&self, count: usize, size: usize) -> Vec<DevicePtr> {
        (0..count).map(|_| self.sim.malloc(size, tessel_device::MemoryKind::Device).unwrap()).collect()
    }
}

// ============================================================================
// OPERATORS
// ============================================================================

pub fn f32_tensor(dims: &[i64]) -> TensorDesc {
    TensorDesc::new(ScalarDType::Float32, dims.iter().copied())
}

pub fn ai_core() -> KernelVariant {
    KernelVariant::AiCore { binary_key: ADD_KEY.into(), stub: "add_custom_0".into() }
}

/// Two required inputs, one empty optional input, one output, two
/// workspaces, 64 bytes of tiling and atomic clear of output 0 and
/// workspace 0.
pub fn atomic_op() -> OperatorDescriptor {
    OperatorDescriptor::builder()
        .name("matmul_atomic")
        .op_type("MatMulV2")
        .kernel(ai_core())
        .inputs(vec![
            IrTensor::required(f32_tensor(&[16, 16])),
            IrTensor::required(f32_tensor(&[16, 16])),
            IrTensor::optional(None),
        ])
        .outputs(vec![IrTensor::required(f32_tensor(&[16, 16]))])
        .workspaces(vec![256, 1024])
        .attrs(OpAttrs {
            atomic_outputs: vec![0],
            atomic_workspaces: vec![true, false],
            atomic_kernel: Some(AtomicClearKernel {
                binary_key: CLEAR_KEY.into(),
                stub: "atomic_clean_0".into(),
                block_dim: 1,
            }),
            max_tiling_size: 64,
            ..Default::default()
        })
        .build()
}

pub fn atomic_tiling() -> TilingResult {
    TilingResult {
        block_dim: 8,
        tiling_key: 1001,
        needs_atomic_clear: true,
        workspace_sizes: vec![256, 1024],
        data: (0..64).collect(),
        ..Default::default()
    }
}

pub fn atomic_addresses(h: &Harness) -> TaskAddresses {
    let tensors = h.alloc(3, 1024);
    TaskAddresses::builder()
        .inputs(vec![TensorBinding::device(tensors[0]), TensorBinding::device(tensors[1])])
        .outputs(vec![TensorBinding::device(tensors[2])])
        .workspaces(h.alloc(2, 1024))
        .build()
}

/// Tiled AI-core operator with `inputs` required inputs and one output,
/// using the default argument format.
pub fn wide_op(inputs: usize) -> OperatorDescriptor {
    OperatorDescriptor::builder()
        .name(format!("add_n_{inputs}"))
        .op_type("AddN")
        .kernel(ai_core())
        .inputs(vec![IrTensor::dynamic((0..inputs).map(|_| f32_tensor(&[4])))])
        .outputs(vec![IrTensor::required(f32_tensor(&[4]))])
        .attrs(OpAttrs { max_tiling_size: 16, ..Default::default() })
        .build()
}

pub fn plain_tiling() -> TilingResult {
    TilingResult { block_dim: 4, tiling_key: 7, data: vec![1; 16], ..Default::default() }
}

/// Flattened device bindings at `base`, `base + 0x100`, ...
pub fn device_bindings(base: u64, count: usize) -> Vec<TensorBinding> {
    (0..count as u64).map(|i| TensorBinding::device(base + i * 0x100)).collect()
}
