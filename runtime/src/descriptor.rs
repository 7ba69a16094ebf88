//! Operator descriptors.
//!
//! An [`OperatorDescriptor`] is the finished description of one compute node
//! as produced by the graph loader. The runtime only reads it; it is shared
//! behind an `Arc` by every task built from it.

use bon::bon;
use smallvec::SmallVec;
use tessel_dtype::ScalarDType;

use crate::args_format::Direction;

pub type Shape = SmallVec<[i64; 4]>;

// ============================================================================
// TENSORS
// ============================================================================

/// Static description of one concrete tensor instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    pub dtype: ScalarDType,
    pub shape: Shape,
    /// Small scalar passed by value from host memory instead of by device
    /// address.
    pub host_resident: bool,
}

impl TensorDesc {
    pub fn new(dtype: ScalarDType, shape: impl IntoIterator<Item = i64>) -> Self {
        Self { dtype, shape: shape.into_iter().collect(), host_resident: false }
    }

    /// Host-resident scalar input.
    pub fn host(dtype: ScalarDType, shape: impl IntoIterator<Item = i64>) -> Self {
        Self { host_resident: true, ..Self::new(dtype, shape) }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements; a rank-0 tensor holds one. `None` for unknown
    /// (negative) dims or overflow.
    pub fn element_count(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(usize::try_from(dim).ok()?))
    }

    pub fn byte_size(&self) -> Option<usize> {
        self.dtype.storage_bytes(self.element_count()?)
    }
}

/// How many concrete instances an IR position may bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum IrKind {
    /// Exactly one instance.
    Required,
    /// Zero or one instance.
    Optional,
    /// Any number of instances.
    Dynamic,
}

/// One IR input or output position with its bound instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrTensor {
    pub kind: IrKind,
    pub instances: Vec<TensorDesc>,
}

impl IrTensor {
    pub fn required(desc: TensorDesc) -> Self {
        Self { kind: IrKind::Required, instances: vec![desc] }
    }

    pub fn optional(desc: Option<TensorDesc>) -> Self {
        Self { kind: IrKind::Optional, instances: desc.into_iter().collect() }
    }

    pub fn dynamic(instances: impl IntoIterator<Item = TensorDesc>) -> Self {
        Self { kind: IrKind::Dynamic, instances: instances.into_iter().collect() }
    }

    pub fn count(&self) -> usize {
        self.instances.len()
    }
}

// ============================================================================
// KERNELS
// ============================================================================

/// AI-CPU kernel entry and its opaque definition blobs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AiCpuKernel {
    pub so_name: String,
    pub kernel_name: String,
    /// Serialized kernel definition, copied verbatim after the arguments.
    pub kernel_def: Vec<u8>,
    /// Extended info blob; its device address goes into the parameter head.
    pub ext_info: Vec<u8>,
}

/// Compute-engine category of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum KernelCategory {
    AiCore,
    AiCpu,
    CustomAiCpu,
    Customized,
}

/// Kernel an operator runs, one variant per compute-engine category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelVariant {
    /// AI-core kernel. Tiled operators launch by binary handle and tiling
    /// key; static operators launch the `stub` entry point.
    AiCore { binary_key: String, stub: String },
    /// Built-in AI-CPU kernel shipped with the runtime.
    AiCpu(AiCpuKernel),
    /// User AI-CPU kernel loaded from a registered binary.
    CustomAiCpu { binary_key: String, kernel: AiCpuKernel },
    /// Hand-written kernel with its own leading argument bytes.
    Customized { binary_key: String, stub: String, leading: Vec<u8> },
}

impl KernelVariant {
    pub fn category(&self) -> KernelCategory {
        match self {
            Self::AiCore { .. } => KernelCategory::AiCore,
            Self::AiCpu(_) => KernelCategory::AiCpu,
            Self::CustomAiCpu { .. } => KernelCategory::CustomAiCpu,
            Self::Customized { .. } => KernelCategory::Customized,
        }
    }

    /// Whether arguments may switch to folded addressing.
    pub fn can_fold(&self) -> bool {
        matches!(self, Self::AiCore { .. })
    }

    pub fn binary_key(&self) -> Option<&str> {
        match self {
            Self::AiCore { binary_key, .. }
            | Self::CustomAiCpu { binary_key, .. }
            | Self::Customized { binary_key, .. } => Some(binary_key),
            Self::AiCpu(_) => None,
        }
    }
}

/// Kernel that zero-fills outputs and workspaces ahead of an atomic-add
/// operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicClearKernel {
    pub binary_key: String,
    pub stub: String,
    pub block_dim: u32,
}

// ============================================================================
// ATTRIBUTES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpAttrs {
    /// Static kernels: whether outputs need zero-fill before launch. Tiled
    /// kernels take this from the tiling result instead.
    pub needs_atomic_clear: bool,
    /// Output instances zero-filled by the atomic-clear kernel.
    pub atomic_outputs: Vec<usize>,
    /// Per workspace index, whether it is zero-filled.
    pub atomic_workspaces: Vec<bool>,
    pub atomic_kernel: Option<AtomicClearKernel>,
    /// Local memory bytes for static kernels.
    pub local_memory_size: u32,
    /// Declared upper bound of the tiling payload; zero for static kernels.
    pub max_tiling_size: usize,
    /// Shapes are only known at launch, so tiling reruns before every launch.
    pub soft_sync: bool,
    pub overflow_check: bool,
    /// Reserve the exception-size region for dump tooling.
    pub exception_dump: bool,
    /// Block dim for static kernels.
    pub block_dim: u32,
    pub schedule_mode: u32,
}

// ============================================================================
// OPERATOR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorDescriptor {
    pub name: String,
    pub op_type: String,
    pub kernel: KernelVariant,
    pub inputs: Vec<IrTensor>,
    pub outputs: Vec<IrTensor>,
    /// Declared workspace byte sizes.
    pub workspaces: Vec<usize>,
    /// Argument format text; `None` selects the default layout.
    pub args_format: Option<String>,
    pub attrs: OpAttrs,
}

#[bon]
impl OperatorDescriptor {
    #[builder]
    pub fn new(
        #[builder(into)] name: String,
        #[builder(into)] op_type: String,
        kernel: KernelVariant,
        #[builder(default)] inputs: Vec<IrTensor>,
        #[builder(default)] outputs: Vec<IrTensor>,
        #[builder(default)] workspaces: Vec<usize>,
        #[builder(into)] args_format: Option<String>,
        #[builder(default)] attrs: OpAttrs,
    ) -> Self {
        Self { name, op_type, kernel, inputs, outputs, workspaces, args_format, attrs }
    }

    /// Tiled operators obtain block dim, tiling key and tiling data from the
    /// tiling service.
    pub fn has_tiling(&self) -> bool {
        self.attrs.max_tiling_size > 0
    }

    pub fn ir(&self, direction: Direction) -> &[IrTensor] {
        match direction {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        }
    }

    /// Concrete instances of one direction, flattened in IR order.
    pub fn instances(&self, direction: Direction) -> impl Iterator<Item = &TensorDesc> {
        self.ir(direction).iter().flat_map(|ir| ir.instances.iter())
    }

    pub fn instance_count(&self, direction: Direction) -> usize {
        self.ir(direction).iter().map(IrTensor::count).sum()
    }
}
