//! Concrete addresses a task is built or refreshed against.

use bon::bon;
use tessel_device::DevicePtr;
use tessel_dtype::HasDType;

use crate::args_format::{Direction, HiddenKind};
use crate::descriptor::OperatorDescriptor;
use crate::error::ServiceError;

/// Logical location a relocatable argument word refers to. Indices are
/// flattened instance indices (inputs, outputs) or workspace indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum LogicalAddress {
    #[display("input#{_0}")]
    Input(usize),
    #[display("output#{_0}")]
    Output(usize),
    #[display("workspace#{_0}")]
    Workspace(usize),
}

impl LogicalAddress {
    pub fn tensor(direction: Direction, instance: usize) -> Self {
        match direction {
            Direction::Input => Self::Input(instance),
            Direction::Output => Self::Output(instance),
        }
    }
}

/// Where one tensor instance lives for this execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorBinding {
    /// Device memory. Non-relocatable addresses (constants, pinned model
    /// weights) keep their build-time value on refresh.
    Device { ptr: DevicePtr, relocatable: bool },
    /// Host-resident scalar bytes, copied inline into the argument buffer.
    Host(Vec<u8>),
}

impl TensorBinding {
    pub fn device(ptr: impl Into<DevicePtr>) -> Self {
        Self::Device { ptr: ptr.into(), relocatable: true }
    }

    pub fn fixed(ptr: impl Into<DevicePtr>) -> Self {
        Self::Device { ptr: ptr.into(), relocatable: false }
    }

    pub fn host(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Host(bytes.into())
    }

    /// Host-resident scalar in its little-endian encoding.
    pub fn scalar<T: HasDType>(value: T) -> Self {
        Self::Host(value.to_le_vec())
    }

    pub fn null() -> Self {
        Self::device(DevicePtr::NULL)
    }
}

/// Addresses of every logical location a task can reference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskAddresses {
    pub inputs: Vec<TensorBinding>,
    pub outputs: Vec<TensorBinding>,
    pub workspaces: Vec<DevicePtr>,
    /// Device addresses of runtime events, for `{event_addrN}`.
    pub events: Vec<DevicePtr>,
    pub overflow_addr: DevicePtr,
    /// FFTS+ control address.
    pub ffts_addr: DevicePtr,
}

#[bon]
impl TaskAddresses {
    #[builder]
    pub fn new(
        #[builder(default)] inputs: Vec<TensorBinding>,
        #[builder(default)] outputs: Vec<TensorBinding>,
        #[builder(default)] workspaces: Vec<DevicePtr>,
        #[builder(default)] events: Vec<DevicePtr>,
        #[builder(default)] overflow_addr: DevicePtr,
        #[builder(default)] ffts_addr: DevicePtr,
    ) -> Self {
        Self { inputs, outputs, workspaces, events, overflow_addr, ffts_addr }
    }

    pub fn tensors(&self, direction: Direction) -> &[TensorBinding] {
        match direction {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        }
    }

    /// Device address of a logical location; host-resident inputs have none.
    pub fn device_ptr(&self, addr: LogicalAddress) -> Option<DevicePtr> {
        let binding = match addr {
            LogicalAddress::Input(index) => self.inputs.get(index)?,
            LogicalAddress::Output(index) => self.outputs.get(index)?,
            LogicalAddress::Workspace(index) => return self.workspaces.get(index).copied(),
        };
        match binding {
            TensorBinding::Device { ptr, .. } => Some(*ptr),
            TensorBinding::Host(_) => None,
        }
    }
}

/// Callback resolving engine-specific hidden handles such as collective
/// communication contexts.
pub trait HiddenInputResolver: Send + Sync {
    /// Every handle of `kind` the operator needs, in index order.
    fn resolve(&self, op: &OperatorDescriptor, kind: HiddenKind) -> Result<Vec<u64>, ServiceError>;
}

/// Resolver for deployments without hidden inputs: every kind is empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHiddenInputs;

impl HiddenInputResolver for NoHiddenInputs {
    fn resolve(&self, _op: &OperatorDescriptor, _kind: HiddenKind) -> Result<Vec<u64>, ServiceError> {
        Ok(Vec::new())
    }
}
