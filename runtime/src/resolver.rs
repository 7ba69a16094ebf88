//! Address resolution.
//!
//! Turns every format slot into the concrete values it emits, in format
//! order. Repeated slots expand to one value per instance so each can be
//! refreshed independently later.

use std::collections::HashMap;

use snafu::{OptionExt, ResultExt, ensure};
use tessel_device::DevicePtr;

use crate::addresses::{HiddenInputResolver, LogicalAddress, TaskAddresses, TensorBinding};
use crate::args_format::{CompiledFormat, Direction, HiddenKind, SlotKind, TilingScalar};
use crate::descriptor::{IrKind, OperatorDescriptor, TensorDesc};
use crate::error::*;
use crate::instance::InstanceRange;
use crate::tiling::AtomicSubset;

/// Marks a dimension-count word in a shape block.
pub const DIM_COUNT_FLAG: u64 = 1 << 63;

/// Value of one emitted argument word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotValue {
    /// Address word. `nullable` words belong to optional instances and may
    /// be bound to a null pointer.
    Tensor { addr: LogicalAddress, ptr: DevicePtr, relocatable: bool, nullable: bool },
    /// Pointer into the host-scalar region holding `bytes`.
    HostInput { input: usize, bytes: Vec<u8> },
    Null,
    Literal(u64),
    /// Pointer to a side block with these words.
    ShapeBlock(Vec<u64>),
    /// Pointer to the tiling-data region.
    TilingPointer,
    /// Scalar copied from the live tiling result.
    TilingScalar(TilingScalar),
    Hidden(u64),
    Event(DevicePtr),
    Overflow(DevicePtr),
    /// FFTS+ control address.
    Control(DevicePtr),
}

/// One emitted word and the format slot it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSlot {
    pub slot: usize,
    pub value: SlotValue,
}

/// Shape block of `instances`: a byte-length header, then per instance a
/// flagged dimension count followed by the dims. Rank-0 tensors are encoded
/// as one dimension of extent 1.
pub fn shape_block(instances: &[TensorDesc]) -> Vec<u64> {
    let mut words = vec![0];
    for desc in instances {
        if desc.shape.is_empty() {
            words.extend([1 | DIM_COUNT_FLAG, 1]);
        } else {
            words.push(desc.rank() as u64 | DIM_COUNT_FLAG);
            words.extend(desc.shape.iter().map(|&dim| dim as u64));
        }
    }
    words[0] = (words.len() * 8) as u64;
    words
}

pub struct Resolver<'a> {
    op: &'a OperatorDescriptor,
    format: &'a CompiledFormat,
    addresses: &'a TaskAddresses,
    /// Set for atomic-clear tasks: `{ws*}` only covers the flagged workspaces.
    atomic: Option<&'a AtomicSubset>,
    hidden: &'a dyn HiddenInputResolver,
}

impl<'a> Resolver<'a> {
    pub fn new(
        op: &'a OperatorDescriptor,
        format: &'a CompiledFormat,
        addresses: &'a TaskAddresses,
        hidden: &'a dyn HiddenInputResolver,
    ) -> Self {
        Self { op, format, addresses, atomic: None, hidden }
    }

    pub fn with_atomic_subset(mut self, subset: &'a AtomicSubset) -> Self {
        self.atomic = Some(subset);
        self
    }

    pub fn resolve(&self) -> Result<Vec<ResolvedSlot>> {
        for direction in [Direction::Input, Direction::Output] {
            let expected = self.format.instances(direction).total();
            let actual = self.addresses.tensors(direction).len();
            ensure!(expected == actual, ResolveInstanceRangeSnafu { direction, expected, actual });
        }

        let mut handles: HashMap<HiddenKind, Vec<u64>> = HashMap::new();
        let mut resolved = Vec::with_capacity(self.format.format.len());

        for (slot, arg) in self.format.format.slots().iter().enumerate() {
            let mut emit = |value: SlotValue| {
                tracing::trace!(slot, ?value, "slot resolved");
                resolved.push(ResolvedSlot { slot, value });
            };

            match arg.kind {
                SlotKind::Tensor { direction, ir } => {
                    let range = self.range(direction, ir)?;
                    if range.is_empty() {
                        ensure!(
                            self.op.ir(direction)[ir].kind != IrKind::Required,
                            ResolveMissingTensorSnafu { direction, index: range.start }
                        );
                        emit(SlotValue::Null);
                    } else {
                        emit(self.tensor(direction, range.start)?);
                    }
                }
                SlotKind::IrInstances { direction, ir } => {
                    for value in self.ir_instances(direction, ir)? {
                        emit(value);
                    }
                }
                SlotKind::AllTensors { direction } => {
                    for ir in 0..self.format.instances(direction).arity() {
                        for value in self.ir_instances(direction, ir)? {
                            emit(value);
                        }
                    }
                }
                SlotKind::Instance { direction, instance } => emit(self.tensor(direction, instance)?),
                SlotKind::ShapeDesc { direction, ir } => {
                    let range = self.range(direction, ir)?;
                    let instances = &self.op.ir(direction)[ir].instances;
                    ensure!(
                        instances.len() == range.count,
                        ResolveInstanceRangeSnafu { direction, expected: range.count, actual: instances.len() }
                    );
                    emit(SlotValue::ShapeBlock(shape_block(instances)));
                }
                SlotKind::AllWorkspaces => {
                    for (index, &ptr) in self.addresses.workspaces.iter().enumerate() {
                        if self.atomic.is_some_and(|subset| !subset.contains_workspace(index)) {
                            continue;
                        }
                        emit(SlotValue::Tensor { addr: LogicalAddress::Workspace(index), ptr, relocatable: true, nullable: true });
                    }
                }
                SlotKind::Workspace(index) => {
                    let workspaces = &self.addresses.workspaces;
                    let ptr = workspaces.get(index).copied().context(ResolveIndexOutOfRangeSnafu {
                        what: "workspace",
                        index,
                        len: workspaces.len(),
                    })?;
                    emit(SlotValue::Tensor { addr: LogicalAddress::Workspace(index), ptr, relocatable: true, nullable: true });
                }
                SlotKind::Tiling => {
                    ensure!(
                        self.op.has_tiling(),
                        ResolveMissingTilingSnafu { op: &self.op.name, token: "t" }
                    );
                    emit(SlotValue::TilingPointer);
                }
                SlotKind::TilingScalar(scalar) => emit(SlotValue::TilingScalar(scalar)),
                SlotKind::Overflow => emit(SlotValue::Overflow(self.addresses.overflow_addr)),
                SlotKind::FftsAddr => emit(SlotValue::Control(self.addresses.ffts_addr)),
                SlotKind::Hidden { kind, index } => {
                    if !handles.contains_key(&kind) {
                        let fetched = self
                            .hidden
                            .resolve(self.op, kind)
                            .context(ResolveHiddenInputSnafu { kind: kind.to_string() })?;
                        handles.insert(kind, fetched);
                    }
                    let list = handles.get(&kind).map(Vec::as_slice).unwrap_or_default();
                    match index {
                        Some(index) => {
                            let handle = list
                                .get(index)
                                .copied()
                                .context(ResolveMissingHandleSnafu { kind: kind.to_string(), index })?;
                            emit(SlotValue::Hidden(handle));
                        }
                        None if list.is_empty() => emit(SlotValue::Null),
                        None => list.iter().for_each(|&handle| emit(SlotValue::Hidden(handle))),
                    }
                }
                SlotKind::Event(index) => {
                    let events = &self.addresses.events;
                    let ptr = events.get(index).copied().context(ResolveIndexOutOfRangeSnafu {
                        what: "event",
                        index,
                        len: events.len(),
                    })?;
                    emit(SlotValue::Event(ptr));
                }
                SlotKind::Literal(value) => emit(SlotValue::Literal(value)),
                SlotKind::Placeholder => emit(SlotValue::Null),
            }
        }

        Ok(resolved)
    }

    fn range(&self, direction: Direction, ir: usize) -> Result<InstanceRange> {
        let instances = self.format.instances(direction);
        instances.range(ir).context(ResolveIndexOutOfRangeSnafu {
            what: match direction {
                Direction::Input => "input",
                Direction::Output => "output",
            },
            index: ir,
            len: instances.arity(),
        })
    }

    /// Every instance of one IR position; an empty position yields one null.
    fn ir_instances(&self, direction: Direction, ir: usize) -> Result<Vec<SlotValue>> {
        let range = self.range(direction, ir)?;
        if range.is_empty() {
            ensure!(
                self.op.ir(direction)[ir].kind != IrKind::Required,
                ResolveMissingTensorSnafu { direction, index: range.start }
            );
            return Ok(vec![SlotValue::Null]);
        }
        range.iter().map(|instance| self.tensor(direction, instance)).collect()
    }

    fn tensor(&self, direction: Direction, instance: usize) -> Result<SlotValue> {
        let instances = self.format.instances(direction);
        let owner = instances.owner(instance).context(ResolveMissingTensorSnafu { direction, index: instance })?;
        let binding = self
            .addresses
            .tensors(direction)
            .get(instance)
            .context(ResolveMissingTensorSnafu { direction, index: instance })?;
        let desc = self.op.instances(direction).nth(instance);
        let host_resident = desc.is_some_and(|desc| desc.host_resident);

        match binding {
            TensorBinding::Device { ptr, relocatable } => {
                ensure!(
                    !host_resident,
                    ResolveHostInputSnafu { index: instance, reason: "host-resident input bound to a device address" }
                );
                let nullable = self.op.ir(direction)[owner].kind == IrKind::Optional;
                ensure!(nullable || !ptr.is_null(), ResolveNullTensorSnafu { direction, index: instance });
                let addr = LogicalAddress::tensor(direction, instance);
                Ok(SlotValue::Tensor { addr, ptr: *ptr, relocatable: *relocatable, nullable })
            }
            TensorBinding::Host(bytes) => {
                ensure!(
                    direction == Direction::Input,
                    ResolveHostInputSnafu { index: instance, reason: "outputs cannot be host-resident" }
                );
                ensure!(
                    host_resident,
                    ResolveHostInputSnafu { index: instance, reason: "device input bound to host bytes" }
                );
                let expected = desc.and_then(TensorDesc::byte_size);
                ensure!(
                    expected.is_none_or(|expected| expected == bytes.len()),
                    ResolveHostInputSnafu {
                        index: instance,
                        reason: format!("expected {} bytes, got {}", expected.unwrap_or_default(), bytes.len()),
                    }
                );
                Ok(SlotValue::HostInput { input: instance, bytes: bytes.clone() })
            }
        }
    }
}
