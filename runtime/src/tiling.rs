//! Tiling injection.
//!
//! Bridges the external tiling service into the argument layout. The tiling
//! payload is copied into the tiling-data region of the argument buffer and
//! reaches the device together with the rest of the arguments, on the launch
//! stream and ahead of the launch.
//!
//! The region size depends only on the operator's declared maximum tiling
//! size and the enabled diagnostics, never on the live payload length:
//!
//! ```text
//! [payload, zero padded to align8(max_tiling_size)][live length?][exception region addr?]
//! ```

use smallvec::SmallVec;
use snafu::{OptionExt, ResultExt, ensure};
use tessel_device::DevicePtr;

use crate::args_format::TilingScalar;
use crate::buffer::align8;
use crate::config::PlatformInfo;
use crate::descriptor::OperatorDescriptor;
use crate::error::*;

/// Result of one tiling service invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TilingResult {
    pub block_dim: u32,
    pub tiling_key: u64,
    pub needs_atomic_clear: bool,
    pub schedule_mode: u32,
    pub local_memory_size: u32,
    pub workspace_sizes: Vec<usize>,
    pub data: Vec<u8>,
}

/// External operator tiling service.
pub trait TilingService: Send + Sync {
    fn tiling(&self, op: &OperatorDescriptor, platform: &PlatformInfo) -> Result<TilingResult, ServiceError>;
}

/// Shape of the tiling-data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TilingLayout {
    /// Payload capacity, `align8(max_tiling_size)`.
    pub capacity: usize,
    /// Trailing word with the live payload length.
    pub mem_check: bool,
    /// Trailing word with the device address of the exception region.
    pub exception_dump: bool,
}

impl TilingLayout {
    pub fn for_op(op: &OperatorDescriptor, mem_check: bool) -> Result<Self> {
        let capacity = align8(op.attrs.max_tiling_size).context(CapacityOverflowSnafu { what: "tiling capacity" })?;
        Ok(Self { capacity, mem_check, exception_dump: op.attrs.exception_dump })
    }

    pub fn region_size(&self) -> Result<usize> {
        let extras = 8 * (usize::from(self.mem_check) + usize::from(self.exception_dump));
        self.capacity.checked_add(extras).context(CapacityOverflowSnafu { what: "tiling region" })
    }

    pub fn length_offset(&self) -> Option<usize> {
        self.mem_check.then_some(self.capacity)
    }

    pub fn exception_addr_offset(&self) -> Option<usize> {
        self.exception_dump.then(|| self.capacity + 8 * usize::from(self.mem_check))
    }
}

/// Tiling result of one invocation, bounded by the operator's declared
/// maximum and paired with its region layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilingBlob {
    pub block_dim: u32,
    pub tiling_key: u64,
    pub needs_atomic_clear: bool,
    pub schedule_mode: u32,
    pub local_memory_size: u32,
    pub workspace_sizes: SmallVec<[usize; 4]>,
    pub data: Vec<u8>,
    pub layout: TilingLayout,
}

impl TilingBlob {
    pub fn from_result(op: &OperatorDescriptor, result: TilingResult, mem_check: bool) -> Result<Self> {
        let layout = TilingLayout::for_op(op, mem_check)?;
        ensure!(
            result.data.len() <= op.attrs.max_tiling_size,
            TilingTooLargeSnafu { op: &op.name, size: result.data.len(), max: op.attrs.max_tiling_size }
        );

        Ok(Self {
            block_dim: result.block_dim,
            tiling_key: result.tiling_key,
            needs_atomic_clear: result.needs_atomic_clear,
            schedule_mode: result.schedule_mode,
            local_memory_size: result.local_memory_size,
            workspace_sizes: result.workspace_sizes.into(),
            data: result.data,
            layout,
        })
    }

    /// Launch parameters of a static kernel, taken from its attributes.
    pub fn fixed(op: &OperatorDescriptor) -> Self {
        Self {
            block_dim: op.attrs.block_dim,
            tiling_key: 0,
            needs_atomic_clear: op.attrs.needs_atomic_clear,
            schedule_mode: op.attrs.schedule_mode,
            local_memory_size: op.attrs.local_memory_size,
            workspace_sizes: op.workspaces.iter().copied().collect(),
            data: Vec::new(),
            layout: TilingLayout { exception_dump: op.attrs.exception_dump, ..Default::default() },
        }
    }

    pub fn scalar(&self, scalar: TilingScalar) -> u64 {
        match scalar {
            TilingScalar::TilingKey => self.tiling_key,
            TilingScalar::BlockDim => u64::from(self.block_dim),
        }
    }

    /// Bytes of the tiling-data region.
    pub fn region_bytes(&self, exception_addr: DevicePtr) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; self.layout.region_size()?];
        ensure!(
            self.data.len() <= self.layout.capacity,
            CapacityExceededSnafu { what: "tiling data", size: self.data.len(), limit: self.layout.capacity }
        );
        bytes[..self.data.len()].copy_from_slice(&self.data);

        if let Some(offset) = self.layout.length_offset() {
            bytes[offset..offset + 8].copy_from_slice(&(self.data.len() as u64).to_le_bytes());
        }
        if let Some(offset) = self.layout.exception_addr_offset() {
            bytes[offset..offset + 8].copy_from_slice(&exception_addr.addr().to_le_bytes());
        }
        Ok(bytes)
    }
}

/// Calls the tiling service on behalf of task construction.
pub struct TilingInjector<'a> {
    service: &'a dyn TilingService,
    platform: &'a PlatformInfo,
    mem_check: bool,
}

impl<'a> TilingInjector<'a> {
    pub fn new(service: &'a dyn TilingService, platform: &'a PlatformInfo, mem_check: bool) -> Self {
        Self { service, platform, mem_check }
    }

    /// Tile `op`. Static operators get their fixed launch parameters without
    /// calling the service.
    #[tracing::instrument(skip_all, fields(op.name = %op.name))]
    pub fn inject(&self, op: &OperatorDescriptor) -> Result<TilingBlob> {
        if !op.has_tiling() {
            return Ok(TilingBlob::fixed(op));
        }

        let result = self.service.tiling(op, self.platform).context(TilingFailedSnafu { op: &op.name })?;
        let blob = TilingBlob::from_result(op, result, self.mem_check)?;
        tracing::debug!(
            tiling_key = blob.tiling_key,
            block_dim = blob.block_dim,
            tiling.size = blob.data.len(),
            atomic = blob.needs_atomic_clear,
            "tiling injected"
        );
        Ok(blob)
    }
}

/// Outputs and workspaces zero-filled before the main kernel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AtomicSubset {
    /// Flattened output instances.
    pub outputs: SmallVec<[usize; 4]>,
    pub workspaces: SmallVec<[usize; 4]>,
}

impl AtomicSubset {
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.workspaces.is_empty()
    }

    pub fn contains_workspace(&self, index: usize) -> bool {
        self.workspaces.contains(&index)
    }
}

/// Empty unless the blob asks for atomic clear. Otherwise the operator's
/// flagged outputs, plus its flagged workspaces that exist in the blob with a
/// non-zero size.
pub fn derive_atomic_subset(op: &OperatorDescriptor, blob: &TilingBlob) -> AtomicSubset {
    if !blob.needs_atomic_clear {
        return AtomicSubset::default();
    }

    let outputs = op.attrs.atomic_outputs.iter().copied().collect();
    let workspaces = op
        .attrs
        .atomic_workspaces
        .iter()
        .enumerate()
        .filter(|&(index, &flagged)| flagged && blob.workspace_sizes.get(index).is_some_and(|&size| size > 0))
        .map(|(index, _)| index)
        .collect();

    AtomicSubset { outputs, workspaces }
}
