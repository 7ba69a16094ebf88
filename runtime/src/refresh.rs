//! Refresh registry.
//!
//! Recorded while the buffer is assembled: which byte offsets hold which
//! logical addresses. A replay patches only these words instead of rerunning
//! format compilation, resolution and layout.
//!
//! Refresh validates every patch before writing any, so a rejected refresh
//! leaves the buffer untouched.

use snafu::{OptionExt, ensure};
use tessel_device::DevicePtr;

use crate::addresses::{LogicalAddress, TaskAddresses, TensorBinding};
use crate::args_format::{Direction, TilingScalar};
use crate::buffer::{ArgumentBuffer, Region};
use crate::error::*;
use crate::tiling::TilingBlob;

/// Argument word holding a tensor or workspace address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshEntry {
    pub offset: usize,
    pub addr: LogicalAddress,
    /// Non-relocatable words keep their build-time value.
    pub relocatable: bool,
    /// Optional instances and workspaces accept a null pointer.
    pub nullable: bool,
}

/// Host-resident input bytes copied inline on every refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInputEntry {
    pub region: Region,
    pub input: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilingScalarEntry {
    pub offset: usize,
    pub scalar: TilingScalar,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshRegistry {
    tensors: Vec<RefreshEntry>,
    host_inputs: Vec<HostInputEntry>,
    tiling_scalars: Vec<TilingScalarEntry>,
    tiling_region: Option<Region>,
    /// Device address of the exception region, stored in the tiling padding.
    exception_addr: DevicePtr,
}

impl RefreshRegistry {
    pub fn record_tensor(&mut self, entry: RefreshEntry) {
        self.tensors.push(entry);
    }

    pub fn record_host_input(&mut self, entry: HostInputEntry) {
        self.host_inputs.push(entry);
    }

    pub fn record_tiling_scalar(&mut self, entry: TilingScalarEntry) {
        self.tiling_scalars.push(entry);
    }

    pub fn record_tiling_region(&mut self, region: Region, exception_addr: DevicePtr) {
        self.tiling_region = Some(region);
        self.exception_addr = exception_addr;
    }

    pub fn tensors(&self) -> &[RefreshEntry] {
        &self.tensors
    }

    pub fn host_inputs(&self) -> &[HostInputEntry] {
        &self.host_inputs
    }

    pub fn tiling_scalars(&self) -> &[TilingScalarEntry] {
        &self.tiling_scalars
    }

    pub fn tiling_region(&self) -> Option<Region> {
        self.tiling_region
    }

    /// Patch every relocatable address word and re-copy host scalars from
    /// `addresses`. Returns the number of words and host entries written.
    pub fn refresh(&self, buffer: &mut ArgumentBuffer, addresses: &TaskAddresses) -> Result<usize> {
        let mut words = Vec::with_capacity(self.tensors.len());
        for entry in self.tensors.iter().filter(|entry| entry.relocatable) {
            let ptr = match entry.addr {
                LogicalAddress::Workspace(index) => {
                    addresses.workspaces.get(index).copied().context(ResolveIndexOutOfRangeSnafu {
                        what: "workspace",
                        index,
                        len: addresses.workspaces.len(),
                    })?
                }
                LogicalAddress::Input(index) => device_ptr(addresses, Direction::Input, index, entry.nullable)?,
                LogicalAddress::Output(index) => device_ptr(addresses, Direction::Output, index, entry.nullable)?,
            };
            words.push((entry.offset, ptr));
        }

        let mut host = Vec::with_capacity(self.host_inputs.len());
        for entry in &self.host_inputs {
            let Some(TensorBinding::Host(bytes)) = addresses.inputs.get(entry.input) else {
                return ResolveHostInputSnafu { index: entry.input, reason: "not bound to host bytes" }.fail();
            };
            ensure!(
                bytes.len() <= entry.region.len,
                ResolveHostInputSnafu {
                    index: entry.input,
                    reason: format!("{} bytes exceed the {} reserved at build", bytes.len(), entry.region.len),
                }
            );
            host.push((entry.region, bytes.as_slice()));
        }

        for &(offset, ptr) in &words {
            tracing::trace!(offset, %ptr, "address refreshed");
            buffer.write_u64(offset, ptr.addr())?;
        }
        for &(region, bytes) in &host {
            buffer.write_padded(region.offset, bytes, region.len)?;
        }

        Ok(words.len() + host.len())
    }

    /// Rewrite the tiling region and tiling-scalar words from a new tiling
    /// result. The region layout is fixed at build time.
    pub fn refresh_tiling(&self, buffer: &mut ArgumentBuffer, blob: &TilingBlob) -> Result<()> {
        if let Some(region) = self.tiling_region {
            let bytes = blob.region_bytes(self.exception_addr)?;
            ensure!(
                bytes.len() == region.len,
                CapacityExceededSnafu { what: "tiling region", size: bytes.len(), limit: region.len }
            );
            buffer.write_bytes(region.offset, &bytes)?;
        }
        for entry in &self.tiling_scalars {
            buffer.write_u64(entry.offset, blob.scalar(entry.scalar))?;
        }
        Ok(())
    }
}

fn device_ptr(addresses: &TaskAddresses, direction: Direction, index: usize, nullable: bool) -> Result<DevicePtr> {
    match addresses.tensors(direction).get(index) {
        Some(TensorBinding::Device { ptr, .. }) => {
            ensure!(nullable || !ptr.is_null(), ResolveNullTensorSnafu { direction, index });
            Ok(*ptr)
        }
        Some(TensorBinding::Host(_)) => {
            ResolveHostInputSnafu { index, reason: "address slot rebound to host bytes" }.fail()
        }
        None => ResolveMissingTensorSnafu { direction, index }.fail(),
    }
}
