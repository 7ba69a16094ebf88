//! Argument-buffer assembler.
//!
//! Lays resolved slots out into one contiguous buffer. Two addressing
//! conventions exist:
//!
//! ```text
//! unfolded: [leading][word 0 .. word N-1][side blocks][trailing regions]
//! folded:   [leading][table ptr][tiling ptr?][overflow ptr?][table][side blocks][trailing regions]
//! ```
//!
//! Folded addressing moves every word except the tiling and overflow
//! pointers into an out-of-line table, so kernels with very large I/O counts
//! keep a small fixed argument header. Trailing regions appear in a fixed
//! order, each only when used: tiling data, exception sizes, host scalars,
//! then the AI-CPU kernel definition and ext info.
//!
//! Layout is planned first ([`Assembler::plan`]) so the device allocation can
//! be sized; the buffer is then written against the allocation's base
//! address ([`Assembler::fill`]). The refresh registry and dump record come
//! out of the same pass.

use snafu::{OptionExt, ensure};
use tessel_device::DevicePtr;

use crate::buffer::{ArgumentBuffer, Region, WORD, align8, end_of};
use crate::config::RuntimeConfig;
use crate::descriptor::{KernelVariant, OperatorDescriptor};
use crate::dump::{DumpEntry, DumpRecord, DumpTag, TensorSizes};
use crate::error::*;
use crate::refresh::{HostInputEntry, RefreshEntry, RefreshRegistry, TilingScalarEntry};
use crate::resolver::{ResolvedSlot, SlotValue};
use crate::tiling::TilingBlob;

/// Size of the packed AI-CPU parameter head:
/// `u32 length, u32 io_addr_num, u32 ext_info_len, u64 ext_info_addr`.
pub const AICPU_HEAD_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Addressing {
    Unfolded,
    Folded,
}

/// Byte layout of one argument buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentLayout {
    pub addressing: Addressing,
    pub leading: Region,
    /// Fixed words directly after the leading region.
    pub header: Region,
    /// Out-of-line table of folded layouts.
    pub table: Option<Region>,
    /// Offset of every emitted word, in emission order.
    pub word_offsets: Vec<usize>,
    /// Shape blocks in slot order.
    pub side_blocks: Vec<Region>,
    pub tiling: Option<Region>,
    pub exception: Option<Region>,
    /// Host-scalar entries in slot order.
    pub host_inputs: Vec<Region>,
    pub kernel_def: Option<Region>,
    pub ext_info: Option<Region>,
    pub total: usize,
}

impl ArgumentLayout {
    pub fn is_folded(&self) -> bool {
        self.addressing == Addressing::Folded
    }

    /// Every occupied byte range: leading region, header words, table words
    /// and each trailing region.
    pub fn regions(&self) -> Vec<Region> {
        let mut regions = vec![self.leading];
        if self.table.is_some() {
            regions.push(Region::new(self.header.offset, WORD));
        }
        regions.extend(self.word_offsets.iter().map(|&offset| Region::new(offset, WORD)));
        regions.extend(self.side_blocks.iter().copied());
        regions.extend(self.tiling);
        regions.extend(self.exception);
        regions.extend(self.host_inputs.iter().copied());
        regions.extend(self.kernel_def);
        regions.extend(self.ext_info);
        regions.retain(|region| region.len > 0);
        regions
    }
}

/// Buffer contents together with the bookkeeping recorded while writing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub layout: ArgumentLayout,
    pub buffer: ArgumentBuffer,
    pub refresh: RefreshRegistry,
    pub dump: DumpRecord,
}

/// Cursor handing out consecutive regions with checked arithmetic.
struct Cursor {
    offset: usize,
}

impl Cursor {
    fn take(&mut self, len: usize, what: &'static str) -> Result<Region> {
        let region = Region::new(self.offset, len);
        self.offset = end_of(self.offset, len, what)?;
        Ok(region)
    }

    fn take_aligned(&mut self, len: usize, what: &'static str) -> Result<Region> {
        self.offset = align8(self.offset).context(CapacityOverflowSnafu { what })?;
        self.take(len, what)
    }
}

pub struct Assembler<'a> {
    config: &'a RuntimeConfig,
}

impl<'a> Assembler<'a> {
    pub fn new(config: &'a RuntimeConfig) -> Self {
        Self { config }
    }

    /// Folded iff the kernel can fold and the emitted word count exceeds the
    /// threshold.
    pub fn addressing(&self, kernel: &KernelVariant, words: usize) -> Addressing {
        if kernel.can_fold() && words > self.config.fold_slot_threshold {
            Addressing::Folded
        } else {
            Addressing::Unfolded
        }
    }

    pub fn plan(&self, op: &OperatorDescriptor, slots: &[ResolvedSlot], blob: &TilingBlob) -> Result<ArgumentLayout> {
        let words = slots.len();
        let addressing = self.addressing(&op.kernel, words);
        let mut cursor = Cursor { offset: 0 };

        let leading = match &op.kernel {
            KernelVariant::AiCpu(_) | KernelVariant::CustomAiCpu { .. } => cursor.take(AICPU_HEAD_SIZE, "leading")?,
            KernelVariant::Customized { leading, .. } => {
                let len = align8(leading.len()).context(CapacityOverflowSnafu { what: "leading" })?;
                cursor.take(len, "leading")?
            }
            KernelVariant::AiCore { .. } => cursor.take(0, "leading")?,
        };

        let mut word_offsets = Vec::with_capacity(words);
        let (header, table) = match addressing {
            Addressing::Unfolded => {
                let len = words.checked_mul(WORD).context(CapacityOverflowSnafu { what: "argument words" })?;
                let header = cursor.take(len, "argument words")?;
                word_offsets.extend((0..words).map(|index| header.offset + index * WORD));
                (header, None)
            }
            Addressing::Folded => {
                // Tiling pointer first, then overflow pointer, whatever their
                // order in the format.
                let tiling = slots.iter().any(|slot| slot.value == SlotValue::TilingPointer);
                let overflow = slots.iter().any(|slot| matches!(slot.value, SlotValue::Overflow(_)));
                let pinned = usize::from(tiling) + usize::from(overflow);
                let header = cursor.take((1 + pinned) * WORD, "folded header")?;
                let table_len =
                    (words - pinned).checked_mul(WORD).context(CapacityOverflowSnafu { what: "folded table" })?;
                let table = cursor.take_aligned(table_len, "folded table")?;

                let tiling_at = header.offset + WORD;
                let overflow_at = header.offset + WORD * (1 + usize::from(tiling));
                let mut next = table.offset;
                for slot in slots {
                    let offset = match slot.value {
                        SlotValue::TilingPointer => tiling_at,
                        SlotValue::Overflow(_) => overflow_at,
                        _ => {
                            next += WORD;
                            next - WORD
                        }
                    };
                    word_offsets.push(offset);
                }
                (header, Some(table))
            }
        };

        let mut side_blocks = Vec::new();
        for slot in slots {
            if let SlotValue::ShapeBlock(block) = &slot.value {
                let len = block.len().checked_mul(WORD).context(CapacityOverflowSnafu { what: "shape block" })?;
                side_blocks.push(cursor.take_aligned(len, "shape block")?);
            }
        }

        let tiling = if slots.iter().any(|slot| slot.value == SlotValue::TilingPointer) {
            Some(cursor.take_aligned(blob.layout.region_size()?, "tiling region")?)
        } else {
            None
        };

        let exception = if op.attrs.exception_dump {
            let len = DumpRecord::exception_region_size(words).context(CapacityOverflowSnafu { what: "exception" })?;
            Some(cursor.take_aligned(len, "exception region")?)
        } else {
            None
        };

        let mut host_inputs: Vec<Region> = Vec::new();
        let mut host_total = 0usize;
        for slot in slots {
            if let SlotValue::HostInput { bytes, .. } = &slot.value {
                let len = align8(bytes.len()).context(CapacityOverflowSnafu { what: "host input" })?;
                host_total = end_of(host_total, len, "host input region")?;
                host_inputs.push(cursor.take_aligned(len, "host input region")?);
            }
        }
        ensure!(
            host_total <= self.config.max_host_input_bytes,
            CapacityExceededSnafu {
                what: "host input region",
                size: host_total,
                limit: self.config.max_host_input_bytes
            }
        );

        let (kernel_def, ext_info) = match &op.kernel {
            KernelVariant::AiCpu(kernel) | KernelVariant::CustomAiCpu { kernel, .. } => (
                Some(cursor.take_aligned(kernel.kernel_def.len(), "kernel def")?),
                Some(cursor.take_aligned(kernel.ext_info.len(), "ext info")?),
            ),
            _ => (None, None),
        };

        let total = align8(cursor.offset).context(CapacityOverflowSnafu { what: "argument buffer" })?;
        ensure!(
            total <= self.config.max_args_bytes,
            CapacityExceededSnafu { what: "argument buffer", size: total, limit: self.config.max_args_bytes }
        );

        tracing::debug!(op.name = %op.name, slots = words, %addressing, args.size = total, "argument layout planned");
        Ok(ArgumentLayout {
            addressing,
            leading,
            header,
            table,
            word_offsets,
            side_blocks,
            tiling,
            exception,
            host_inputs,
            kernel_def,
            ext_info,
            total,
        })
    }

    /// Write the buffer for `layout`, placed at device address `base`.
    pub fn fill(
        &self,
        op: &OperatorDescriptor,
        layout: ArgumentLayout,
        slots: &[ResolvedSlot],
        blob: &TilingBlob,
        sizes: &TensorSizes,
        base: DevicePtr,
    ) -> Result<Assembled> {
        let mut buffer = ArgumentBuffer::new(layout.total);
        let mut refresh = RefreshRegistry::default();
        let mut dump = DumpRecord::default();
        let at = |region: Region| -> Result<DevicePtr> {
            base.offset(region.offset).context(CapacityOverflowSnafu { what: "device address" })
        };

        match &op.kernel {
            KernelVariant::AiCpu(kernel) | KernelVariant::CustomAiCpu { kernel, .. } => {
                let ext_info_addr = match layout.ext_info {
                    Some(region) if region.len > 0 => at(region)?,
                    _ => DevicePtr::NULL,
                };
                let narrow = |value: usize, what: &'static str| -> Result<u32> {
                    u32::try_from(value).ok().context(CapacityOverflowSnafu { what })
                };
                buffer.write_u32(0, narrow(layout.total, "aicpu length")?)?;
                buffer.write_u32(4, narrow(slots.len(), "aicpu io count")?)?;
                buffer.write_u32(8, narrow(kernel.ext_info.len(), "aicpu ext info")?)?;
                buffer.write_u64(12, ext_info_addr.addr())?;
            }
            KernelVariant::Customized { leading, .. } => buffer.write_bytes(layout.leading.offset, leading)?,
            KernelVariant::AiCore { .. } => {}
        }

        if let Some(table) = layout.table {
            buffer.write_u64(layout.header.offset, at(table)?.addr())?;
        }

        let exception_addr = match layout.exception {
            Some(region) => at(region)?,
            None => DevicePtr::NULL,
        };

        let mut side_blocks = layout.side_blocks.iter();
        let mut host_inputs = layout.host_inputs.iter();
        for (slot, &offset) in slots.iter().zip(&layout.word_offsets) {
            let (word, entry) = match &slot.value {
                SlotValue::Tensor { addr, ptr, relocatable, nullable } => {
                    refresh.record_tensor(RefreshEntry {
                        offset,
                        addr: *addr,
                        relocatable: *relocatable,
                        nullable: *nullable,
                    });
                    (ptr.addr(), DumpEntry::from(*addr))
                }
                SlotValue::HostInput { input, bytes } => {
                    let region = *host_inputs.next().context(CapacityOverflowSnafu { what: "host input region" })?;
                    buffer.write_padded(region.offset, bytes, region.len)?;
                    refresh.record_host_input(HostInputEntry { region, input: *input });
                    (at(region)?.addr(), DumpEntry::Input(*input))
                }
                SlotValue::Null => (0, DumpEntry::Unsupported),
                SlotValue::Literal(value) => (*value, DumpEntry::Sized { tag: DumpTag::Custom, size: WORD }),
                SlotValue::ShapeBlock(words) => {
                    let region = *side_blocks.next().context(CapacityOverflowSnafu { what: "shape block" })?;
                    for (index, &word) in words.iter().enumerate() {
                        buffer.write_u64(region.offset + index * WORD, word)?;
                    }
                    (at(region)?.addr(), DumpEntry::Sized { tag: DumpTag::WithShape, size: region.len })
                }
                SlotValue::TilingPointer => {
                    let region = layout.tiling.context(CapacityOverflowSnafu { what: "tiling region" })?;
                    buffer.write_bytes(region.offset, &blob.region_bytes(exception_addr)?)?;
                    refresh.record_tiling_region(region, exception_addr);
                    (at(region)?.addr(), DumpEntry::Sized { tag: DumpTag::TilingData, size: region.len })
                }
                SlotValue::TilingScalar(scalar) => {
                    refresh.record_tiling_scalar(TilingScalarEntry { offset, scalar: *scalar });
                    (blob.scalar(*scalar), DumpEntry::Sized { tag: DumpTag::Custom, size: WORD })
                }
                SlotValue::Hidden(handle) => (*handle, DumpEntry::Unsupported),
                SlotValue::Event(ptr) | SlotValue::Overflow(ptr) | SlotValue::Control(ptr) => {
                    (ptr.addr(), DumpEntry::Unsupported)
                }
            };
            buffer.write_u64(offset, word)?;
            dump.push(entry);
        }

        if let Some(region) = layout.exception {
            for (index, word) in dump.exception_words(sizes, layout.is_folded()).into_iter().enumerate() {
                buffer.write_u64(region.offset + index * WORD, word)?;
            }
        }

        if let KernelVariant::AiCpu(kernel) | KernelVariant::CustomAiCpu { kernel, .. } = &op.kernel {
            if let Some(region) = layout.kernel_def {
                buffer.write_bytes(region.offset, &kernel.kernel_def)?;
            }
            if let Some(region) = layout.ext_info {
                buffer.write_bytes(region.offset, &kernel.ext_info)?;
            }
        }

        Ok(Assembled { layout, buffer, refresh, dump })
    }
}

/// Byte sizes of the operator's tensors and the blob's workspaces, for the
/// exception region.
pub fn tensor_sizes(op: &OperatorDescriptor, blob: &TilingBlob) -> TensorSizes {
    use crate::args_format::Direction;

    let sizes = |direction| -> Vec<usize> {
        op.instances(direction).map(|desc| desc.byte_size().unwrap_or_default()).collect()
    };
    TensorSizes {
        inputs: sizes(Direction::Input),
        outputs: sizes(Direction::Output),
        workspaces: blob.workspace_sizes.to_vec(),
    }
}
