//! Diagnostics records mirroring an assembled argument buffer.
//!
//! The record holds one entry per emitted argument word, in format order, so
//! exception and memory-check tooling can interpret the buffer without knowing
//! the format. Whether anything is persisted is up to the [`DiagnosticsSink`].

use tessel_device::DevicePtr;

use crate::addresses::LogicalAddress;

/// Tag in the top byte of an exception-region size word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub enum DumpTag {
    /// Input, output or workspace tensor.
    Normal = 0,
    /// Literal word.
    Custom = 1,
    /// Shape block.
    WithShape = 2,
    TilingData = 3,
}

/// Size word marking an entry tooling cannot interpret.
pub const UNSUPPORTED_SIZE: u64 = u64::MAX;

const TAG_SHIFT: u32 = 56;
const SIZE_MASK: u64 = (1 << TAG_SHIFT) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpEntry {
    Input(usize),
    Output(usize),
    Workspace(usize),
    Sized { tag: DumpTag, size: usize },
    Unsupported,
}

impl From<LogicalAddress> for DumpEntry {
    fn from(addr: LogicalAddress) -> Self {
        match addr {
            LogicalAddress::Input(index) => Self::Input(index),
            LogicalAddress::Output(index) => Self::Output(index),
            LogicalAddress::Workspace(index) => Self::Workspace(index),
        }
    }
}

/// Byte sizes of the logical locations a record refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TensorSizes {
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    pub workspaces: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpRecord {
    entries: Vec<DumpEntry>,
}

impl DumpRecord {
    pub fn push(&mut self, entry: DumpEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[DumpEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Words of the exception-size region:
    /// `[entry count][layout flag]` then `(tag << 56) | size` per entry.
    pub fn exception_words(&self, sizes: &TensorSizes, folded: bool) -> Vec<u64> {
        let tagged = |tag: DumpTag, size: usize| ((tag as u64) << TAG_SHIFT) | (size as u64 & SIZE_MASK);
        let normal = |list: &[usize], index: usize| {
            list.get(index).map(|&size| tagged(DumpTag::Normal, size)).unwrap_or(UNSUPPORTED_SIZE)
        };

        let mut words = Vec::with_capacity(self.entries.len() + 2);
        words.push(self.entries.len() as u64);
        words.push(u64::from(folded));
        words.extend(self.entries.iter().map(|entry| match *entry {
            DumpEntry::Input(index) => normal(&sizes.inputs, index),
            DumpEntry::Output(index) => normal(&sizes.outputs, index),
            DumpEntry::Workspace(index) => normal(&sizes.workspaces, index),
            DumpEntry::Sized { tag, size } => tagged(tag, size),
            DumpEntry::Unsupported => UNSUPPORTED_SIZE,
        }));
        words
    }

    /// Byte length of the exception-size region for `entries` entries.
    pub fn exception_region_size(entries: usize) -> Option<usize> {
        entries.checked_add(2)?.checked_mul(8)
    }
}

/// Decode one exception-region size word.
pub fn decode_size_word(word: u64) -> Option<(DumpTag, usize)> {
    if word == UNSUPPORTED_SIZE {
        return None;
    }
    let tag = DumpTag::from_repr((word >> TAG_SHIFT) as u8)?;
    Some((tag, (word & SIZE_MASK) as usize))
}

/// Snapshot handed to diagnostics after every build or refresh.
#[derive(Debug, Clone, Copy)]
pub struct DumpReport<'a> {
    pub op_name: &'a str,
    /// Host mirror of the device argument buffer.
    pub args: &'a [u8],
    pub device_addr: DevicePtr,
    pub record: &'a DumpRecord,
    pub folded: bool,
}

/// Receiver of dump reports; decides on its own whether to persist them.
pub trait DiagnosticsSink: Send + Sync {
    fn publish(&self, report: &DumpReport<'_>);
}

/// Sink that drops every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticsSink for NullSink {
    fn publish(&self, _report: &DumpReport<'_>) {}
}
