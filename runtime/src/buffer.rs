//! Host arena mirroring a task's device argument memory.
//!
//! Every write is validated against the arena length, so an offset computed
//! wrongly surfaces as a capacity error instead of corrupting a neighbouring
//! region.

use snafu::{OptionExt, ensure};

use crate::error::*;

/// Width of one argument word.
pub const WORD: usize = 8;

pub fn align8(value: usize) -> Option<usize> {
    align_up(value, WORD)
}

pub fn align_up(value: usize, align: usize) -> Option<usize> {
    value.checked_next_multiple_of(align)
}

/// Checked `offset + len`.
pub fn end_of(offset: usize, len: usize, what: &'static str) -> Result<usize> {
    offset.checked_add(len).context(CapacityOverflowSnafu { what })
}

/// Byte range of one region inside an argument buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

impl Region {
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    /// One past the last byte. Layout construction checks this cannot
    /// overflow.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.len > 0 && other.len > 0 && self.offset < other.end() && other.offset < self.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArgumentBuffer {
    bytes: Vec<u8>,
}

impl ArgumentBuffer {
    /// Zero-filled arena of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self { bytes: vec![0; len] }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn range(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>> {
        let end = offset.checked_add(len);
        ensure!(
            end.is_some_and(|end| end <= self.bytes.len()),
            CapacityOutOfBoundsSnafu { offset, len, capacity: self.bytes.len() }
        );
        Ok(offset..offset + len)
    }

    pub fn write_bytes(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        let range = self.range(offset, src.len())?;
        self.bytes[range].copy_from_slice(src);
        Ok(())
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Write `src` and zero the rest of `len` bytes.
    pub fn write_padded(&mut self, offset: usize, src: &[u8], len: usize) -> Result<()> {
        let range = self.range(offset, len)?;
        ensure!(src.len() <= len, CapacityOutOfBoundsSnafu { offset, len: src.len(), capacity: len });
        let region = &mut self.bytes[range];
        region[..src.len()].copy_from_slice(src);
        region[src.len()..].fill(0);
        Ok(())
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        let range = self.range(offset, WORD)?;
        let mut word = [0u8; WORD];
        word.copy_from_slice(&self.bytes[range]);
        Ok(u64::from_le_bytes(word))
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let range = self.range(offset, len)?;
        Ok(&self.bytes[range])
    }

    pub fn region(&self, region: Region) -> Result<&[u8]> {
        self.slice(region.offset, region.len)
    }
}
