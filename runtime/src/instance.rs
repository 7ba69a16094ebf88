//! Mapping from IR positions to concrete tensor instances.

use smallvec::SmallVec;

use crate::descriptor::IrTensor;

/// Concrete instances bound to one IR position: `start..start + count` in the
/// flattened instance list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstanceRange {
    pub start: usize,
    pub count: usize,
}

impl InstanceRange {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn end(&self) -> usize {
        self.start + self.count
    }

    pub fn iter(&self) -> std::ops::Range<usize> {
        self.start..self.end()
    }
}

/// Instance ranges of every IR position of one direction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstanceMap {
    ranges: SmallVec<[InstanceRange; 8]>,
}

impl InstanceMap {
    pub fn from_counts(counts: impl IntoIterator<Item = usize>) -> Self {
        let mut start = 0;
        let ranges = counts
            .into_iter()
            .map(|count| {
                let range = InstanceRange { start, count };
                start += count;
                range
            })
            .collect();
        Self { ranges }
    }

    pub fn from_ir(ir: &[IrTensor]) -> Self {
        Self::from_counts(ir.iter().map(IrTensor::count))
    }

    /// Number of IR positions.
    pub fn arity(&self) -> usize {
        self.ranges.len()
    }

    /// Total number of concrete instances.
    pub fn total(&self) -> usize {
        self.ranges.last().map(InstanceRange::end).unwrap_or(0)
    }

    pub fn range(&self, ir: usize) -> Option<InstanceRange> {
        self.ranges.get(ir).copied()
    }

    pub fn ranges(&self) -> &[InstanceRange] {
        &self.ranges
    }

    /// IR position owning flattened instance `instance`.
    pub fn owner(&self, instance: usize) -> Option<usize> {
        self.ranges.iter().position(|range| range.iter().contains(&instance))
    }
}
