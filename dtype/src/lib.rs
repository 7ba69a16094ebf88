//! Element types of tensors handed to accelerator kernels.
//!
//! The dispatch engine never interprets tensor contents. It only needs the
//! storage width of an element to size host-resident scalar inputs and the
//! per-tensor byte counts reported to diagnostics tooling.

pub mod ext;


pub use ext::HasDType;

/// Scalar element types understood by the accelerator.
///
/// Discriminants match the numbering used by the kernel binaries, so they are
/// stable and may be written into argument buffers verbatim.
#[derive(Debug, Hash, PartialOrd, Ord)]
#[derive(strum::EnumCount, strum::EnumIter, strum::VariantArray, strum::FromRepr, strum::Display)]
#[derive(enumset::EnumSetType)]
#[cfg_attr(feature = "proptest", derive(proptest_derive::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[enumset(repr = "u32")]
#[repr(u32)]
pub enum ScalarDType {
    Float32 = 0,
    Float16 = 1,
    Int8 = 2,
    Int32 = 3,
    UInt8 = 4,
    Int16 = 6,
    UInt16 = 7,
    UInt32 = 8,
    Int64 = 9,
    UInt64 = 10,
    Float64 = 11,
    Bool = 12,
    Complex64 = 16,
    BFloat16 = 27,

    /// Packed 4-bit integers, two per byte.
    Int4 = 29,
}

impl ScalarDType {
    /// Storage width in bits of a single element.
    pub const fn bits(&self) -> usize {
        match self {
            Self::Int4 => 4,
            Self::Bool | Self::Int8 | Self::UInt8 => 8,
            Self::Float16 | Self::BFloat16 | Self::Int16 | Self::UInt16 => 16,
            Self::Float32 | Self::Int32 | Self::UInt32 => 32,
            Self::Float64 | Self::Int64 | Self::UInt64 | Self::Complex64 => 64,
        }
    }

    /// Storage width in bytes, rounded up for sub-byte types.
    pub const fn bytes(&self) -> usize {
        self.bits().div_ceil(8)
    }

    /// Bytes needed to store `elements` densely packed elements.
    ///
    /// Returns `None` on arithmetic overflow.
    pub const fn storage_bytes(&self, elements: usize) -> Option<usize> {
        match elements.checked_mul(self.bits()) {
            Some(bits) => Some(bits.div_ceil(8)),
            None => None,
        }
    }
}
