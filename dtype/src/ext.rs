use super::*;

/// Host types whose bytes can be copied into a host-resident scalar slot.
pub trait HasDType: Copy {
    const DTYPE: ScalarDType;

    fn to_le_vec(self) -> Vec<u8>;
}

macro_rules! impl_dtype_ext {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(impl HasDType for $ty {
            const DTYPE: ScalarDType = $dtype;

            fn to_le_vec(self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }
        })*
    };
}

impl_dtype_ext! {
    i8 => ScalarDType::Int8, i16 => ScalarDType::Int16, i32 => ScalarDType::Int32, i64 => ScalarDType::Int64,
    u8 => ScalarDType::UInt8, u16 => ScalarDType::UInt16, u32 => ScalarDType::UInt32, u64 => ScalarDType::UInt64,
    f32 => ScalarDType::Float32, f64 => ScalarDType::Float64,
}

impl HasDType for bool {
    const DTYPE: ScalarDType = ScalarDType::Bool;

    fn to_le_vec(self) -> Vec<u8> {
        vec![self as u8]
    }
}
