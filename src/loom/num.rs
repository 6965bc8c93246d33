use bytemuck::Pod;
use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F32,
    F16,
    U8,
    U16,
    U32,
    I32,
}

impl DataType {
    /// Returns the size in bytes of one element of this type.
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 => 4,
            DataType::I32 => 4,
        }
    }

    /// Returns `true` if the type is a floating point type.
    pub const fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F16)
    }
}

pub trait Scalar: Sized + Pod + PartialEq + std::fmt::Debug + Send + Sync {
    const DATA_TYPE: DataType;
}

/// Scalars that element-wise arithmetic kernels accept.
pub trait Float: Scalar + std::ops::Add<Output = Self> {}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

impl Scalar for f16 {
    const DATA_TYPE: DataType = DataType::F16;
}

impl Scalar for u8 {
    const DATA_TYPE: DataType = DataType::U8;
}

impl Scalar for u16 {
    const DATA_TYPE: DataType = DataType::U16;
}

impl Scalar for u32 {
    const DATA_TYPE: DataType = DataType::U32;
}

impl Scalar for i32 {
    const DATA_TYPE: DataType = DataType::I32;
}

impl Float for f32 {}
impl Float for f16 {}
