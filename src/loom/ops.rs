use std::borrow::Cow;

use derive_more::Display;
use itertools::Itertools;

use super::{
    device::{Backend, DeviceError},
    layout::LayoutDesc,
    memory::{ChunkId, Memory},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum Access {
    ReadOnly,
    ReadWrite,
    WriteOnly,
}

/// How an op touches one memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorIr {
    pub desc: LayoutDesc,
    pub id: ChunkId,
    pub offset: usize,
    pub access: Access,
}

impl TensorIr {
    /// Byte range of the chunk this memory covers.
    #[inline]
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.desc.size()
    }

    #[inline]
    pub fn overlaps(&self, other: &TensorIr) -> bool {
        let (x, y) = (self.range(), other.range());
        self.id == other.id && x.start < y.end && y.start < x.end
    }
}

impl Memory {
    #[inline]
    pub fn ir(&self, access: Access) -> TensorIr {
        TensorIr {
            desc: self.desc().clone(),
            id: self.chunk().id(),
            offset: self.offset(),
            access,
        }
    }
}

/// A unit of work executed by the engine.
pub trait TensorOp: Send + Sync + 'static {
    #[inline]
    fn name(&self) -> Cow<'static, str> {
        Cow::from(std::any::type_name::<Self>())
    }

    /// Memories read and written by the op.
    fn io(&self) -> Vec<TensorIr>;

    /// Runs the op. Called on the engine's worker threads.
    fn execute(&self, backend: &Backend) -> Result<(), DeviceError>;
}

/// Checks that no memory written by the op overlaps another of its memories, unless both
/// are [`Access::ReadWrite`].
pub fn check_io(io: &[TensorIr]) -> Result<(), DeviceError> {
    for (x, y) in io.iter().tuple_combinations() {
        if !x.overlaps(y) {
            continue;
        }
        // 1. `WriteOnly` memories must be unique
        if matches!(x.access, Access::WriteOnly) || matches!(y.access, Access::WriteOnly) {
            return Err(DeviceError::Access(x.id.to_string()));
        }
        // 2. `ReadWrite` memories must be unique unless the other is also `ReadWrite`
        if matches!(x.access, Access::ReadWrite) ^ matches!(y.access, Access::ReadWrite) {
            return Err(DeviceError::Access(x.id.to_string()));
        }
    }
    Ok(())
}
