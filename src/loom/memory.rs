use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use derive_more::{Deref, Display};

use super::{
    device::{DeviceError, Ticket},
    layout::LayoutDesc,
    num::Scalar,
};

/// Alignment of every allocated chunk, in bytes.
pub const ALIGNMENT: usize = 64;

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct ChunkId(uid::Id<ChunkId>);

#[derive(Debug, Clone, Copy)]
#[repr(C, align(64))]
struct Line([u8; ALIGNMENT]);

unsafe impl bytemuck::Zeroable for Line {}
unsafe impl bytemuck::Pod for Line {}

/// Returns the first address not below `addr` aligned to `alignment` and the space left
/// from there, or `None` if `size` bytes do not fit in `space`.
///
/// `alignment` must be a power of two.
pub fn align_mem(addr: usize, size: usize, alignment: usize, space: usize) -> Option<(usize, usize)> {
    debug_assert!(alignment.is_power_of_two());
    let aligned = addr.checked_add(alignment - 1)? & !(alignment - 1);
    let shift = aligned - addr;
    if shift.checked_add(size)? > space {
        return None;
    }
    Some((aligned, space - shift))
}

/// A zero-initialized, [`ALIGNMENT`]-aligned allocation.
#[derive(Debug)]
pub struct Chunk {
    id: ChunkId,
    len: usize,
    data: RwLock<Box<[Line]>>,
}

impl Chunk {
    pub fn new(len: usize) -> Self {
        let lines = len.div_ceil(ALIGNMENT);
        let data = RwLock::new(vec![Line([0; ALIGNMENT]); lines].into_boxed_slice());
        let id = ChunkId(uid::Id::new());
        Self { id, len, data }
    }

    #[inline]
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Size of the chunk in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fills the chunk with zeros.
    pub fn clear(&self) {
        let mut data = self.data.write().expect("failed to lock");
        bytemuck::cast_slice_mut::<Line, u8>(&mut data).fill(0);
    }
}

/// Read access to a range of a chunk.
pub struct MemoryRead<'a> {
    guard: RwLockReadGuard<'a, Box<[Line]>>,
    offset: usize,
    len: usize,
}

impl MemoryRead<'_> {
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<Line, u8>(&self.guard)[self.offset..self.offset + self.len]
    }

    #[inline]
    pub fn read_slice<T: Scalar>(&self) -> &[T] {
        bytemuck::cast_slice(self.bytes())
    }
}

/// Write access to a range of a chunk.
pub struct MemoryWrite<'a> {
    guard: RwLockWriteGuard<'a, Box<[Line]>>,
    offset: usize,
    len: usize,
}

impl MemoryWrite<'_> {
    #[inline]
    pub fn bytes(&mut self) -> &mut [u8] {
        let (offset, len) = (self.offset, self.len);
        &mut bytemuck::cast_slice_mut::<Line, u8>(&mut self.guard)[offset..offset + len]
    }

    #[inline]
    pub fn write_slice<T: Scalar>(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(self.bytes())
    }
}

/// A handle to a range of a chunk interpreted with a [`LayoutDesc`].
///
/// A memory produced by an enqueued op carries the op's [`Ticket`]; its contents are
/// only meaningful once the ticket resolves.
#[derive(Debug, Clone)]
pub struct Memory {
    chunk: Arc<Chunk>,
    offset: usize,
    desc: LayoutDesc,
    ticket: Option<Ticket>,
}

impl PartialEq for Memory {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.chunk, &other.chunk)
            && self.offset == other.offset
            && self.desc == other.desc
    }
}

impl Memory {
    /// Allocates a fresh zeroed memory for `desc`.
    pub fn new(desc: LayoutDesc) -> Self {
        let chunk = Arc::new(Chunk::new(desc.size()));
        Self::from_chunk(chunk, 0, desc)
    }

    /// Interprets `desc.size()` bytes of `chunk` from `offset` on.
    ///
    /// # Panics
    /// Panics if the range exceeds the chunk or the offset is not aligned to the element type.
    pub fn from_chunk(chunk: Arc<Chunk>, offset: usize, desc: LayoutDesc) -> Self {
        assert!(
            offset + desc.size() <= chunk.len(),
            "memory range {offset}..{} exceeds chunk of {} bytes",
            offset + desc.size(),
            chunk.len()
        );
        assert_eq!(offset % desc.data_type().size(), 0, "misaligned memory offset");
        Self {
            chunk,
            offset,
            desc,
            ticket: None,
        }
    }

    #[inline]
    pub fn desc(&self) -> &LayoutDesc {
        &self.desc
    }

    #[inline]
    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn ticket(&self) -> Option<&Ticket> {
        self.ticket.as_ref()
    }

    #[inline]
    pub(crate) fn with_ticket(mut self, ticket: Ticket) -> Self {
        self.ticket = Some(ticket);
        self
    }

    /// Reinterprets the same bytes with another descriptor of equal size.
    pub(crate) fn reshape(&self, desc: LayoutDesc) -> Self {
        debug_assert_eq!(self.desc.size(), desc.size());
        Self {
            desc,
            ..self.clone()
        }
    }

    /// Returns `true` if both memories share the same chunk.
    #[inline]
    pub fn aliases(&self, other: &Memory) -> bool {
        Arc::ptr_eq(&self.chunk, &other.chunk)
    }

    /// Returns `true` if the op producing this memory has completed.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ticket.as_ref().is_none_or(Ticket::is_ready)
    }

    /// Blocks until the op producing this memory has completed.
    ///
    /// The op must have been submitted; use [`NdArray::wait_to_read`](super::tensor::NdArray::wait_to_read)
    /// or submit the stream first.
    pub fn wait(&self) -> Result<(), DeviceError> {
        match &self.ticket {
            Some(ticket) => ticket.wait(),
            None => Ok(()),
        }
    }

    #[inline]
    pub fn read(&self) -> MemoryRead<'_> {
        let guard = self.chunk.data.read().expect("failed to lock");
        let offset = self.offset;
        let len = self.desc.size();
        MemoryRead { guard, offset, len }
    }

    #[inline]
    pub fn write(&self) -> MemoryWrite<'_> {
        let guard = self.chunk.data.write().expect("failed to lock");
        let offset = self.offset;
        let len = self.desc.size();
        MemoryWrite { guard, offset, len }
    }

    /// Copies the physical contents out. Padding included.
    pub fn to_vec<T: Scalar>(&self) -> Vec<T> {
        self.read().read_slice::<T>().to_vec()
    }
}
