use std::sync::{Arc, Mutex, MutexGuard};

use derive_more::{Deref, Display};
use itertools::Itertools;
use thiserror::Error;

use super::{
    device::{DeviceError, Ticket},
    layout::{LayoutDesc, LayoutError, Shape},
    memory::Memory,
    num::{DataType, Scalar},
    ops::Access,
    reorder::{ConversionTask, Plan, ReorderCache, ReorderKey, plan},
    stream::{Context, StreamError},
};

#[derive(Debug, Error)]
pub enum TensorError {
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("incompatible layout: array {0} cannot be read as {1}")]
    IncompatibleLayout(LayoutDesc, LayoutDesc),
    #[error("shape mismatch: cannot copy {1} elements into an array of shape {0}")]
    ShapeMismatch(Shape, usize),
    #[error("tensor type error: data type {0} mismatches {1}")]
    Type(DataType, DataType),
    #[error("tensor creation error: shape {0} does not match data len {1}")]
    Create(Shape, usize),
    #[error("tensor slice error: range {1}..{2} is out of bounds of shape {0}")]
    Slice(Shape, usize, usize),
    #[error("tensor reshape error: shape {0} does not match shape {1}")]
    Reshape(Shape, Shape),
    #[error("tensor cast error: {1} bytes at offset {2} do not fit an array of {0} bytes")]
    Cast(usize, usize, usize),
    #[error("tensor view error: a view of {0} cannot hold a layout of its own")]
    View(Shape),
    #[error("tensor context error: arrays belong to different contexts")]
    Context,
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct StorageId(uid::Id<StorageId>);

/// Where the authoritative content of a storage lives.
#[derive(Debug, Default, Clone)]
pub enum Residence {
    /// The canonical bytes are up to date.
    #[default]
    Canonical,
    /// A shadow in another layout is attached. The canonical bytes only hold the same
    /// content if `synced`.
    Shadowed { memory: Memory, synced: bool },
}

#[derive(Debug, Default)]
struct StorageState {
    residence: Residence,
    cache: ReorderCache,
    /// Outstanding ops writing the storage, in enqueue order.
    tickets: Vec<Ticket>,
}

impl StorageState {
    fn push_ticket(&mut self, ticket: Ticket) {
        self.tickets.retain(|ticket| !ticket.is_ready());
        self.tickets.push(ticket);
    }

    fn last_ticket(&self) -> Option<&Ticket> {
        self.tickets.last()
    }
}

/// The owning allocation behind one or more arrays.
#[derive(Debug)]
pub struct Storage {
    id: StorageId,
    canonical: Memory,
    state: Mutex<StorageState>,
}

impl Storage {
    fn new(canonical: Memory) -> Self {
        Self {
            id: StorageId::default(),
            canonical,
            state: Default::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> StorageId {
        self.id
    }

    /// Canonical layout of the whole allocation, as created by its owner.
    #[inline]
    pub fn desc(&self) -> &LayoutDesc {
        self.canonical.desc()
    }

    #[inline]
    fn state(&self) -> MutexGuard<'_, StorageState> {
        self.state.lock().expect("failed to lock")
    }

    /// Enqueues the conversion of an unsynced shadow back into the canonical bytes.
    fn realize(&self, state: &mut StorageState, context: &Context) {
        if let Residence::Shadowed { memory, synced } = &mut state.residence {
            if !*synced {
                let src = memory.clone();
                let dst = self.canonical.clone();
                log::trace!("realize storage {} from {}", self.id, src.desc());
                let ticket = context.enqueue(ConversionTask { src, dst });
                *synced = true;
                state.push_ticket(ticket);
            }
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// Covers the whole storage it created.
    Owned,
    /// A slice or reshape of another array.
    View,
    /// Re-uses another array's storage, possibly with another element type.
    Reused,
}

/// A logical n-dimensional array over a shared [`Storage`].
///
/// The array's canonical content always lives at `offset` of the storage's canonical
/// bytes in row-major order. Arrays that are not views may additionally see the storage's
/// shadow, a copy in an optimized layout that can be more recent than the canonical bytes.
#[derive(Debug, Clone)]
pub struct NdArray {
    context: Context,
    storage: Arc<Storage>,
    shape: Shape,
    r#type: DataType,
    offset: usize,
    ownership: Ownership,
    weight: bool,
}

impl NdArray {
    /// Creates an array of zeros in the canonical layout.
    pub fn zeros(
        context: &Context,
        shape: impl Into<Shape>,
        r#type: DataType,
    ) -> Result<Self, TensorError> {
        let desc = LayoutDesc::from_shape(shape, r#type)?;
        let shape = desc.dims().clone();
        let storage = Arc::new(Storage::new(Memory::new(desc)));
        Ok(Self {
            context: context.clone(),
            storage,
            shape,
            r#type,
            offset: 0,
            ownership: Ownership::Owned,
            weight: false,
        })
    }

    /// Creates an array holding `data` in the canonical layout.
    pub fn from_slice<T: Scalar>(
        context: &Context,
        shape: impl Into<Shape>,
        data: &[T],
    ) -> Result<Self, TensorError> {
        let array = Self::zeros(context, shape, T::DATA_TYPE)?;
        if array.count() != data.len() {
            return Err(TensorError::Create(array.shape, data.len()));
        }
        array
            .storage
            .canonical
            .write()
            .write_slice::<T>()
            .copy_from_slice(data);
        Ok(array)
    }

    /// Another array over the same storage. Views never keep the weight flag.
    pub(crate) fn derive(
        &self,
        shape: Shape,
        r#type: DataType,
        offset: usize,
        ownership: Ownership,
    ) -> Self {
        Self {
            context: self.context.clone(),
            storage: self.storage.clone(),
            shape,
            r#type,
            offset,
            ownership,
            weight: self.weight && ownership != Ownership::View,
        }
    }

    /// Reads the canonical content back. Blocks until pending writes complete.
    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>, TensorError> {
        if self.r#type != T::DATA_TYPE {
            return Err(TensorError::Type(self.r#type, T::DATA_TYPE));
        }
        Ok(self.get_default_data()?.to_vec::<T>())
    }

    #[inline]
    pub fn context(&self) -> &Context {
        &self.context
    }

    #[inline]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.r#type
    }

    /// Byte offset into the storage's canonical bytes.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.shape.count()
    }

    /// Size of the canonical content in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.count() * self.r#type.size()
    }

    #[inline]
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Returns `true` if the array only sees part of its storage, or sees it reinterpreted.
    ///
    /// A reused array is a view if its element type or its element count differs from the
    /// storage's.
    pub fn is_view(&self) -> bool {
        match self.ownership {
            Ownership::Owned => false,
            Ownership::View => true,
            Ownership::Reused => {
                let desc = self.storage.desc();
                self.r#type != desc.data_type() || self.count() != desc.count()
            }
        }
    }

    #[inline]
    pub fn is_weight(&self) -> bool {
        self.weight
    }

    /// Flags the array as a weight, allowing layouts with padded dimensions.
    #[inline]
    pub fn into_weight(self) -> Self {
        Self {
            weight: true,
            ..self
        }
    }

    #[inline]
    pub fn shares_storage(&self, other: &NdArray) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Returns `true` if the storage holds a shadow.
    pub fn has_shadow(&self) -> bool {
        matches!(self.storage.state().residence, Residence::Shadowed { .. })
    }

    /// Descriptor of the shadow, if any.
    pub fn shadow_desc(&self) -> Option<LayoutDesc> {
        match &self.storage.state().residence {
            Residence::Shadowed { memory, .. } => Some(memory.desc().clone()),
            Residence::Canonical => None,
        }
    }

    /// Number of conversions cached for the storage's current content.
    pub fn cached_conversions(&self) -> usize {
        self.storage.state().cache.len()
    }

    /// The canonical descriptor of the array.
    #[inline]
    pub fn default_desc(&self) -> Result<LayoutDesc, TensorError> {
        Ok(LayoutDesc::from_shape(self.shape.clone(), self.r#type)?)
    }

    /// The array's range of the canonical bytes, tagged with the last write to the storage.
    fn canonical(&self, state: &StorageState) -> Result<Memory, TensorError> {
        let chunk = self.storage.canonical.chunk().clone();
        let offset = self.storage.canonical.offset() + self.offset;
        let memory = Memory::from_chunk(chunk, offset, self.default_desc()?);
        Ok(match state.last_ticket() {
            Some(ticket) => memory.with_ticket(ticket.clone()),
            None => memory,
        })
    }

    fn check_layout(&self, desc: &LayoutDesc) -> Result<(), TensorError> {
        let logical = self.default_desc()?;
        let incompatible = || TensorError::IncompatibleLayout(logical.clone(), desc.clone());
        if desc.data_type() != self.r#type {
            return Err(incompatible());
        }
        if desc.count() == self.count() {
            return Ok(());
        }
        let padded = desc.dims().len() == self.shape.len()
            && desc.dims().iter().zip_eq(self.shape.iter()).all(|(d, s)| d >= s);
        match self.weight && padded {
            true => Ok(()),
            false => Err(incompatible()),
        }
    }

    /// Blocks until every pending write to the storage has completed, submitting the
    /// stream first if one of them has not been submitted yet.
    pub fn wait_to_read(&self) -> Result<(), TensorError> {
        let tickets = self.storage.state().tickets.clone();
        {
            let mut stream = self.context.stream();
            if tickets.iter().any(|ticket| stream.is_queued(ticket)) {
                stream.flush()?;
            }
        }
        for ticket in tickets {
            ticket.wait()?;
        }
        Ok(())
    }

    /// Returns the content in the canonical layout, converting from the shadow first.
    ///
    /// Blocks until the returned memory is readable.
    pub fn get_default_data(&self) -> Result<Memory, TensorError> {
        let memory = {
            let mut state = self.storage.state();
            self.storage.realize(&mut state, &self.context);
            self.canonical(&state)?
        };
        self.wait_to_read()?;
        Ok(memory)
    }

    /// Returns the content in whatever layout it currently lives in. Does not block.
    ///
    /// Views always resolve through the canonical bytes.
    pub fn get_layout_data(&self) -> Result<Memory, TensorError> {
        let mut state = self.storage.state();
        if !self.is_view() {
            if let Residence::Shadowed { memory, .. } = &state.residence {
                return Ok(memory.clone());
            }
        }
        self.storage.realize(&mut state, &self.context);
        self.canonical(&state)
    }

    /// Returns the content converted into `desc`. Does not block.
    ///
    /// A conversion is planned once per content and layout: repeated requests return the
    /// same memory. A returned memory carrying an unsubmitted ticket only becomes readable
    /// after the stream's next submit completes.
    pub fn get_reordered_data(&self, desc: &LayoutDesc) -> Result<Memory, TensorError> {
        self.check_layout(desc)?;

        let mut state = self.storage.state();
        let view = self.is_view();
        // a synced shadow is skipped when the canonical bytes can be reshaped instead
        let shadow = match &state.residence {
            Residence::Shadowed { memory, synced } if !view && !(*synced && desc.is_default()) => {
                Some(memory.clone())
            }
            _ => None,
        };
        let src = match shadow {
            Some(memory) => memory,
            None => {
                self.storage.realize(&mut state, &self.context);
                self.canonical(&state)?
            }
        };
        if src.desc() == desc {
            return Ok(src);
        }

        let key = ReorderKey::new(&src, desc);
        if let Some(memory) = state.cache.get(&key) {
            return Ok(memory.clone());
        }

        let memory = match plan(&src, desc) {
            Plan::Reshape(memory) => memory,
            Plan::Reorder(task) => {
                log::trace!("reorder {} into {desc}", task.src.desc());
                let dst = task.dst.clone();
                let ticket = self.context.enqueue(task);
                dst.with_ticket(ticket)
            }
        };
        state.cache.insert(key, memory.clone());

        // attach the first optimized layout as shadow; the canonical bytes stay in sync
        if !view && !desc.is_default() && matches!(state.residence, Residence::Canonical) {
            state.residence = Residence::Shadowed {
                memory: memory.clone(),
                synced: true,
            };
        }
        Ok(memory)
    }

    /// Moves the content into `desc`, making the shadow authoritative. Does not block.
    pub fn reorder_async(&self, desc: &LayoutDesc) -> Result<(), TensorError> {
        if self.is_view() {
            return Err(TensorError::View(self.shape.clone()));
        }
        self.check_layout(desc)?;

        if desc.is_default() {
            let mut state = self.storage.state();
            self.storage.realize(&mut state, &self.context);
            state.residence = Residence::Canonical;
            return Ok(());
        }

        let memory = self.get_reordered_data(desc)?;
        let mut state = self.storage.state();
        if let Some(ticket) = memory.ticket() {
            state.push_ticket(ticket.clone());
        }
        state.residence = Residence::Shadowed {
            memory,
            synced: false,
        };
        Ok(())
    }

    /// Overwrites the content with `memory`'s, in any layout of the same element count.
    /// Does not block.
    pub fn copy_from(&self, memory: &Memory) -> Result<(), TensorError> {
        if memory.desc().count() != self.count() {
            return Err(TensorError::ShapeMismatch(
                self.shape.clone(),
                memory.desc().count(),
            ));
        }
        if memory.desc().data_type() != self.r#type {
            return Err(TensorError::Type(memory.desc().data_type(), self.r#type));
        }
        self.context.settle(memory)?;

        let mut state = self.storage.state();
        let dst = self.invalidate(&mut state)?;
        if *memory == dst {
            return Ok(());
        }
        // overlapping ranges go through a temporary
        let src = match memory.ir(Access::ReadOnly).overlaps(&dst.ir(Access::WriteOnly)) {
            true => {
                let src = memory.clone();
                let dst = Memory::new(memory.desc().clone());
                let ticket = self.context.enqueue(ConversionTask { src, dst: dst.clone() });
                dst.with_ticket(ticket)
            }
            false => memory.clone(),
        };
        let ticket = self.context.enqueue(ConversionTask { src, dst });
        state.push_ticket(ticket);
        Ok(())
    }

    /// Prepares for a write into the canonical bytes: realizes the rest of the storage if
    /// only part of it will be written, then drops the shadow and every cached conversion.
    fn invalidate(&self, state: &mut StorageState) -> Result<Memory, TensorError> {
        if self.is_view() {
            self.storage.realize(state, &self.context);
        }
        state.residence = Residence::Canonical;
        state.cache.clear();
        self.canonical(state)
    }

    /// Returns memory in layout `desc` for a kernel to write the array's new content into.
    ///
    /// The memory is the array's own whenever possible. Views, and arrays whose storage is
    /// shared with one of the kernel's `inputs`, get a temporary that
    /// [`commit_output`](Self::commit_output) copies back.
    pub fn prepare_output(
        &self,
        desc: &LayoutDesc,
        inputs: &[&NdArray],
    ) -> Result<OutputMemory, TensorError> {
        self.check_layout(desc)?;
        let aliased = inputs.iter().any(|input| self.shares_storage(input));

        let mut state = self.storage.state();
        if self.is_view() || aliased {
            let memory = Memory::new(desc.clone());
            return Ok(OutputMemory {
                memory,
                commit: true,
            });
        }

        // canonical descriptors of the same count write the canonical bytes directly
        let memory = match desc.is_default() && desc.count() == self.count() {
            true => self.invalidate(&mut state)?.reshape(desc.clone()),
            false => {
                let memory = Memory::new(desc.clone());
                state.cache.clear();
                state.residence = Residence::Shadowed {
                    memory: memory.clone(),
                    synced: false,
                };
                memory
            }
        };
        Ok(OutputMemory {
            memory,
            commit: false,
        })
    }

    /// Records the kernel writing `output` as a pending write of the array, copying a
    /// temporary back into the canonical bytes.
    pub fn commit_output(&self, output: OutputMemory, ticket: Ticket) -> Result<(), TensorError> {
        let OutputMemory { memory, commit } = output;
        let mut state = self.storage.state();
        state.push_ticket(ticket.clone());
        if let Residence::Shadowed { memory: shadow, .. } = &mut state.residence {
            if *shadow == memory {
                *shadow = memory.clone().with_ticket(ticket.clone());
            }
        }
        if commit {
            let dst = self.invalidate(&mut state)?;
            let src = memory.with_ticket(ticket);
            let ticket = self.context.enqueue(ConversionTask { src, dst });
            state.push_ticket(ticket);
        }
        Ok(())
    }

    /// Returns `true` if the array can take the optimized compute path.
    #[inline]
    pub fn supports_optimized(&self) -> bool {
        self.r#type == DataType::F32 && matches!(self.shape.len(), 1 | 2 | 4)
    }
}

/// Memory handed to a kernel for writing an array's content.
#[derive(Debug, Clone)]
pub struct OutputMemory {
    memory: Memory,
    commit: bool,
}

impl OutputMemory {
    #[inline]
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Returns `true` if the memory is a temporary copied back on commit.
    #[inline]
    pub fn is_temporary(&self) -> bool {
        self.commit
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{NdArray, TensorError};
    use crate::loom::{
        device::EngineBuilder,
        layout::{Format, LayoutDesc},
        num::DataType,
        stream::Context,
    };

    fn context() -> Context {
        Context::new(EngineBuilder::new().build().expect("failed to build engine"))
    }

    #[test]
    fn test_create() -> Result<(), Box<dyn Error>> {
        let context = context();
        let data = (0..12).map(|x| x as f32).collect_vec();
        let array = NdArray::from_slice(&context, [3, 4], &data)?;
        assert_eq!(array.count(), 12);
        assert_eq!(array.size(), 48);
        assert!(!array.is_view());
        assert!(!array.has_shadow());
        assert_eq!(array.to_vec::<f32>()?, data);

        assert!(matches!(
            NdArray::from_slice(&context, [3, 5], &data),
            Err(TensorError::Create(..))
        ));
        assert!(matches!(array.to_vec::<u32>(), Err(TensorError::Type(..))));
        assert!(matches!(
            NdArray::zeros(&context, [0, 3], DataType::F32),
            Err(TensorError::Layout(_))
        ));
        Ok(())
    }

    #[test]
    fn test_shadow_lifecycle() -> Result<(), Box<dyn Error>> {
        let context = context();
        let data = (0..2 * 3 * 4 * 4).map(|x| x as f32).collect_vec();
        let array = NdArray::from_slice(&context, [2, 3, 4, 4], &data)?;
        let desc = LayoutDesc::new([2, 3, 4, 4], DataType::F32, Format::NChw8c)?;

        // requested layouts are attached lazily
        let memory = array.get_reordered_data(&desc)?;
        assert_eq!(array.shadow_desc(), Some(desc.clone()));
        assert_eq!(array.get_layout_data()?, memory);
        assert_eq!(context.stream().len(), 1);

        // a canonical write drops the shadow and every conversion
        let zeros = NdArray::zeros(&context, [2, 3, 4, 4], DataType::F32)?;
        array.copy_from(&zeros.get_layout_data()?)?;
        assert!(!array.has_shadow());
        assert_eq!(array.cached_conversions(), 0);
        assert!(array.to_vec::<f32>()?.iter().all(|&x| x == 0.0));
        Ok(())
    }

    #[test]
    fn test_weight_layout() -> Result<(), Box<dyn Error>> {
        let context = context();
        let data = (0..3 * 2 * 3 * 3).map(|x| x as f32).collect_vec();
        let array = NdArray::from_slice(&context, [3, 2, 3, 3], &data)?;
        let padded = LayoutDesc::new([8, 8, 3, 3], DataType::F32, Format::OIhw8i8o)?;
        assert!(matches!(
            array.get_reordered_data(&padded),
            Err(TensorError::IncompatibleLayout(..))
        ));

        let array = array.into_weight();
        array.reorder_async(&padded)?;
        assert_eq!(array.shadow_desc(), Some(padded));
        assert_eq!(array.to_vec::<f32>()?, data);

        // the weight exception never allows fewer elements
        let cropped = LayoutDesc::new([2, 2, 3, 3], DataType::F32, Format::Oihw)?;
        assert!(matches!(
            array.get_reordered_data(&cropped),
            Err(TensorError::IncompatibleLayout(..))
        ));
        Ok(())
    }

    #[test]
    fn test_prepare_output() -> Result<(), Box<dyn Error>> {
        let context = context();
        let array = NdArray::zeros(&context, [2, 8, 2, 2], DataType::F32)?;
        let canonical = array.get_layout_data()?;

        // another canonical shape is still the canonical bytes
        let flat = LayoutDesc::from_shape([2, 32], DataType::F32)?;
        let output = array.prepare_output(&flat, &[])?;
        assert!(!output.is_temporary());
        assert!(output.memory().aliases(&canonical));
        assert_eq!(output.memory().desc(), &flat);
        assert!(!array.has_shadow());

        // an optimized layout becomes the shadow
        let blocked = LayoutDesc::new([2, 8, 2, 2], DataType::F32, Format::NChw8c)?;
        let output = array.prepare_output(&blocked, &[])?;
        assert!(!output.memory().aliases(&canonical));
        assert_eq!(array.shadow_desc(), Some(blocked));

        // aliased inputs get a temporary
        let output = array.prepare_output(&flat, &[&array])?;
        assert!(output.is_temporary());
        Ok(())
    }

    #[test]
    fn test_copy_mismatch() -> Result<(), Box<dyn Error>> {
        let context = context();
        let array = NdArray::zeros(&context, [4, 4], DataType::F32)?;
        let other = NdArray::zeros(&context, [4, 5], DataType::F32)?;
        assert!(matches!(
            array.copy_from(&other.get_layout_data()?),
            Err(TensorError::ShapeMismatch(..))
        ));
        let other = NdArray::zeros(&context, [16], DataType::U32)?;
        assert!(matches!(
            array.copy_from(&other.get_layout_data()?),
            Err(TensorError::Type(..))
        ));
        Ok(())
    }
}
