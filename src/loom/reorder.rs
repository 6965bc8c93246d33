//! Layout conversions between memories.

use rustc_hash::FxHashMap as HashMap;

use super::{
    device::{Backend, DeviceError},
    layout::{LayoutDesc, MAX_RANK},
    memory::{ChunkId, Memory},
    ops::{Access, TensorIr, TensorOp},
};

/// Identifies one conversion: the source region and both layouts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReorderKey {
    pub chunk: ChunkId,
    pub offset: usize,
    pub src: LayoutDesc,
    pub dst: LayoutDesc,
}

impl ReorderKey {
    pub fn new(src: &Memory, dst: &LayoutDesc) -> Self {
        Self {
            chunk: src.chunk().id(),
            offset: src.offset(),
            src: src.desc().clone(),
            dst: dst.clone(),
        }
    }
}

/// Conversions of one storage's current content.
#[derive(Debug, Default, Clone)]
pub struct ReorderCache(HashMap<ReorderKey, Memory>);

impl ReorderCache {
    #[inline]
    pub fn get(&self, key: &ReorderKey) -> Option<&Memory> {
        self.0.get(key)
    }

    #[inline]
    pub fn insert(&mut self, key: ReorderKey, memory: Memory) {
        self.0.insert(key, memory);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// How to obtain `src`'s content in another layout.
#[derive(Debug)]
pub enum Plan {
    /// Same bytes, other descriptor. Nothing to execute.
    Reshape(Memory),
    /// A physical reorder into freshly allocated memory.
    Reorder(ConversionTask),
}

/// Plans a reshape when both layouts are plain row-major arrangements of the same bytes:
/// both canonical, or one row-major format differing only in its dims.
pub fn plan(src: &Memory, dst: &LayoutDesc) -> Plan {
    let desc = src.desc();
    let row_major = (desc.is_default() && dst.is_default())
        || (desc.format() == dst.format() && desc.format().blocking().is_row_major());
    let same_bytes = desc.data_type() == dst.data_type() && desc.size() == dst.size();
    if desc == dst || (row_major && same_bytes) {
        return Plan::Reshape(src.reshape(dst.clone()));
    }
    let dst = Memory::new(dst.clone());
    Plan::Reorder(ConversionTask {
        src: src.clone(),
        dst,
    })
}

/// Copies the content of `src` into `dst`, converting between their layouts.
#[derive(Debug, Clone)]
pub struct ConversionTask {
    pub src: Memory,
    pub dst: Memory,
}

impl TensorOp for ConversionTask {
    fn io(&self) -> Vec<TensorIr> {
        vec![self.src.ir(Access::ReadOnly), self.dst.ir(Access::WriteOnly)]
    }

    fn execute(&self, backend: &Backend) -> Result<(), DeviceError> {
        let (src, dst) = (self.src.desc(), self.dst.desc());
        if src.data_type() != dst.data_type() {
            let err = format!("cannot convert {src} into {dst}");
            return Err(DeviceError::Kernel(self.name().into(), err));
        }
        if src.count() != dst.count() && src.dims().len() != dst.dims().len() {
            let err = format!("cannot map coordinates of {src} onto {dst}");
            return Err(DeviceError::Kernel(self.name().into(), err));
        }

        let output = {
            let input = self.src.read();
            backend.install(|| reorder(input.bytes(), src, dst))
        };
        self.dst.write().bytes().copy_from_slice(&output);
        Ok(())
    }
}

/// Gathers the bytes of `dst`'s physical elements out of `input` laid out as `src`.
///
/// When element counts agree, coordinates are matched through their linear index. When
/// they differ (padded weight layouts) coordinates map one to one; elements outside the
/// source become zero, and so do padding elements of `dst`.
pub fn reorder(input: &[u8], src: &LayoutDesc, dst: &LayoutDesc) -> Vec<u8> {
    let size = dst.data_type().size();
    let mut output = vec![0u8; dst.size()];

    let (src_indexer, dst_indexer) = (src.indexer(), dst.indexer());
    let linear = src.count() == dst.count();
    let (src_rank, dst_rank) = (src.dims().len(), dst.dims().len());

    let gather = |buffer: &mut ([usize; MAX_RANK], [usize; MAX_RANK]),
                  (offset, element): (usize, &mut [u8])| {
        let (coord, source) = buffer;
        let coord = &mut coord[..dst_rank];
        let source = &mut source[..src_rank];
        if !dst_indexer.coord(offset, coord) {
            return;
        }
        if linear {
            src.dims().unravel(dst.dims().ravel(coord), source);
        } else {
            source.copy_from_slice(coord);
            if source.iter().zip(src.dims().iter()).any(|(&c, &d)| c >= d) {
                return;
            }
        }
        let start = src_indexer.offset(source) * size;
        element.copy_from_slice(&input[start..start + size]);
    };

    #[cfg(not(feature = "rayon"))]
    {
        let mut buffer = ([0; MAX_RANK], [0; MAX_RANK]);
        output
            .chunks_mut(size)
            .enumerate()
            .for_each(|item| gather(&mut buffer, item));
    }
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        output
            .par_chunks_mut(size)
            .enumerate()
            .for_each_init(|| ([0; MAX_RANK], [0; MAX_RANK]), gather);
    }

    output
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::{Plan, plan, reorder};
    use crate::loom::{
        layout::{Format, LayoutDesc},
        memory::Memory,
        num::DataType,
    };

    fn bytes(data: &[f32]) -> Vec<u8> {
        bytemuck::cast_slice(data).to_vec()
    }

    fn floats(data: &[u8]) -> Vec<f32> {
        bytemuck::pod_collect_to_vec(data)
    }

    #[test]
    fn test_reorder_nhwc() {
        let nchw = LayoutDesc::new([1, 3, 2, 2], DataType::F32, Format::Nchw).unwrap();
        let nhwc = LayoutDesc::new([1, 3, 2, 2], DataType::F32, Format::Nhwc).unwrap();
        let data = (0..12).map(|x| x as f32).collect_vec();

        let output = floats(&reorder(&bytes(&data), &nchw, &nhwc));
        let r#ref = [0, 4, 8, 1, 5, 9, 2, 6, 10, 3, 7, 11].map(|x| x as f32);
        assert_eq!(output, r#ref);

        let back = floats(&reorder(&bytes(&output), &nhwc, &nchw));
        assert_eq!(back, data);
    }

    #[test]
    fn test_reorder_blocked_padding() {
        let nchw = LayoutDesc::new([2, 3, 4, 5], DataType::F32, Format::Nchw).unwrap();
        let blocked = LayoutDesc::new([2, 3, 4, 5], DataType::F32, Format::NChw8c).unwrap();
        let data = (0..nchw.count()).map(|x| x as f32 + 1.0).collect_vec();

        let output = floats(&reorder(&bytes(&data), &nchw, &blocked));
        assert_eq!(output.len(), blocked.physical_count());
        // padding channels stay zero
        let zeros = output.iter().filter(|&&x| x == 0.0).count();
        assert_eq!(zeros, blocked.physical_count() - blocked.count());

        let back = floats(&reorder(&bytes(&output), &blocked, &nchw));
        assert_eq!(back, data);
    }

    #[test]
    fn test_reorder_padded_dims() {
        // a weight laid out with padded output channels
        let oihw = LayoutDesc::new([3, 2, 1, 1], DataType::F32, Format::Oihw).unwrap();
        let padded = LayoutDesc::new([8, 2, 1, 1], DataType::F32, Format::Oihw).unwrap();
        let data = (0..6).map(|x| x as f32 + 1.0).collect_vec();

        let output = floats(&reorder(&bytes(&data), &oihw, &padded));
        assert_eq!(&output[..6], &data[..]);
        assert!(output[6..].iter().all(|&x| x == 0.0));

        let back = floats(&reorder(&bytes(&output), &padded, &oihw));
        assert_eq!(back, data);
    }

    #[test]
    fn test_plan() {
        let flat = LayoutDesc::from_shape([24], DataType::F32).unwrap();
        let nchw = LayoutDesc::from_shape([1, 2, 3, 4], DataType::F32).unwrap();
        let oihw = LayoutDesc::new([1, 2, 3, 4], DataType::F32, Format::Oihw).unwrap();
        let memory = Memory::new(nchw.clone());

        match plan(&memory, &flat) {
            Plan::Reshape(reshaped) => {
                assert!(reshaped.aliases(&memory));
                assert_eq!(reshaped.desc(), &flat);
            }
            Plan::Reorder(_) => panic!("expected reshape"),
        }
        match plan(&memory, &oihw) {
            Plan::Reorder(task) => {
                assert!(!task.dst.aliases(&memory));
                assert_eq!(task.dst.desc(), &oihw);
            }
            Plan::Reshape(_) => panic!("expected reorder"),
        }

        // a row-major weight format only relabels its dims
        let oihw = LayoutDesc::new([2, 3, 2, 2], DataType::F32, Format::Oihw).unwrap();
        let weight = Memory::new(oihw);
        let regrouped = LayoutDesc::new([4, 3, 1, 2], DataType::F32, Format::Oihw).unwrap();
        assert!(matches!(
            plan(&weight, &regrouped),
            Plan::Reshape(memory) if memory.aliases(&weight)
        ));
        let padded = LayoutDesc::new([4, 3, 2, 2], DataType::F32, Format::Oihw).unwrap();
        assert!(matches!(plan(&weight, &padded), Plan::Reorder(_)));

        let blocked = LayoutDesc::new([8, 8, 1, 1], DataType::F32, Format::OIhw8i8o).unwrap();
        let source = Memory::new(blocked.clone());
        let other = LayoutDesc::new([4, 16, 1, 1], DataType::F32, Format::OIhw8i8o).unwrap();
        assert!(matches!(plan(&source, &blocked), Plan::Reshape(_)));
        assert!(matches!(plan(&source, &other), Plan::Reorder(_)));
    }
}
