//! Physical memory layouts.
//!
//! A [`LayoutDesc`] pairs logical dimensions with a [`Format`] tag. Every format is
//! described by a [`Blocking`]: the order in which the (outer) dimensions are laid out,
//! followed by optional inner blocks that split one dimension into `dim / block` outer
//! steps and `block` innermost elements. A blocked dimension is padded up to a multiple
//! of its block, so the physical element count of a vendor layout may exceed the logical
//! one.

use std::sync::Arc;

use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::num::DataType;

/// Highest rank that has a canonical default format.
pub const MAX_RANK: usize = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("invalid layout: dimensions are empty")]
    Empty,
    #[error("invalid layout: dimensions {0} contain zero")]
    Zero(Shape),
    #[error("invalid layout: format {0} expects rank {1}, found dimensions {2}")]
    Rank(Format, usize, Shape),
    #[error("invalid layout: no canonical format for rank {0}")]
    Unsupported(usize),
}

/// An ordered sequence of dimensions.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
pub struct Shape(Arc<[usize]>);

impl Shape {
    /// Total number of elements described by the dimensions.
    #[inline]
    pub fn count(&self) -> usize {
        self.iter().product()
    }

    /// Converts a linear row-major index into a coordinate.
    #[inline]
    pub fn unravel(&self, mut index: usize, coord: &mut [usize]) {
        debug_assert_eq!(coord.len(), self.len());
        for (c, &d) in coord.iter_mut().rev().zip(self.iter().rev()) {
            *c = index % d;
            index /= d;
        }
    }

    /// Converts a coordinate into its linear row-major index.
    #[inline]
    pub fn ravel(&self, coord: &[usize]) -> usize {
        coord
            .iter()
            .zip_eq(self.iter())
            .fold(0, |index, (&c, &d)| index * d + c)
    }
}

impl From<Vec<usize>> for Shape {
    #[inline]
    fn from(value: Vec<usize>) -> Self {
        Self(value.into())
    }
}

impl From<&[usize]> for Shape {
    #[inline]
    fn from(value: &[usize]) -> Self {
        Self(value.into())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    #[inline]
    fn from(value: [usize; N]) -> Self {
        Self(value.into())
    }
}

/// Order of outer dimensions plus inner `(dim, block)` splits, innermost last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blocking {
    pub order: &'static [usize],
    pub blocks: &'static [(usize, usize)],
}

impl Blocking {
    /// Returns `true` if the blocking is a plain row-major arrangement.
    #[inline]
    pub fn is_row_major(&self) -> bool {
        self.blocks.is_empty() && self.order.iter().enumerate().all(|(i, &d)| i == d)
    }
}

/// Physical layout tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Format {
    #[display("x")]
    X,
    #[display("nc")]
    Nc,
    #[display("ncw")]
    Ncw,
    #[display("nchw")]
    Nchw,
    #[display("ncdhw")]
    Ncdhw,
    #[display("oi")]
    Oi,
    #[display("oihw")]
    Oihw,
    #[display("goihw")]
    Goihw,
    #[display("nhwc")]
    Nhwc,
    #[display("nChw8c")]
    NChw8c,
    #[display("nChw16c")]
    NChw16c,
    #[display("OIhw8i8o")]
    OIhw8i8o,
    #[display("Ohwi8o")]
    Ohwi8o,
    #[display("gOihw8o")]
    GOihw8o,
}

impl Format {
    pub const fn rank(self) -> usize {
        match self {
            Format::X => 1,
            Format::Nc | Format::Oi => 2,
            Format::Ncw => 3,
            Format::Nchw
            | Format::Oihw
            | Format::Nhwc
            | Format::NChw8c
            | Format::NChw16c
            | Format::OIhw8i8o
            | Format::Ohwi8o => 4,
            Format::Ncdhw | Format::Goihw | Format::GOihw8o => 5,
        }
    }

    pub const fn blocking(self) -> Blocking {
        const R1: &[usize] = &[0];
        const R2: &[usize] = &[0, 1];
        const R3: &[usize] = &[0, 1, 2];
        const R4: &[usize] = &[0, 1, 2, 3];
        const R5: &[usize] = &[0, 1, 2, 3, 4];
        const HWC: &[usize] = &[0, 2, 3, 1];
        const fn plain(order: &'static [usize]) -> Blocking {
            Blocking { order, blocks: &[] }
        }
        match self {
            Format::X => plain(R1),
            Format::Nc | Format::Oi => plain(R2),
            Format::Ncw => plain(R3),
            Format::Nchw | Format::Oihw => plain(R4),
            Format::Ncdhw | Format::Goihw => plain(R5),
            Format::Nhwc => plain(HWC),
            Format::NChw8c => Blocking {
                order: R4,
                blocks: &[(1, 8)],
            },
            Format::NChw16c => Blocking {
                order: R4,
                blocks: &[(1, 16)],
            },
            Format::OIhw8i8o => Blocking {
                order: R4,
                blocks: &[(1, 8), (0, 8)],
            },
            Format::Ohwi8o => Blocking {
                order: HWC,
                blocks: &[(0, 8)],
            },
            Format::GOihw8o => Blocking {
                order: R5,
                blocks: &[(1, 8)],
            },
        }
    }

    /// The canonical default format for arrays of the given rank.
    pub const fn default_for(rank: usize) -> Option<Format> {
        match rank {
            1 => Some(Format::X),
            2 => Some(Format::Nc),
            3 => Some(Format::Ncw),
            4 => Some(Format::Nchw),
            5 => Some(Format::Goihw),
            _ => None,
        }
    }
}

/// Immutable description of a physical layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{}:{}:{}", dims, r#type, format)]
pub struct LayoutDesc {
    dims: Shape,
    r#type: DataType,
    format: Format,
    size: usize,
}

impl LayoutDesc {
    pub fn new(
        dims: impl Into<Shape>,
        r#type: DataType,
        format: Format,
    ) -> Result<Self, LayoutError> {
        let dims: Shape = dims.into();
        if dims.is_empty() {
            return Err(LayoutError::Empty);
        }
        if dims.contains(&0) {
            return Err(LayoutError::Zero(dims));
        }
        if dims.len() != format.rank() {
            return Err(LayoutError::Rank(format, format.rank(), dims));
        }
        let size = Indexer::new(&dims, format).physical_count() * r#type.size();
        Ok(Self {
            dims,
            r#type,
            format,
            size,
        })
    }

    /// Creates a descriptor in the canonical default format of the rank.
    pub fn from_shape(dims: impl Into<Shape>, r#type: DataType) -> Result<Self, LayoutError> {
        let dims: Shape = dims.into();
        let format = Format::default_for(dims.len()).ok_or(LayoutError::Unsupported(dims.len()))?;
        Self::new(dims, r#type, format)
    }

    #[inline]
    pub fn dims(&self) -> &Shape {
        &self.dims
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.r#type
    }

    #[inline]
    pub fn format(&self) -> Format {
        self.format
    }

    /// Required size in bytes, padding included.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Logical element count.
    #[inline]
    pub fn count(&self) -> usize {
        self.dims.count()
    }

    /// Physical element count, padding included.
    #[inline]
    pub fn physical_count(&self) -> usize {
        self.size / self.r#type.size()
    }

    /// Returns `true` if the descriptor uses the canonical default format of its rank.
    #[inline]
    pub fn is_default(&self) -> bool {
        Format::default_for(self.dims.len()) == Some(self.format)
    }

    /// Two descriptors are compatible iff they describe the same number of elements.
    #[inline]
    pub fn is_compatible(&self, other: &LayoutDesc) -> bool {
        self.count() == other.count()
    }

    /// The canonical counterpart of this descriptor.
    #[inline]
    pub fn to_default(&self) -> LayoutDesc {
        match Format::default_for(self.dims.len()) {
            Some(format) => {
                let size = self.count() * self.r#type.size();
                Self {
                    format,
                    size,
                    ..self.clone()
                }
            }
            None => unreachable!("descriptors are constructed with rank in 1..={MAX_RANK}"),
        }
    }

    #[inline]
    pub fn indexer(&self) -> Indexer {
        Indexer::new(&self.dims, self.format)
    }
}

/// Precomputed coordinate ↔ physical offset mapping of a descriptor.
#[derive(Debug, Clone)]
pub struct Indexer {
    dims: Shape,
    blocking: Blocking,
    /// Product of the inner blocks of each dimension.
    block: Vec<usize>,
    /// Outer extent of each dimension after blocking.
    extent: Vec<usize>,
}

impl Indexer {
    fn new(dims: &Shape, format: Format) -> Self {
        let blocking = format.blocking();
        let mut block = vec![1; dims.len()];
        for &(d, b) in blocking.blocks {
            block[d] *= b;
        }
        let extent = dims
            .iter()
            .zip_eq(block.iter())
            .map(|(&d, &b)| d.div_ceil(b))
            .collect();
        let dims = dims.clone();
        Self {
            dims,
            blocking,
            block,
            extent,
        }
    }

    pub fn physical_count(&self) -> usize {
        let outer: usize = self.extent.iter().product();
        let inner: usize = self.blocking.blocks.iter().map(|&(_, b)| b).product();
        outer * inner
    }

    /// Physical element offset of a logical coordinate.
    #[inline]
    pub fn offset(&self, coord: &[usize]) -> usize {
        let mut offset = 0;
        for &d in self.blocking.order {
            offset = offset * self.extent[d] + coord[d] / self.block[d];
        }
        for &(d, b) in self.blocking.blocks {
            offset = offset * b + coord[d] % b;
        }
        offset
    }

    /// Logical coordinate stored at a physical offset, or `false` for padding.
    #[inline]
    pub fn coord(&self, mut offset: usize, coord: &mut [usize]) -> bool {
        coord.fill(0);
        let mut inner = [1; MAX_RANK];
        for &(d, b) in self.blocking.blocks.iter().rev() {
            coord[d] += (offset % b) * inner[d];
            inner[d] *= b;
            offset /= b;
        }
        for &d in self.blocking.order.iter().rev() {
            coord[d] += (offset % self.extent[d]) * self.block[d];
            offset /= self.extent[d];
        }
        coord.iter().zip_eq(self.dims.iter()).all(|(&c, &d)| c < d)
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::{Format, LayoutDesc, LayoutError, Shape};
    use crate::loom::num::DataType;

    #[test]
    fn test_invalid_layout() {
        let err = LayoutDesc::new(Vec::<usize>::new(), DataType::F32, Format::X).unwrap_err();
        assert_eq!(err, LayoutError::Empty);
        let err = LayoutDesc::new([4, 0], DataType::F32, Format::Nc).unwrap_err();
        assert!(matches!(err, LayoutError::Zero(_)));
        let err = LayoutDesc::new([4, 4], DataType::F32, Format::Nchw).unwrap_err();
        assert!(matches!(err, LayoutError::Rank(Format::Nchw, 4, _)));
        let err = LayoutDesc::from_shape([1, 1, 1, 1, 1, 1], DataType::F32).unwrap_err();
        assert_eq!(err, LayoutError::Unsupported(6));
    }

    #[test]
    fn test_size() {
        let desc = LayoutDesc::new([10, 96, 54, 54], DataType::F32, Format::Nchw).unwrap();
        assert_eq!(desc.size(), 10 * 96 * 54 * 54 * 4);
        assert!(desc.is_default());

        // channels padded from 3 to 8
        let desc = LayoutDesc::new([2, 3, 5, 5], DataType::F32, Format::NChw8c).unwrap();
        assert_eq!(desc.count(), 2 * 3 * 5 * 5);
        assert_eq!(desc.physical_count(), 2 * 8 * 5 * 5);
        assert!(!desc.is_default());

        // both `o` and `i` padded
        let desc = LayoutDesc::new([96, 3, 11, 11], DataType::F16, Format::OIhw8i8o).unwrap();
        assert_eq!(desc.size(), 96 * 8 * 11 * 11 * 2);

        let desc = LayoutDesc::new([96, 3, 11, 11], DataType::F32, Format::Oihw).unwrap();
        assert!(!desc.is_default());
        assert_eq!(desc.to_default().format(), Format::Nchw);
    }

    #[test]
    fn test_default_format() {
        assert_eq!(Format::default_for(1), Some(Format::X));
        assert_eq!(Format::default_for(2), Some(Format::Nc));
        assert_eq!(Format::default_for(4), Some(Format::Nchw));
        assert_eq!(Format::default_for(5), Some(Format::Goihw));
        assert_eq!(Format::default_for(0), None);
        assert!(Format::Oihw.blocking().is_row_major());
        assert!(!Format::Nhwc.blocking().is_row_major());
    }

    #[test]
    fn test_ravel() {
        let shape = Shape::from([3, 4, 5]);
        let mut coord = [0; 3];
        for index in 0..shape.count() {
            shape.unravel(index, &mut coord);
            assert_eq!(shape.ravel(&coord), index);
        }
        // the last axis varies fastest
        shape.unravel(23, &mut coord);
        assert_eq!(coord, [1, 0, 3]);
    }

    #[test]
    fn test_indexer_bijection() {
        let formats = [
            ([2, 3, 5, 7], Format::Nchw),
            ([2, 3, 5, 7], Format::Nhwc),
            ([2, 3, 5, 7], Format::NChw8c),
            ([2, 19, 5, 7], Format::NChw16c),
            ([9, 3, 2, 2], Format::OIhw8i8o),
            ([9, 3, 2, 2], Format::Ohwi8o),
        ];
        for (dims, format) in formats {
            let desc = LayoutDesc::new(dims, DataType::F32, format).unwrap();
            let indexer = desc.indexer();
            let mut coord = [0; 4];
            let offsets = (0..desc.count())
                .map(|index| {
                    desc.dims().unravel(index, &mut coord);
                    indexer.offset(&coord)
                })
                .collect_vec();
            assert!(offsets.iter().all(|&offset| offset < desc.physical_count()));
            assert!(offsets.iter().all_unique(), "{desc}");

            let mut back = [0; 4];
            for (index, &offset) in offsets.iter().enumerate() {
                assert!(indexer.coord(offset, &mut back));
                assert_eq!(desc.dims().ravel(&back), index, "{desc}");
            }

            let padding = (0..desc.physical_count())
                .filter(|&offset| !indexer.coord(offset, &mut back))
                .count();
            assert_eq!(padding, desc.physical_count() - desc.count());
        }
    }

    #[test]
    fn test_nhwc_offset() {
        let desc = LayoutDesc::new([1, 3, 2, 2], DataType::F32, Format::Nhwc).unwrap();
        let indexer = desc.indexer();
        // channel is the fastest varying dimension
        assert_eq!(indexer.offset(&[0, 1, 0, 0]), 1);
        assert_eq!(indexer.offset(&[0, 0, 0, 1]), 3);
        assert_eq!(indexer.offset(&[0, 0, 1, 0]), 6);
    }
}
