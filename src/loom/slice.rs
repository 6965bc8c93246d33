use super::{
    layout::{LayoutDesc, Shape},
    num::DataType,
    tensor::{NdArray, Ownership, TensorError},
};

impl NdArray {
    /// Creates a view of rows `begin..end` along the first axis.
    pub fn slice(&self, begin: usize, end: usize) -> Result<NdArray, TensorError> {
        let rows = self.shape()[0];
        if begin >= end || end > rows {
            return Err(TensorError::Slice(self.shape().clone(), begin, end));
        }
        let stride = self.size() / rows;
        let mut shape = self.shape().to_vec();
        shape[0] = end - begin;
        Ok(self.derive(
            shape.into(),
            self.data_type(),
            self.offset() + begin * stride,
            Ownership::View,
        ))
    }

    /// Creates a view with another shape of the same element count.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<NdArray, TensorError> {
        let shape: Shape = shape.into();
        LayoutDesc::from_shape(shape.clone(), self.data_type())?;
        if shape.count() != self.count() {
            return Err(TensorError::Reshape(self.shape().clone(), shape));
        }
        let ownership = match shape == *self.shape() {
            true => self.ownership(),
            false => Ownership::View,
        };
        Ok(self.derive(shape, self.data_type(), self.offset(), ownership))
    }

    /// Re-uses the array's bytes as an array of another shape and element type.
    ///
    /// With the same element type and count the result keeps seeing the storage's layouts;
    /// otherwise it is a reinterpreted view.
    pub fn as_array(
        &self,
        shape: impl Into<Shape>,
        r#type: DataType,
    ) -> Result<NdArray, TensorError> {
        let shape: Shape = shape.into();
        let desc = LayoutDesc::from_shape(shape.clone(), r#type)?;
        let size = desc.size();
        if size > self.size() || self.offset() % r#type.size() != 0 {
            return Err(TensorError::Cast(self.size(), size, self.offset()));
        }
        let ownership = match self.ownership() {
            Ownership::View => Ownership::View,
            Ownership::Owned | Ownership::Reused => Ownership::Reused,
        };
        Ok(self.derive(shape, r#type, self.offset(), ownership))
    }
}
