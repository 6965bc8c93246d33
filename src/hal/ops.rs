use std::marker::PhantomData;

use crate::loom::{
    memory::Memory,
    ops::{Access, TensorIr},
};

/// Two inputs and one output, all in the same layout.
#[derive(Debug, Clone)]
pub struct BinaryOp {
    pub inputs: [Memory; 2],
    pub output: Memory,
}

impl BinaryOp {
    pub fn io(&self) -> Vec<TensorIr> {
        vec![
            self.inputs[0].ir(Access::ReadOnly),
            self.inputs[1].ir(Access::ReadOnly),
            self.output.ir(Access::WriteOnly),
        ]
    }
}

/// Element-wise sum over physical elements.
#[derive(Debug, Clone)]
pub struct AddOp<T> {
    pub op: BinaryOp,
    pub phantom: PhantomData<T>,
}

impl<T> From<BinaryOp> for AddOp<T> {
    fn from(value: BinaryOp) -> Self {
        Self {
            op: value,
            phantom: PhantomData,
        }
    }
}
