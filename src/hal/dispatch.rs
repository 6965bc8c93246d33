//! Selection between the optimized-layout path and the canonical fallback.

use derive_more::Display;

use super::ops::{AddOp, BinaryOp};
use crate::loom::{
    layout::LayoutDesc,
    memory::Memory,
    num::DataType,
    tensor::{NdArray, TensorError},
};

/// The layout a kernel needs one of its inputs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelRequirement {
    Canonical,
    Any,
    Layout(LayoutDesc),
}

/// `Optimized < Fallback`: [`Ord::max`] keeps the optimized path only if both sides agree.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComputePath {
    Optimized,
    Fallback,
}

impl ComputePath {
    /// The optimized path if every array supports it.
    pub fn select(arrays: &[&NdArray]) -> Self {
        match arrays.iter().all(|array| array.supports_optimized()) {
            true => ComputePath::Optimized,
            false => ComputePath::Fallback,
        }
    }
}

/// Returns the input's memory as the kernel requires it. Does not block.
pub fn resolve_input(
    array: &NdArray,
    requirement: &KernelRequirement,
) -> Result<Memory, TensorError> {
    match requirement {
        KernelRequirement::Canonical => array.get_reordered_data(&array.default_desc()?),
        KernelRequirement::Any => array.get_layout_data(),
        KernelRequirement::Layout(desc) => array.get_reordered_data(desc),
    }
}

fn check_context(arrays: &[&NdArray]) -> Result<(), TensorError> {
    match arrays.windows(2).all(|pair| pair[0].context() == pair[1].context()) {
        true => Ok(()),
        false => Err(TensorError::Context),
    }
}

/// Computes `out = a + b`, on the optimized path if requested and supported by all three
/// arrays. Returns the path taken. Does not block.
pub fn elemwise_add(
    a: &NdArray,
    b: &NdArray,
    out: &NdArray,
    path: ComputePath,
) -> Result<ComputePath, TensorError> {
    check_context(&[a, b, out])?;
    if !a.data_type().is_float() {
        return Err(TensorError::Type(a.data_type(), DataType::F32));
    }
    for x in [b, out] {
        if x.data_type() != a.data_type() {
            return Err(TensorError::Type(x.data_type(), a.data_type()));
        }
        if x.count() != a.count() {
            return Err(TensorError::ShapeMismatch(x.shape().clone(), a.count()));
        }
    }

    let fallback = a.default_desc()?;
    let (path, desc) = match path.max(ComputePath::select(&[a, b, out])) {
        ComputePath::Optimized => {
            // the first input's layout drives the kernel, unless it holds padding
            let desc = a.get_layout_data()?.desc().clone();
            match desc.count() == a.count() && desc.dims() == a.shape() {
                true => (ComputePath::Optimized, desc),
                false => (ComputePath::Fallback, fallback),
            }
        }
        ComputePath::Fallback => (ComputePath::Fallback, fallback),
    };
    log::trace!("elemwise_add: {path} path in {desc}");

    let requirement = KernelRequirement::Layout(desc.clone());
    let inputs = [resolve_input(a, &requirement)?, resolve_input(b, &requirement)?];
    let output = out.prepare_output(&desc, &[a, b])?;
    let op = BinaryOp {
        inputs,
        output: output.memory().clone(),
    };
    let ticket = match a.data_type() {
        DataType::F32 => out.context().enqueue(AddOp::<f32>::from(op)),
        _ => out.context().enqueue(AddOp::<half::f16>::from(op)),
    };
    out.commit_output(output, ticket)?;
    Ok(path)
}

/// Copies `src` into `dst`. The optimized path hands over `src` in its current layout,
/// the fallback goes through the canonical layout. Does not block.
pub fn copy(src: &NdArray, dst: &NdArray, path: ComputePath) -> Result<ComputePath, TensorError> {
    check_context(&[src, dst])?;
    let (path, requirement) = match path.max(ComputePath::select(&[src, dst])) {
        ComputePath::Optimized => (ComputePath::Optimized, KernelRequirement::Any),
        ComputePath::Fallback => (ComputePath::Fallback, KernelRequirement::Canonical),
    };
    let memory = resolve_input(src, &requirement)?;
    dst.copy_from(&memory)?;
    Ok(path)
}
