//! Pooling operator glue: parameters, shape and type inference, and the forward and
//! backward shims choosing between the optimized path and the canonical fallback.
//!
//! Max-like pooling on the optimized path records a workspace as a second output, which
//! backward then expects among its inputs:
//!
//! | path                  | outputs                 | backward inputs                                      |
//! |-----------------------|-------------------------|------------------------------------------------------|
//! | with workspace        | `output`, `workspace`   | `out_grad`, `workspace grad`, `in_data`, `output`, `workspace` |
//! | without workspace     | `output`                | `out_grad`, `in_data`, `output`                      |

use derive_more::Display;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::dispatch::{ComputePath, KernelRequirement, resolve_input};
use crate::loom::{
    layout::Shape,
    memory::Memory,
    num::DataType,
    ops::TensorOp,
    tensor::{NdArray, OutputMemory, TensorError},
};

#[derive(Debug, Error)]
pub enum PoolingError {
    #[error("pooling error: {0}-D pooling is not supported")]
    KernelRank(usize),
    #[error("pooling error: {0} has {1} dimensions, expected {2}")]
    ParamRank(&'static str, usize, usize),
    #[error("pooling error: stride {0} contains zero")]
    ZeroStride(Shape),
    #[error("pooling error: input should be 3-D to 5-D, found {0}")]
    InputRank(Shape),
    #[error("pooling error: {0}-D kernel expects {1}-D input, found {2}")]
    KernelInput(usize, usize, Shape),
    #[error("pooling error: kernel size ({0}) exceeds input ({1} padded to {2})")]
    KernelSize(usize, usize, usize),
    #[error("pooling error: expected {0} {1}, found {2}")]
    Arity(usize, &'static str, usize),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PoolType {
    #[default]
    Max,
    Avg,
    Sum,
}

/// How output sizes are rounded.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PoolingConvention {
    /// `floor((x + 2p - k) / s) + 1`
    #[default]
    Valid,
    /// `ceil((x + 2p - k) / s) + 1`
    Full,
}

/// Which compute function the operator is dispatched to.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchMode {
    /// Canonical arrays only.
    Compute,
    /// Arrays in any layout; may still fall back per invocation.
    ComputeEx,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolingParam {
    pub kernel: Vec<usize>,
    pub stride: Vec<usize>,
    pub pad: Vec<usize>,
    pub pool_type: PoolType,
    pub pooling_convention: PoolingConvention,
    pub global_pool: bool,
}

impl PoolingParam {
    pub fn new(kernel: impl Into<Vec<usize>>, pool_type: PoolType) -> Self {
        Self {
            kernel: kernel.into(),
            pool_type,
            ..Default::default()
        }
    }

    /// Validates the parameters and fills in the default stride and padding.
    pub fn parse(mut self) -> Result<Self, PoolingError> {
        let rank = match self.kernel.len() {
            rank @ (1 | 2) => rank,
            3 => 3,
            // the kernel is ignored by global pooling
            _ if self.global_pool => 3,
            rank => return Err(PoolingError::KernelRank(rank)),
        };
        if self.stride.is_empty() {
            self.stride = vec![1; rank];
        }
        if self.pad.is_empty() {
            self.pad = vec![0; rank];
        }
        if !self.global_pool {
            if self.stride.len() != rank {
                return Err(PoolingError::ParamRank("stride", self.stride.len(), rank));
            }
            if self.pad.len() != rank {
                return Err(PoolingError::ParamRank("pad", self.pad.len(), rank));
            }
        }
        if self.stride.contains(&0) {
            return Err(PoolingError::ZeroStride(self.stride.clone().into()));
        }
        Ok(self)
    }

    /// Returns `true` if the optimized kernels cover these parameters.
    #[inline]
    pub fn supports_optimized(&self) -> bool {
        self.kernel.len() == 2 && matches!(self.pool_type, PoolType::Max | PoolType::Avg)
    }

    /// Returns `true` if the optimized kernels cover these parameters on `input`.
    ///
    /// Under the full convention only inputs where full and valid agree qualify.
    pub fn supports_optimized_for(&self, input: &Shape) -> bool {
        if !self.supports_optimized() || input.len() != 4 {
            return false;
        }
        if self.global_pool || self.pooling_convention == PoolingConvention::Valid {
            return true;
        }
        (0..2).all(|i| {
            let padded = input[i + 2] + 2 * self.pad[i];
            padded >= self.kernel[i] && (padded - self.kernel[i]) % self.stride[i] == 0
        })
    }

    /// Max-like pooling records where each output came from.
    #[inline]
    pub fn requires_workspace(&self) -> bool {
        self.pool_type != PoolType::Avg
    }

    #[inline]
    fn has_workspace(&self) -> bool {
        self.requires_workspace() && self.supports_optimized()
    }

    #[inline]
    pub fn num_outputs(&self) -> usize {
        match self.has_workspace() {
            true => 2,
            false => 1,
        }
    }

    /// The workspace is never visible to callers.
    #[inline]
    pub fn num_visible_outputs(&self) -> usize {
        1
    }

    #[inline]
    pub fn num_backward_inputs(&self) -> usize {
        match self.has_workspace() {
            true => 5,
            false => 3,
        }
    }

    pub fn output_names(&self) -> Vec<&'static str> {
        match self.has_workspace() {
            true => vec!["output", "workspace"],
            false => vec!["output"],
        }
    }

    /// Shapes of all outputs for an input of shape `input`.
    pub fn infer_shape(&self, input: &Shape) -> Result<Vec<Shape>, PoolingError> {
        if !(3..=5).contains(&input.len()) {
            return Err(PoolingError::InputRank(input.clone()));
        }

        let mut output = input.to_vec();
        if self.global_pool {
            output[2..].fill(1);
        } else {
            let rank = self.kernel.len();
            if input.len() != rank + 2 {
                return Err(PoolingError::KernelInput(rank, rank + 2, input.clone()));
            }
            for (i, (&kernel, &stride, &pad)) in
                itertools::izip!(&self.kernel, &self.stride, &self.pad).enumerate()
            {
                let padded = input[i + 2] + 2 * pad;
                if kernel > padded {
                    return Err(PoolingError::KernelSize(kernel, input[i + 2], padded));
                }
                output[i + 2] = 1 + match self.pooling_convention {
                    PoolingConvention::Valid => (padded - kernel) / stride,
                    PoolingConvention::Full => (padded - kernel).div_ceil(stride),
                };
            }
        }

        let output: Shape = output.into();
        Ok(vec![output; self.num_outputs()])
    }

    /// Element types of all outputs. The workspace holds indices.
    pub fn infer_type(&self, input: DataType) -> Vec<DataType> {
        [input, DataType::I32]
            .into_iter()
            .take(self.num_outputs())
            .collect()
    }

    pub fn storage_dispatch(&self) -> DispatchMode {
        match self.supports_optimized() {
            true => DispatchMode::ComputeEx,
            false => DispatchMode::Compute,
        }
    }

    pub fn backward_storage_dispatch(&self, num_inputs: usize) -> Result<DispatchMode, PoolingError> {
        let expected = self.num_backward_inputs();
        if num_inputs != expected {
            return Err(PoolingError::Arity(expected, "backward inputs", num_inputs));
        }
        Ok(self.storage_dispatch())
    }

    fn path(&self, array: &NdArray) -> ComputePath {
        match array.supports_optimized() && self.supports_optimized_for(array.shape()) {
            true => ComputePath::Optimized,
            false => ComputePath::Fallback,
        }
    }
}

/// Backward inputs by role.
#[derive(Debug, Clone, Copy)]
pub struct BackwardInputs<'a, T> {
    pub out_grad: &'a T,
    pub in_data: &'a T,
    pub out_data: &'a T,
    pub workspace: Option<&'a T>,
}

impl<'a, T> BackwardInputs<'a, T> {
    pub fn split(param: &PoolingParam, inputs: &'a [T]) -> Result<Self, PoolingError> {
        let expected = param.num_backward_inputs();
        if inputs.len() != expected {
            return Err(PoolingError::Arity(expected, "backward inputs", inputs.len()));
        }
        Ok(match param.has_workspace() {
            true => Self {
                out_grad: &inputs[0],
                in_data: &inputs[2],
                out_data: &inputs[3],
                workspace: Some(&inputs[4]),
            },
            false => Self {
                out_grad: &inputs[0],
                in_data: &inputs[1],
                out_data: &inputs[2],
                workspace: None,
            },
        })
    }
}

/// Memories handed to a forward kernel.
#[derive(Debug, Clone)]
pub struct PoolingForward {
    pub path: ComputePath,
    pub input: Memory,
    pub output: Memory,
    /// Only on the optimized path, and only if the parameters require one.
    pub workspace: Option<Memory>,
}

/// Memories handed to a backward kernel.
#[derive(Debug, Clone)]
pub struct PoolingBackward {
    pub path: ComputePath,
    pub out_grad: Memory,
    pub in_data: Memory,
    pub out_data: Memory,
    pub workspace: Option<Memory>,
    pub in_grad: Memory,
    /// Zeroed scratch of the size of `in_grad`, alive until the stream is cleaned up.
    pub scratch: Memory,
}

/// Builds the ops computing pooling.
pub trait PoolingKernel {
    type Forward: TensorOp;
    type Backward: TensorOp;

    fn forward(&self, param: &PoolingParam, io: PoolingForward) -> Self::Forward;

    fn backward(&self, param: &PoolingParam, io: PoolingBackward) -> Self::Backward;
}

fn requirement(path: ComputePath) -> KernelRequirement {
    match path {
        ComputePath::Optimized => KernelRequirement::Any,
        ComputePath::Fallback => KernelRequirement::Canonical,
    }
}

fn prepare(array: &NdArray, inputs: &[&NdArray]) -> Result<OutputMemory, TensorError> {
    array.prepare_output(&array.default_desc()?, inputs)
}

/// Enqueues forward pooling of `input` into `outputs`. Returns the path taken.
pub fn pooling_forward<K: PoolingKernel>(
    kernel: &K,
    param: &PoolingParam,
    input: &NdArray,
    outputs: &[NdArray],
) -> Result<ComputePath, PoolingError> {
    if outputs.len() != param.num_outputs() {
        return Err(PoolingError::Arity(param.num_outputs(), "outputs", outputs.len()));
    }
    let shapes = param.infer_shape(input.shape())?;
    for (output, shape) in outputs.iter().zip_eq(shapes) {
        if *output.shape() != shape {
            let err = TensorError::ShapeMismatch(output.shape().clone(), shape.count());
            return Err(err.into());
        }
    }

    let path = param.path(input);
    log::trace!("pooling forward: {path} path");
    let memory = resolve_input(input, &requirement(path))?;
    let output = prepare(&outputs[0], &[input])?;
    let workspace = match (path, outputs.get(1)) {
        (ComputePath::Optimized, Some(workspace)) => Some(prepare(workspace, &[input])?),
        _ => None,
    };

    let io = PoolingForward {
        path,
        input: memory,
        output: output.memory().clone(),
        workspace: workspace.as_ref().map(|workspace| workspace.memory().clone()),
    };
    let ticket = input.context().enqueue(kernel.forward(param, io));
    outputs[0].commit_output(output, ticket.clone())?;
    if let Some(workspace) = workspace {
        outputs[1].commit_output(workspace, ticket)?;
    }
    Ok(path)
}

/// Enqueues backward pooling into `in_grad`. Returns the path taken.
pub fn pooling_backward<K: PoolingKernel>(
    kernel: &K,
    param: &PoolingParam,
    inputs: &[NdArray],
    in_grad: &NdArray,
) -> Result<ComputePath, PoolingError> {
    let BackwardInputs {
        out_grad,
        in_data,
        out_data,
        workspace,
    } = BackwardInputs::split(param, inputs)?;
    if in_grad.shape() != in_data.shape() {
        let err = TensorError::ShapeMismatch(in_grad.shape().clone(), in_data.count());
        return Err(err.into());
    }

    let path = param.path(out_grad);
    log::trace!("pooling backward: {path} path");
    let requirement = requirement(path);
    let workspace = match path {
        ComputePath::Optimized => workspace.map(|x| resolve_input(x, &requirement)).transpose()?,
        ComputePath::Fallback => None,
    };
    let out_grad_memory = resolve_input(out_grad, &requirement)?;
    let in_data_memory = resolve_input(in_data, &requirement)?;
    let out_data_memory = resolve_input(out_data, &requirement)?;

    let sources = inputs.iter().collect_vec();
    let output = prepare(in_grad, &sources)?;
    let scratch = in_grad.context().scratch(in_grad.default_desc()?);

    let io = PoolingBackward {
        path,
        out_grad: out_grad_memory,
        in_data: in_data_memory,
        out_data: out_data_memory,
        workspace,
        in_grad: output.memory().clone(),
        scratch,
    };
    let ticket = in_grad.context().enqueue(kernel.backward(param, io));
    in_grad.commit_output(output, ticket)?;
    Ok(path)
}
