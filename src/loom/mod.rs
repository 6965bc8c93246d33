//! The `loom` module holds the layout-aware array core.
//!
//! ## Key Components
//! 1. **Layouts**: [`LayoutDesc`](layout::LayoutDesc) pairs logical dimensions with a
//!    physical [`Format`](layout::Format), canonical row-major or blocked vendor layouts.
//!
//! 2. **Engine**: a dedicated thread executing batches of [`TensorOp`](ops::TensorOp)s in
//!    order. Completion is observed through [`Ticket`](device::Ticket)s.
//!
//! 3. **Streams**: a [`SubmissionStream`](stream::SubmissionStream) accumulates ops and
//!    hands them to the engine in batches. A [`Context`](stream::Context) pairs the two.
//!
//! 4. **Arrays**: an [`NdArray`](tensor::NdArray) is a logical view over a shared storage
//!    that may additionally hold a shadow in an optimized layout. Conversions between
//!    layouts are planned lazily, cached per content and executed by the engine.

pub mod device;
pub mod layout;
pub mod memory;
pub mod num;
pub mod ops;
pub mod platform;
pub mod reorder;
pub mod slice;
pub mod stream;
pub mod tensor;
