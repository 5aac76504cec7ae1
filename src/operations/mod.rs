//! Host orchestration of device code: each operation owns its built program
//! and borrows the [`Context`](crate::compute::Context) for queues, buffers and profiling.

pub mod distances_matrix;
pub mod fill_buffer;
pub mod linear_algebra;
pub mod reduction;

pub use distances_matrix::DistancesMatrixOperation;
pub use fill_buffer::FillBufferOperation;
pub use linear_algebra::LinearAlgebraOperation;
pub use reduction::{ReductionOp, ReductionOperation};

use crate::compute::KernelArg;
use crate::error::{Error, Result};

/// Element count as a kernel `int` argument.
pub(crate) fn count_arg(count: usize) -> Result<KernelArg> {
    i32::try_from(count)
        .map(KernelArg::Int)
        .map_err(|_| Error::Usage(format!("{} elements exceed the kernel int range", count)))
}
