use tracing::debug;

use super::count_arg;
use crate::compute::{Buffer, Context, Event, NdRange, Program, Queue};
use crate::error::Result;
use crate::kernels;

/// All-pairs planar distances, one dense n×n `f32` pass.
pub struct DistancesMatrixOperation<'a> {
    ctx: &'a Context,
    program: Program,
}

impl<'a> DistancesMatrixOperation<'a> {
    pub fn new(ctx: &'a Context) -> Result<Self> {
        Ok(Self {
            ctx,
            program: ctx.create_program(kernels::DISTANCES_MATRIX)?,
        })
    }

    pub fn compute_matrix(&self, points: &Buffer, n: usize, result: &Buffer) -> Result<Event> {
        self.compute_matrix_on(&self.ctx.next_queue(), points, n, result, &[])
    }

    pub fn compute_matrix_on(
        &self,
        queue: &Queue,
        points: &Buffer,
        n: usize,
        result: &Buffer,
        wait_list: &[Event],
    ) -> Result<Event> {
        debug!(device = queue.device().name(), n, "distances matrix");
        let kernel = self.program.kernel("DistancesMatrixKernel")?;
        queue.enqueue_kernel(
            &kernel,
            vec![points.into(), count_arg(n)?, result.into()],
            NdRange::linear(n),
            wait_list,
        )
    }
}
