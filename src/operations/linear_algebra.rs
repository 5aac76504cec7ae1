use std::mem::size_of;

use tracing::debug;

use super::count_arg;
use super::reduction::{ReductionOp, ReductionOperation};
use crate::compute::{Buffer, Context, DeviceStrategy, Event, KernelArg, NdRange, Program, Queue};
use crate::error::{Error, Result};
use crate::kernels::{self, linear_algebra::ROW_THREADS};

/// First work-group width tried by the tiled kernel.
const TILE_WIDTH: usize = 64;

/// Matrix-vector products and dot products over square row-major `f64` data.
pub struct LinearAlgebraOperation<'a> {
    program: Program,
    reduction: ReductionOperation<'a>,
}

impl<'a> LinearAlgebraOperation<'a> {
    pub fn new(ctx: &'a Context) -> Result<Self> {
        Ok(Self {
            program: ctx.create_program(kernels::LINEAR_ALGEBRA)?,
            reduction: ReductionOperation::new(ctx)?,
        })
    }

    /// `result = matrix · vector` for an n×n matrix.
    pub fn mat_vec_mul(
        &self,
        queue: &Queue,
        matrix: &Buffer,
        vector: &Buffer,
        result: &Buffer,
        n: usize,
        wait_list: &[Event],
    ) -> Result<Event> {
        let strategy = DeviceStrategy::for_device(queue.device());
        debug!(device = queue.device().name(), ?strategy, n, "mat_vec_mul");

        match strategy {
            DeviceStrategy::Cpu => {
                let kernel = self.program.kernel("MatVecMulCPUKernel")?;
                queue.enqueue_kernel(
                    &kernel,
                    vec![matrix.into(), vector.into(), count_arg(n)?, result.into()],
                    NdRange::linear(n),
                    wait_list,
                )
            }
            DeviceStrategy::Gpu => {
                let (row_groups, width) = tiling(n);
                let kernel = self.program.kernel("MatVecMulGPUKernel")?;
                queue.enqueue_kernel(
                    &kernel,
                    vec![
                        matrix.into(),
                        vector.into(),
                        result.into(),
                        KernelArg::Local(width * ROW_THREADS * size_of::<f64>()),
                        count_arg(n)?,
                        count_arg(n)?,
                    ],
                    NdRange::grouped_2d([row_groups, ROW_THREADS], [width, ROW_THREADS]),
                    wait_list,
                )
            }
        }
    }

    /// `a · b` over `n` elements, using `scratch` for the elementwise products.
    /// `scratch` must be exactly `n` doubles.
    pub fn dot_product(
        &self,
        queue: &Queue,
        a: &Buffer,
        b: &Buffer,
        n: usize,
        scratch: &Buffer,
        wait_list: &[Event],
    ) -> Result<f64> {
        if scratch.size() != n * size_of::<f64>() {
            return Err(Error::Usage(format!(
                "dot product scratch must be exactly {} bytes, got {}",
                n * size_of::<f64>(),
                scratch.size()
            )));
        }

        let kernel = self.program.kernel("VecMul")?;
        queue.enqueue_kernel(
            &kernel,
            vec![a.into(), b.into(), scratch.into(), count_arg(n)?],
            NdRange::linear(n),
            wait_list,
        )?;

        self.reduction
            .reduce_double_on(queue, scratch, n, ReductionOp::Sum)
    }
}

/// Row count padded to a multiple of the row threads, and the largest width
/// (halving from 64) that divides it.
pub fn tiling(n: usize) -> (usize, usize) {
    let row_groups = n.div_ceil(ROW_THREADS).max(1) * ROW_THREADS;
    let mut width = TILE_WIDTH;
    while row_groups % width != 0 {
        width >>= 1;
    }
    (row_groups, width)
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::compute::test::mixed_platform;
    use crate::compute::MemAccess;

    fn upload(ctx: &Context, queue: &Queue, values: &[f64]) -> Buffer {
        let buffer = ctx.create_buffer(MemAccess::ReadOnly, values.len() * 8);
        queue
            .enqueue_write_buffer(&buffer, true, values, &[])
            .unwrap();
        buffer
    }

    #[test]
    fn tiling_widths() {
        assert_eq!(tiling(1), (8, 8));
        assert_eq!(tiling(8), (8, 8));
        assert_eq!(tiling(17), (24, 8));
        assert_eq!(tiling(33), (40, 8));
        assert_eq!(tiling(48), (48, 16));
        assert_eq!(tiling(101), (104, 8));
        assert_eq!(tiling(128), (128, 64));
    }

    #[test]
    fn mat_vec_mul_on_every_device() {
        let ctx = Context::with_platform(mixed_platform(), None).unwrap();
        let linalg = LinearAlgebraOperation::new(&ctx).unwrap();
        let mut rng = StdRng::seed_from_u64(11);

        for n in [1usize, 5, 31, 65] {
            let matrix = (0..n * n).map(|_| rng.gen_range(-1.0..1.0)).collect::<Vec<f64>>();
            let vector = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect::<Vec<f64>>();
            let expected = (0..n)
                .map(|r| (0..n).map(|c| matrix[r * n + c] * vector[c]).sum::<f64>())
                .collect::<Vec<_>>();

            for queue in ctx.queues() {
                let m = upload(&ctx, queue, &matrix);
                let v = upload(&ctx, queue, &vector);
                let out = ctx.create_buffer(MemAccess::ReadWrite, n * 8);
                let event = linalg.mat_vec_mul(queue, &m, &v, &out, n, &[]).unwrap();
                let result = queue.enqueue_read_buffer::<f64>(&out, &[event]).unwrap();
                for (got, want) in result.iter().zip(&expected) {
                    assert_relative_eq!(got, want, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn dot_product_on_every_device() {
        let ctx = Context::with_platform(mixed_platform(), None).unwrap();
        let linalg = LinearAlgebraOperation::new(&ctx).unwrap();
        let a = (0..300).map(|i| i as f64).collect::<Vec<_>>();
        let b = vec![2.0; 300];

        for queue in ctx.queues() {
            let a = upload(&ctx, queue, &a);
            let b = upload(&ctx, queue, &b);
            let scratch = ctx.create_buffer(MemAccess::ReadWrite, 300 * 8);
            let dot = linalg.dot_product(queue, &a, &b, 300, &scratch, &[]).unwrap();
            assert_eq!(dot, 89700.0);
        }
    }

    #[test]
    fn dot_product_scratch_size_is_checked_first() {
        let ctx = Context::with_platform(mixed_platform(), Some(1)).unwrap();
        let linalg = LinearAlgebraOperation::new(&ctx).unwrap();
        let queue = ctx.next_queue();
        let a = upload(&ctx, &queue, &[1.0, 2.0]);
        let scratch = ctx.create_buffer(MemAccess::ReadWrite, 3 * 8);
        assert!(matches!(
            linalg.dot_product(&queue, &a, &a, 2, &scratch, &[]),
            Err(Error::Usage(_))
        ));
    }
}
