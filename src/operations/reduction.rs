use std::mem::size_of;

use tracing::debug;

use crate::compute::{
    Buffer, Context, DeviceStrategy, KernelArg, MemAccess, NdRange, Program, Queue,
};
use crate::error::{Error, Result};
use crate::kernels::{self, reduction::fold};
use crate::point::Point;

pub use crate::kernels::reduction::{ReductionOp, Reducible};

/// Largest work-group the two-stage strategy launches.
pub const MAX_GROUP_SIZE: usize = 256;

/// Min, Max or Sum over a device buffer.
///
/// CPU-class devices fold one block per compute unit; GPU-class devices run
/// `4 × compute units` items in work-groups that tree-reduce in local memory.
/// Either way the device partials are combined sequentially on the host, so
/// floating point sums depend on the device and buffer size.
pub struct ReductionOperation<'a> {
    ctx: &'a Context,
    program: Program,
}

impl<'a> ReductionOperation<'a> {
    pub fn new(ctx: &'a Context) -> Result<Self> {
        Ok(Self {
            ctx,
            program: ctx.create_program(kernels::REDUCTION)?,
        })
    }

    pub fn reduce(&self, buffer: &Buffer, count: usize, op: ReductionOp) -> Result<f32> {
        self.reduce_on(&self.ctx.next_queue(), buffer, count, op)
    }

    pub fn reduce_on(
        &self,
        queue: &Queue,
        buffer: &Buffer,
        count: usize,
        op: ReductionOp,
    ) -> Result<f32> {
        self.run(queue, buffer, count, op)
    }

    pub fn reduce_double(&self, buffer: &Buffer, count: usize, op: ReductionOp) -> Result<f64> {
        self.reduce_double_on(&self.ctx.next_queue(), buffer, count, op)
    }

    pub fn reduce_double_on(
        &self,
        queue: &Queue,
        buffer: &Buffer,
        count: usize,
        op: ReductionOp,
    ) -> Result<f64> {
        self.run(queue, buffer, count, op)
    }

    pub fn reduce_points(&self, buffer: &Buffer, count: usize, op: ReductionOp) -> Result<Point> {
        self.reduce_points_on(&self.ctx.next_queue(), buffer, count, op)
    }

    pub fn reduce_points_on(
        &self,
        queue: &Queue,
        buffer: &Buffer,
        count: usize,
        op: ReductionOp,
    ) -> Result<Point> {
        self.run(queue, buffer, count, op)
    }

    fn run<T: Reducible>(
        &self,
        queue: &Queue,
        buffer: &Buffer,
        count: usize,
        op: ReductionOp,
    ) -> Result<T> {
        let available = buffer.len_of::<T>()?;
        if count > available {
            return Err(Error::DeviceRuntime(format!(
                "reduction over {} elements of a buffer holding {}",
                count, available
            )));
        }
        if count == 0 {
            return Ok(T::neutral(op));
        }

        let strategy = DeviceStrategy::for_device(queue.device());
        debug!(
            device = queue.device().name(),
            ?strategy,
            ?op,
            count,
            "reduce"
        );

        let partials = match strategy {
            DeviceStrategy::Cpu => self.reduce_blocks::<T>(queue, buffer, count, op)?,
            DeviceStrategy::Gpu => self.reduce_groups::<T>(queue, buffer, count, op)?,
        };

        Ok(fold(op, &partials))
    }

    fn reduce_blocks<T: Reducible>(
        &self,
        queue: &Queue,
        buffer: &Buffer,
        count: usize,
        op: ReductionOp,
    ) -> Result<Vec<T>> {
        let blocks = queue.device().compute_units().min(count);
        let block_size = count.div_ceil(blocks);
        let result = self
            .ctx
            .create_buffer(MemAccess::WriteOnly, blocks * size_of::<T>());

        let kernel = self.program.kernel(T::BLOCK_KERNEL)?;
        let event = queue.enqueue_kernel(
            &kernel,
            vec![
                buffer.into(),
                super::count_arg(block_size)?,
                super::count_arg(count)?,
                (&result).into(),
                (op as i32).into(),
            ],
            NdRange::linear(blocks),
            &[],
        )?;

        let partials = queue.enqueue_read_buffer::<T>(&result, &[event.clone()])?;
        self.ctx
            .record_event(&["reduce_total", "reduce_cpu"], &event)?;
        Ok(partials)
    }

    fn reduce_groups<T: Reducible>(
        &self,
        queue: &Queue,
        buffer: &Buffer,
        count: usize,
        op: ReductionOp,
    ) -> Result<Vec<T>> {
        let info = queue.device().info();
        let (items, group_size) = group_sizing(info.compute_units, info.max_work_group_size);
        let groups = items / group_size;
        let result = self
            .ctx
            .create_buffer(MemAccess::WriteOnly, groups * size_of::<T>());

        let kernel = self.program.kernel(T::GROUP_KERNEL)?;
        let event = queue.enqueue_kernel(
            &kernel,
            vec![
                buffer.into(),
                KernelArg::Local(group_size * size_of::<T>()),
                super::count_arg(count)?,
                (&result).into(),
                (op as i32).into(),
            ],
            NdRange::grouped(items, group_size),
            &[],
        )?;

        let partials = queue.enqueue_read_buffer::<T>(&result, &[event.clone()])?;
        self.ctx
            .record_event(&["reduce_total", "reduce_gpu"], &event)?;
        Ok(partials)
    }
}

/// Work items and work-group size of the two-stage strategy: `4 × units` items
/// in groups of at most [`MAX_GROUP_SIZE`], rounded up to whole groups.
pub fn group_sizing(compute_units: usize, max_work_group_size: usize) -> (usize, usize) {
    let items = 4 * compute_units.max(1);
    let group_size = items.min(MAX_GROUP_SIZE).min(max_work_group_size).max(1);
    (items.div_ceil(group_size) * group_size, group_size)
}
