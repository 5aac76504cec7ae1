use tracing::debug;

use crate::compute::{Buffer, Context, Event, NdRange, Program, Queue};
use crate::error::Result;
use crate::kernels;

pub use crate::kernels::buffers::Fill;

/// Sets the first `count` elements of a buffer to one value.
pub struct FillBufferOperation<'a> {
    ctx: &'a Context,
    program: Program,
}

impl<'a> FillBufferOperation<'a> {
    pub fn new(ctx: &'a Context) -> Result<Self> {
        Ok(Self {
            ctx,
            program: ctx.create_program(kernels::BUFFERS)?,
        })
    }

    pub fn fill<T: Fill>(&self, buffer: &Buffer, value: T, count: usize) -> Result<Event> {
        self.fill_on(&self.ctx.next_queue(), buffer, value, count, &[])
    }

    pub fn fill_on<T: Fill>(
        &self,
        queue: &Queue,
        buffer: &Buffer,
        value: T,
        count: usize,
        wait_list: &[Event],
    ) -> Result<Event> {
        let kernel = self.program.kernel(T::KERNEL)?;
        debug!(device = queue.device().name(), kernel = T::KERNEL, count, "fill");
        queue.enqueue_kernel(
            &kernel,
            vec![buffer.into(), value.into()],
            NdRange::linear(count),
            wait_list,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compute::test::mixed_platform;
    use crate::compute::MemAccess;

    #[test]
    fn fills_prefix_of_each_type() {
        let ctx = Context::with_platform(mixed_platform(), None).unwrap();
        let fill = FillBufferOperation::new(&ctx).unwrap();
        let queue = ctx.next_queue();

        let doubles = ctx.create_buffer(MemAccess::ReadWrite, 4 * 8);
        let floats = ctx.create_buffer(MemAccess::ReadWrite, 4 * 4);
        let ints = ctx.create_buffer(MemAccess::WriteOnly, 4 * 4);

        let events = vec![
            fill.fill_on(&queue, &doubles, 1.5f64, 3, &[]).unwrap(),
            fill.fill(&floats, -2.0f32, 4).unwrap(),
            fill.fill(&ints, 7i32, 1).unwrap(),
        ];
        Event::wait_all(&events).unwrap();

        assert_eq!(
            queue.enqueue_read_buffer::<f64>(&doubles, &[]).unwrap(),
            vec![1.5, 1.5, 1.5, 0.0]
        );
        assert_eq!(
            queue.enqueue_read_buffer::<f32>(&floats, &[]).unwrap(),
            vec![-2.0; 4]
        );
        assert_eq!(
            queue.enqueue_read_buffer::<i32>(&ints, &[]).unwrap(),
            vec![7, 0, 0, 0]
        );
    }

    #[test]
    fn read_only_buffers_cannot_be_filled() {
        let ctx = Context::with_platform(mixed_platform(), Some(1)).unwrap();
        let fill = FillBufferOperation::new(&ctx).unwrap();
        let buffer = ctx.create_buffer(MemAccess::ReadOnly, 8);
        assert!(fill.fill(&buffer, 0.0f64, 1).is_err());
    }
}
