use bytemuck::Pod;
use rayon::prelude::*;

use crate::compute::program::{KernelDef, Launch, Param};
use crate::error::{Error, Result};
use crate::point::Point;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ReductionOp {
    Min = 0,
    Max = 1,
    Sum = 2,
}

impl TryFrom<i32> for ReductionOp {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(ReductionOp::Min),
            1 => Ok(ReductionOp::Max),
            2 => Ok(ReductionOp::Sum),
            other => Err(Error::DeviceRuntime(format!(
                "unknown reduction opcode {}",
                other
            ))),
        }
    }
}

/// Element type the reduction kernels can combine.
pub trait Reducible: Pod + Send + Sync {
    /// Coarse-block kernel name.
    const BLOCK_KERNEL: &'static str;
    /// Two-stage work-group kernel name.
    const GROUP_KERNEL: &'static str;

    fn neutral(op: ReductionOp) -> Self;
    fn combine(op: ReductionOp, a: Self, b: Self) -> Self;
}

impl Reducible for f32 {
    const BLOCK_KERNEL: &'static str = "ReduceKernel";
    const GROUP_KERNEL: &'static str = "TwoStageReduceKernel";

    fn neutral(op: ReductionOp) -> Self {
        match op {
            ReductionOp::Min => f32::MAX,
            ReductionOp::Max => -f32::MAX,
            ReductionOp::Sum => 0.0,
        }
    }

    #[inline(always)]
    fn combine(op: ReductionOp, a: Self, b: Self) -> Self {
        match op {
            ReductionOp::Min => a.min(b),
            ReductionOp::Max => a.max(b),
            ReductionOp::Sum => a + b,
        }
    }
}

impl Reducible for f64 {
    const BLOCK_KERNEL: &'static str = "ReduceDoubleKernel";
    const GROUP_KERNEL: &'static str = "TwoStageReduceDoubleKernel";

    fn neutral(op: ReductionOp) -> Self {
        match op {
            ReductionOp::Min => f64::MAX,
            ReductionOp::Max => -f64::MAX,
            ReductionOp::Sum => 0.0,
        }
    }

    #[inline(always)]
    fn combine(op: ReductionOp, a: Self, b: Self) -> Self {
        match op {
            ReductionOp::Min => a.min(b),
            ReductionOp::Max => a.max(b),
            ReductionOp::Sum => a + b,
        }
    }
}

// each axis reduced independently
impl Reducible for Point {
    const BLOCK_KERNEL: &'static str = "ReducePointsKernel";
    const GROUP_KERNEL: &'static str = "TwoStageReducePointKernel";

    fn neutral(op: ReductionOp) -> Self {
        let v = f32::neutral(op);
        Point::new(v, v, v)
    }

    #[inline(always)]
    fn combine(op: ReductionOp, a: Self, b: Self) -> Self {
        Point::new(
            f32::combine(op, a.x, b.x),
            f32::combine(op, a.y, b.y),
            f32::combine(op, a.z, b.z),
        )
    }
}

pub(crate) fn fold<T: Reducible>(op: ReductionOp, values: &[T]) -> T {
    values
        .iter()
        .fold(T::neutral(op), |acc, &v| T::combine(op, acc, v))
}

const BLOCK_PARAMS: &[Param] = &[
    Param::Input,
    Param::Int,
    Param::Int,
    Param::Output,
    Param::Int,
];

const GROUP_PARAMS: &[Param] = &[
    Param::Input,
    Param::Local,
    Param::Int,
    Param::Output,
    Param::Int,
];

pub const KERNELS: &[KernelDef] = &[
    KernelDef {
        name: <f32 as Reducible>::BLOCK_KERNEL,
        params: BLOCK_PARAMS,
        body: reduce_blocks::<f32>,
    },
    KernelDef {
        name: <f32 as Reducible>::GROUP_KERNEL,
        params: GROUP_PARAMS,
        body: reduce_groups::<f32>,
    },
    KernelDef {
        name: <f64 as Reducible>::BLOCK_KERNEL,
        params: BLOCK_PARAMS,
        body: reduce_blocks::<f64>,
    },
    KernelDef {
        name: <f64 as Reducible>::GROUP_KERNEL,
        params: GROUP_PARAMS,
        body: reduce_groups::<f64>,
    },
    KernelDef {
        name: <Point as Reducible>::BLOCK_KERNEL,
        params: BLOCK_PARAMS,
        body: reduce_blocks::<Point>,
    },
    KernelDef {
        name: <Point as Reducible>::GROUP_KERNEL,
        params: GROUP_PARAMS,
        body: reduce_groups::<Point>,
    },
];

/// `(buffer, blockSize, count, result, op)`: work item `i` folds
/// `buffer[i * blockSize..(i + 1) * blockSize]`, clipped to `count`.
fn reduce_blocks<T: Reducible>(launch: &Launch<'_>) -> Result<()> {
    let block_size = launch.count(1)?;
    let count = launch.count(2)?;
    let op = ReductionOp::try_from(launch.int(4)?)?;
    let items = launch.range.global_size();

    let input = launch.read::<T>(0)?;
    let mut result = launch.write::<T>(3)?;
    launch.check_bounds("input", count, input.len())?;
    launch.check_bounds("result", items, result.len())?;

    result[..items]
        .par_iter_mut()
        .enumerate()
        .for_each(|(item, partial)| {
            let start = (item * block_size).min(count);
            let end = (start + block_size).min(count);
            *partial = fold(op, &input[start..end]);
        });

    Ok(())
}

/// `(buffer, scratch, count, result, op)`: each item strides over the input
/// by the global size, then every work-group tree-reduces its items in local
/// memory and item 0 writes the group's partial to `result[group]`.
fn reduce_groups<T: Reducible>(launch: &Launch<'_>) -> Result<()> {
    let count = launch.count(2)?;
    let op = ReductionOp::try_from(launch.int(4)?)?;
    let global = launch.range.global_size();
    let local = launch.range.local_size()[0];
    let groups = launch.range.group_count()[0];

    let input = launch.read::<T>(0)?;
    let mut result = launch.write::<T>(3)?;
    launch.check_bounds("input", count, input.len())?;
    launch.check_bounds("result", groups, result.len())?;
    launch.check_bounds("local scratch", local, launch.local_len::<T>(1)?)?;

    result[..groups]
        .par_iter_mut()
        .enumerate()
        .for_each(|(group, partial)| {
            let mut scratch = vec![T::neutral(op); local];

            for (lid, slot) in scratch.iter_mut().enumerate() {
                let mut acc = T::neutral(op);
                let mut i = group * local + lid;
                while i < count {
                    acc = T::combine(op, acc, input[i]);
                    i += global;
                }
                *slot = acc;
            }

            //tree reduction, odd sizes carry their middle element forward
            let mut active = local;
            while active > 1 {
                let half = (active + 1) / 2;
                for lid in 0..active - half {
                    scratch[lid] = T::combine(op, scratch[lid], scratch[lid + half]);
                }
                active = half;
            }

            *partial = scratch[0];
        });

    Ok(())
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn opcodes() {
        assert_eq!(ReductionOp::try_from(0).unwrap(), ReductionOp::Min);
        assert_eq!(ReductionOp::try_from(2).unwrap(), ReductionOp::Sum);
        assert_eq!(ReductionOp::Max as i32, 1);
        assert!(ReductionOp::try_from(3).is_err());
    }

    #[test]
    fn neutral_elements() {
        assert_eq!(fold::<f32>(ReductionOp::Min, &[]), f32::MAX);
        assert_eq!(fold::<f64>(ReductionOp::Max, &[]), -f64::MAX);
        assert_eq!(fold::<f64>(ReductionOp::Sum, &[]), 0.0);
        assert_eq!(
            fold(ReductionOp::Max, &[-1e30f32, -2e30]),
            -1e30,
            "max of large negatives must not be clamped by the neutral value"
        );
    }

    #[test]
    fn points_reduce_per_axis() {
        let points = [
            Point::new(1.0, 5.0, -2.0),
            Point::new(3.0, -1.0, 4.0),
            Point::new(2.0, 0.0, 0.5),
        ];
        assert_eq!(fold(ReductionOp::Min, &points), Point::new(1.0, -1.0, -2.0));
        assert_eq!(fold(ReductionOp::Max, &points), Point::new(3.0, 5.0, 4.0));
        let sum = fold(ReductionOp::Sum, &points);
        assert_relative_eq!(sum.x, 6.0);
        assert_relative_eq!(sum.z, 2.5);
    }
}
