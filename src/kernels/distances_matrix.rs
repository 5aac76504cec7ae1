use rayon::prelude::*;

use crate::compute::program::{KernelDef, Launch, Param};
use crate::error::Result;
use crate::point::Point;

pub const KERNELS: &[KernelDef] = &[KernelDef {
    name: "DistancesMatrixKernel",
    params: &[Param::Input, Param::Int, Param::Output],
    body: distances_matrix,
}];

/// `(points, count, result)`: item `i` writes row `i` of the dense n×n matrix.
fn distances_matrix(launch: &Launch<'_>) -> Result<()> {
    let n = launch.count(1)?;
    let items = launch.range.global_size().min(n);

    let points = launch.read::<Point>(0)?;
    let mut result = launch.write::<f32>(2)?;
    launch.check_bounds("points", n, points.len())?;
    launch.check_bounds("result", n * n, result.len())?;

    if n == 0 {
        return Ok(());
    }

    result[..items * n]
        .par_chunks_mut(n)
        .zip(points[..items].par_iter())
        .for_each(|(row, p)| {
            for (out, q) in row.iter_mut().zip(points[..n].iter()) {
                *out = p.planar_distance(q);
            }
        });

    Ok(())
}
