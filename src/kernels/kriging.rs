use rayon::prelude::*;

use crate::compute::program::{KernelDef, Launch, Param};
use crate::error::Result;
use crate::kriging::common::spherical;
use crate::point::{planar_distance, Point};

pub const KERNELS: &[KernelDef] = &[
    KernelDef {
        name: "SemivariogramKernel",
        params: &[
            Param::Input,
            Param::Input,
            Param::Int,
            Param::Float,
            Param::Float,
            Param::Output,
            Param::Output,
            Param::Output,
        ],
        body: semivariogram,
    },
    KernelDef {
        name: "CovarianceMatrixKernel",
        params: &[
            Param::Input,
            Param::Output,
            Param::Int,
            Param::Double,
            Param::Double,
            Param::Double,
        ],
        body: covariance_matrix,
    },
    KernelDef {
        name: "PredictionCovariance",
        params: &[
            Param::Input,
            Param::Output,
            Param::Float,
            Param::Float,
            Param::Double,
            Param::Double,
            Param::Double,
        ],
        body: prediction_covariance,
    },
];

/// `(points, distances, count, lagMin, lagMax, distancesOut, semivarOut, validCount)`.
///
/// Item `i` visits every `j != i`. Pairs with `lagMin <= d < lagMax` store
/// their distance and squared value difference at `i * count + j` and add one
/// to the counter; other slots are left as the caller filled them.
fn semivariogram(launch: &Launch<'_>) -> Result<()> {
    let n = launch.count(2)?;
    let lag_min = launch.float(3)?;
    let lag_max = launch.float(4)?;
    let items = launch.range.global_size().min(n);

    let points = launch.read::<Point>(0)?;
    let distances = launch.read::<f32>(1)?;
    let mut distances_out = launch.write::<f64>(5)?;
    let mut semivar_out = launch.write::<f64>(6)?;
    let mut valid = launch.write::<i32>(7)?;
    launch.check_bounds("points", n, points.len())?;
    launch.check_bounds("distances", n * n, distances.len())?;
    launch.check_bounds("distances out", n * n, distances_out.len())?;
    launch.check_bounds("semivariance out", n * n, semivar_out.len())?;
    launch.check_bounds("valid count", 1, valid.len())?;

    if n == 0 {
        return Ok(());
    }

    let found: i32 = distances_out[..items * n]
        .par_chunks_mut(n)
        .zip(semivar_out[..items * n].par_chunks_mut(n))
        .enumerate()
        .map(|(i, (d_row, s_row))| {
            let mut count = 0;
            for j in 0..n {
                let d = distances[i * n + j];
                if i == j || !(lag_min <= d && d < lag_max) {
                    continue;
                }
                let dz = points[i].z as f64 - points[j].z as f64;
                d_row[j] = d as f64;
                s_row[j] = dz * dz;
                count += 1;
            }
            count
        })
        .sum();

    //atomic_add semantics: accumulate into whatever the counter holds
    valid[0] += found;

    Ok(())
}

/// `(distances, covariance, count, nugget, range, sill)`: item `i` writes the
/// first `count` entries of row `i` of the `(count + 1)`-wide matrix.
fn covariance_matrix(launch: &Launch<'_>) -> Result<()> {
    let n = launch.count(2)?;
    let nugget = launch.double(3)?;
    let range = launch.double(4)?;
    let sill = launch.double(5)?;
    let items = launch.range.global_size().min(n);
    let stride = n + 1;

    let distances = launch.read::<f32>(0)?;
    let mut covariance = launch.write::<f64>(1)?;
    launch.check_bounds("distances", n * n, distances.len())?;
    launch.check_bounds("covariance", stride * stride, covariance.len())?;

    covariance[..items * stride]
        .par_chunks_mut(stride)
        .enumerate()
        .for_each(|(i, row)| {
            for (j, out) in row[..n].iter_mut().enumerate() {
                *out = spherical(distances[i * n + j] as f64, nugget, range, sill);
            }
        });

    Ok(())
}

/// `(points, r, gridX, gridY, nugget, range, sill)`: `r[i]` is the model value
/// between point `i` and the grid node. Entries past the point count are untouched.
fn prediction_covariance(launch: &Launch<'_>) -> Result<()> {
    let grid_x = launch.float(2)?;
    let grid_y = launch.float(3)?;
    let nugget = launch.double(4)?;
    let range = launch.double(5)?;
    let sill = launch.double(6)?;
    let items = launch.range.global_size();

    let points = launch.read::<Point>(0)?;
    let mut r = launch.write::<f64>(1)?;
    launch.check_bounds("points", items, points.len())?;
    launch.check_bounds("r", items, r.len())?;

    r[..items]
        .par_iter_mut()
        .zip(points[..items].par_iter())
        .for_each(|(out, p)| {
            let h = planar_distance(p.x, p.y, grid_x, grid_y);
            *out = spherical(h as f64, nugget, range, sill);
        });

    Ok(())
}
