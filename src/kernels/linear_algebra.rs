use rayon::prelude::*;

use crate::compute::program::{KernelDef, Launch, Param};
use crate::error::Result;

/// Row-groups that cooperate on one row in the tiled kernel.
pub const ROW_THREADS: usize = 8;

pub const KERNELS: &[KernelDef] = &[
    KernelDef {
        name: "MatVecMulCPUKernel",
        params: &[Param::Input, Param::Input, Param::Int, Param::Output],
        body: mat_vec_mul_rows,
    },
    KernelDef {
        name: "MatVecMulGPUKernel",
        params: &[
            Param::Input,
            Param::Input,
            Param::Output,
            Param::Local,
            Param::Int,
            Param::Int,
        ],
        body: mat_vec_mul_tiled,
    },
    KernelDef {
        name: "VecMul",
        params: &[Param::Input, Param::Input, Param::Output, Param::Int],
        body: vec_mul,
    },
];

/// `(matrix, vector, count, result)`: one row of a square row-major matrix per item.
fn mat_vec_mul_rows(launch: &Launch<'_>) -> Result<()> {
    let n = launch.count(2)?;
    let items = launch.range.global_size().min(n);

    let matrix = launch.read::<f64>(0)?;
    let vector = launch.read::<f64>(1)?;
    let mut result = launch.write::<f64>(3)?;
    launch.check_bounds("matrix", n * n, matrix.len())?;
    launch.check_bounds("vector", n, vector.len())?;
    launch.check_bounds("result", items, result.len())?;

    result[..items]
        .par_iter_mut()
        .enumerate()
        .for_each(|(row, out)| {
            *out = matrix[row * n..(row + 1) * n]
                .iter()
                .zip(vector.iter())
                .map(|(a, b)| a * b)
                .sum();
        });

    Ok(())
}

/// `(matrix, vector, result, scratch, rows, cols)` on a `(rowGroups, 8)` range
/// with `(width, 8)` work-groups. Item `(r, t)` accumulates columns
/// `t, t + 8, ...` of row `r` into local memory; item `(r, 0)` then sums the
/// eight partials. Padding rows past `rows` write nothing.
fn mat_vec_mul_tiled(launch: &Launch<'_>) -> Result<()> {
    let rows = launch.count(4)?;
    let cols = launch.count(5)?;
    let [global_rows, threads] = launch.range.global;
    let [width, local_threads] = launch.range.local_size();

    let matrix = launch.read::<f64>(0)?;
    let vector = launch.read::<f64>(1)?;
    let mut result = launch.write::<f64>(2)?;
    launch.check_bounds("matrix", rows * cols, matrix.len())?;
    launch.check_bounds("vector", cols, vector.len())?;
    launch.check_bounds("result", rows, result.len())?;
    launch.check_bounds(
        "local scratch",
        width * local_threads,
        launch.local_len::<f64>(3)?,
    )?;

    let partials = (0..global_rows / width)
        .into_par_iter()
        .map(|group| {
            let mut scratch = vec![0f64; width * local_threads];
            for lx in 0..width {
                let row = group * width + lx;
                if row >= rows {
                    continue;
                }
                for ly in 0..local_threads {
                    let mut acc = 0.0;
                    let mut col = ly;
                    while col < cols {
                        acc += matrix[row * cols + col] * vector[col];
                        col += threads;
                    }
                    scratch[lx + width * ly] = acc;
                }
            }
            (0..width)
                .map(|lx| (0..local_threads).map(|ly| scratch[lx + width * ly]).sum::<f64>())
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    for (row, value) in partials.into_iter().flatten().enumerate().take(rows) {
        result[row] = value;
    }

    Ok(())
}

/// `(a, b, result, count)`: elementwise product.
fn vec_mul(launch: &Launch<'_>) -> Result<()> {
    let n = launch.count(3)?;
    let items = launch.range.global_size().min(n);

    let a = launch.read::<f64>(0)?;
    let b = launch.read::<f64>(1)?;
    let mut result = launch.write::<f64>(2)?;
    launch.check_bounds("a", items, a.len())?;
    launch.check_bounds("b", items, b.len())?;
    launch.check_bounds("result", items, result.len())?;

    result[..items]
        .par_iter_mut()
        .zip(a[..items].par_iter().zip(b[..items].par_iter()))
        .for_each(|(out, (a, b))| *out = a * b);

    Ok(())
}
